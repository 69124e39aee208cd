mod audit;
mod dispatch;
mod finish;
mod variants;

use anyhow::Result;
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::LauncherConfig;
use crate::core::errors::EnvironmentError;
use crate::core::ledger::JobLedger;
use crate::core::terminal;
use crate::core::variants::VariantRegistry;
use crate::interfaces::queue::{DryRunQueue, HttpTaskQueue, TaskQueue};
use crate::interfaces::slack::{LogNotifier, Notifier, SlackNotifier};

fn print_help() {
    terminal::print_header("plate-launcher");

    println!("\n {}", style("Dispatch").bold());
    terminal::print_command("run [--watch NAME] [--dry-run]", "Run one dispatch pass");
    terminal::print_command("watch [--dry-run]", "Dispatch on the configured cron schedule");

    println!("\n {}", style("Workers").bold());
    terminal::print_command("finish [--kind KIND] ARG...", "Mark a finished job in the ledger");

    println!("\n {}", style("Reference data").bold());
    terminal::print_command("variants list", "Show variant to plate id mappings");
    terminal::print_command("variants add NAME ID1 ID2", "Add or replace a mapping");
    terminal::print_command("variants import FILE", "Load [[variant]] tables from TOML");

    println!("\n {}", style("Diagnostics").bold());
    terminal::print_command(
        "audit [--min-age-mins N] [--notify]",
        "Find analyses without two stitched plates",
    );

    println!(
        "\n {} {} <command> [--config PATH]\n",
        style("Usage:").bold(),
        style("plate-launcher").green()
    );
}

/// Flags shared by every command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CommonFlags {
    pub config: Option<PathBuf>,
    pub dry_run: bool,
    /// Arguments that are not common flags, in order.
    pub rest: Vec<String>,
}

pub(crate) fn parse_common_flags(args: &[String], start: usize) -> CommonFlags {
    let mut flags = CommonFlags::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    flags.config = Some(PathBuf::from(&args[i + 1]));
                    i += 2;
                } else {
                    i += 1;
                }
            }
            "--dry-run" => {
                flags.dry_run = true;
                i += 1;
            }
            other => {
                flags.rest.push(other.to_string());
                i += 1;
            }
        }
    }
    flags
}

/// Value following `name` in `rest`, removing both from the list.
pub(crate) fn take_option(rest: &mut Vec<String>, name: &str) -> Option<String> {
    let pos = rest.iter().position(|a| a == name)?;
    if pos + 1 < rest.len() {
        let value = rest.remove(pos + 1);
        rest.remove(pos);
        Some(value)
    } else {
        rest.remove(pos);
        None
    }
}

pub(crate) fn take_flag(rest: &mut Vec<String>, name: &str) -> bool {
    match rest.iter().position(|a| a == name) {
        Some(pos) => {
            rest.remove(pos);
            true
        }
        None => false,
    }
}

/// Stores and collaborators shared by all commands.
pub(crate) struct Services {
    pub config: LauncherConfig,
    pub ledger: Arc<JobLedger>,
    pub registry: Arc<VariantRegistry>,
    pub notifier: Arc<dyn Notifier>,
}

impl Services {
    /// `quiet` logs alerts instead of sending them (dry runs and local
    /// maintenance commands).
    pub async fn open(config: LauncherConfig, quiet: bool) -> Result<Self> {
        let notifier: Arc<dyn Notifier> = if quiet {
            Arc::new(LogNotifier)
        } else {
            match config.webhook_url()? {
                Some(url) => Arc::new(SlackNotifier::new(url, &config.alerts.username)),
                None => Arc::new(LogNotifier),
            }
        };
        let ledger = JobLedger::open(&config.ledger_db, config.task_timeout(), config.retry.clone())
            .await?;
        let registry = VariantRegistry::open(&config.ledger_db, config.retry.clone()).await?;
        Ok(Self {
            config,
            ledger: Arc::new(ledger),
            registry: Arc::new(registry),
            notifier,
        })
    }

    pub fn queue(&self, dry_run: bool) -> Result<Arc<dyn TaskQueue>> {
        if dry_run {
            return Ok(Arc::new(DryRunQueue));
        }
        let endpoint = self
            .config
            .queue
            .endpoint
            .as_deref()
            .ok_or(EnvironmentError::NoQueueEndpoint)?;
        let timeout = Duration::from_secs(self.config.queue.timeout_secs);
        Ok(Arc::new(HttpTaskQueue::new(endpoint, timeout)?))
    }
}

async fn load(flags: &CommonFlags) -> Result<LauncherConfig> {
    let config = LauncherConfig::load(flags.config.as_deref()).await?;
    crate::logging::init(&config.logging.level, config.logging.file.as_deref())?;
    Ok(config)
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let cmd = args[1].as_str();
    match cmd {
        "run" => {
            let mut flags = parse_common_flags(&args, 2);
            let watch = take_option(&mut flags.rest, "--watch");
            let config = load(&flags).await?;
            dispatch::run_once(config, watch.as_deref(), flags.dry_run).await
        }
        "watch" => {
            let flags = parse_common_flags(&args, 2);
            let config = load(&flags).await?;
            dispatch::run_scheduled(config, flags.dry_run).await
        }
        "finish" => {
            let mut flags = parse_common_flags(&args, 2);
            let kind = take_option(&mut flags.rest, "--kind");
            let config = load(&flags).await?;
            finish::run_finish(config, kind.as_deref(), &flags.rest).await
        }
        "variants" => {
            let flags = parse_common_flags(&args, 2);
            let config = load(&flags).await?;
            variants::run_variants_command(config, &flags.rest).await
        }
        "audit" => {
            let mut flags = parse_common_flags(&args, 2);
            let min_age = take_option(&mut flags.rest, "--min-age-mins");
            let notify = take_flag(&mut flags.rest, "--notify");
            let config = load(&flags).await?;
            audit::run_audit(config, min_age.as_deref(), notify).await
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        _ => {
            print_help();
            anyhow::bail!("Unknown command: {}", cmd)
        }
    }
}
