use anyhow::{Result, bail};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::Services;
use crate::core::config::{LauncherConfig, WatchConfig};
use crate::core::dispatcher::{Dispatcher, PlateReport, RunOutcome};
use crate::core::snapshot::SnapshotStore;
use crate::core::terminal::{
    print_error, print_info, print_status, print_step, print_success, print_warn,
};
use crate::interfaces::queue::TaskQueue;

async fn build_dispatcher(
    services: &Services,
    target: &WatchConfig,
    queue: Arc<dyn TaskQueue>,
) -> Result<Dispatcher> {
    let snapshot = SnapshotStore::open(
        &target.snapshot_db,
        &target.results_dir,
        target.filter(),
        services.config.retry.clone(),
    )
    .await?;
    Ok(Dispatcher::new(
        &target.name,
        snapshot,
        services.ledger.clone(),
        services.registry.clone(),
        queue,
        services.notifier.clone(),
        &services.config.index_file,
    ))
}

fn select_targets<'a>(services: &'a Services, watch: Option<&str>) -> Result<Vec<&'a WatchConfig>> {
    Ok(match watch {
        Some(name) => vec![services.config.watch_target(name)?],
        None => services.config.watch.iter().collect(),
    })
}

async fn build_all(services: &Services, dry_run: bool) -> Result<Vec<Dispatcher>> {
    let queue = services.queue(dry_run)?;
    let mut dispatchers = Vec::with_capacity(services.config.watch.len());
    for target in &services.config.watch {
        dispatchers.push(build_dispatcher(services, target, queue.clone()).await?);
    }
    Ok(dispatchers)
}

fn analysis_label(plate: &PlateReport) -> String {
    match plate.analysis {
        Some(action) => format!("{:?}", action),
        None if plate.replicates_found > 2 => {
            format!("ambiguous ({} matching plates)", plate.replicates_found)
        }
        None => format!("waiting ({}/2 plates)", plate.replicates_found),
    }
}

fn report(name: &str, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Unchanged => print_info(&format!("[{}] no changes", name)),
        RunOutcome::NoNewDirectories => {
            print_info(&format!("[{}] listing changed, no new plates", name))
        }
        RunOutcome::Dispatched(summary) => {
            for plate in &summary.plates {
                let stitching = plate
                    .stitching
                    .map(|a| format!("{:?}", a))
                    .unwrap_or_else(|| "-".to_string());
                let analysis = analysis_label(plate);
                print_status(
                    &plate.plate_name,
                    &format!("stitching: {}, analysis: {}", stitching, analysis),
                );
            }
            for path in &summary.rejected {
                print_warn(&format!("rejected {}", path.display()));
            }
            if summary.failures() > 0 {
                print_warn(&format!(
                    "[{}] {} job(s) submitted, {} failure(s)",
                    name,
                    summary.submitted(),
                    summary.failures()
                ));
            } else {
                print_success(&format!("[{}] {} job(s) submitted", name, summary.submitted()));
            }
        }
    }
}

/// `plate-launcher run`: one pass over each selected watch target. A failing
/// target does not stop the others; the command fails once all have run.
pub(super) async fn run_once(config: LauncherConfig, watch: Option<&str>, dry_run: bool) -> Result<()> {
    let services = Services::open(config, dry_run).await?;
    let targets = select_targets(&services, watch)?;
    let queue = services.queue(dry_run)?;
    let mut failed = Vec::new();
    for target in &targets {
        print_step(&format!("Scanning {}", target.name));
        let outcome = match build_dispatcher(&services, target, queue.clone()).await {
            Ok(dispatcher) => dispatcher.dispatch_run().await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(outcome) => report(&target.name, &outcome),
            Err(e) => {
                error!("[{}] dispatch run failed: {:#}", target.name, e);
                print_error(&format!("[{}] {:#}", target.name, e));
                failed.push(target.name.as_str());
            }
        }
    }
    if !failed.is_empty() {
        bail!(
            "{} of {} watch target(s) failed: {}",
            failed.len(),
            targets.len(),
            failed.join(", ")
        );
    }
    Ok(())
}

/// `plate-launcher watch`: run every target on the cron schedule until
/// Ctrl-C. A tick that fires while the previous pass is still running is
/// skipped.
pub(super) async fn run_scheduled(config: LauncherConfig, dry_run: bool) -> Result<()> {
    let cron = config.schedule.cron.clone();
    let services = Services::open(config, dry_run).await?;
    let dispatchers = Arc::new(build_all(&services, dry_run).await?);
    let running = Arc::new(tokio::sync::Mutex::new(()));

    let mut scheduler = tokio_cron_scheduler::JobScheduler::new().await?;
    let job = tokio_cron_scheduler::Job::new_async(cron.as_str(), move |_uuid, mut _l| {
        let dispatchers = dispatchers.clone();
        let running = running.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("Previous dispatch pass still running, skipping this tick");
                return;
            };
            for dispatcher in dispatchers.iter() {
                match dispatcher.dispatch_run().await {
                    Ok(outcome) => info!("[{}] {}", dispatcher.name(), outcome_label(&outcome)),
                    Err(e) => error!("[{}] dispatch run failed: {:#}", dispatcher.name(), e),
                }
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;
    print_success(&format!("Watching on schedule '{}'. Press Ctrl+C to stop.", cron));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down scheduler");
    scheduler.shutdown().await?;
    Ok(())
}

fn outcome_label(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Unchanged => "unchanged".to_string(),
        RunOutcome::NoNewDirectories => "no new directories".to_string(),
        RunOutcome::Dispatched(summary) => format!(
            "{} plate(s), {} submitted, {} failure(s)",
            summary.plates.len() + summary.rejected.len(),
            summary.submitted(),
            summary.failures()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatcher::Action;
    use crate::core::ledger::{JobKey, JobLedger, JobState};
    use crate::core::retry::RetryPolicy;
    use crate::core::variants::{VariantMapping, VariantRegistry};
    use std::path::PathBuf;
    use std::time::Duration;

    fn two_target_config(root: &std::path::Path) -> LauncherConfig {
        let content = format!(
            r#"
ledger_db = '{root}/ledger.db'

[[watch]]
name = "assay"
results_dir = '{root}/NA_raw_data'
snapshot_db = '{root}/snapshot.db'

[[watch]]
name = "titration"
results_dir = '{root}/Titration_raw_data'
snapshot_db = '{root}/snapshot_titration.db'
prefix = "T"

[alerts]
enabled = false

[retry]
total_tries = 0
"#,
            root = root.display()
        );
        LauncherConfig::parse(&content).unwrap()
    }

    #[tokio::test]
    async fn failing_target_does_not_block_the_next_one() {
        let root = std::env::temp_dir().join(format!("plate-launcher-cli-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(root.join("NA_raw_data")).unwrap();
        std::fs::create_dir_all(
            root.join("Titration_raw_data")
                .join("T01000042__2021-05-14T13_44_30-Measurement 1"),
        )
        .unwrap();
        let config = two_target_config(&root);
        let registry = VariantRegistry::open(&config.ledger_db, RetryPolicy::none())
            .await
            .unwrap();
        registry
            .add(VariantMapping::new("England2", "S01", "S02"))
            .await
            .unwrap();
        let ledger_db = config.ledger_db.clone();

        let err = run_once(config, None, true).await.unwrap_err();
        assert!(err.to_string().contains("1 of 2 watch target(s) failed: assay"));

        let ledger = JobLedger::open(&ledger_db, Duration::from_secs(1800), RetryPolicy::none())
            .await
            .unwrap();
        let key = JobKey::stitching("T01000042");
        assert_eq!(ledger.state(&key).await.unwrap(), JobState::Recent);
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn named_target_skips_the_failing_one() {
        let root = std::env::temp_dir().join(format!("plate-launcher-cli-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(root.join("NA_raw_data")).unwrap();
        std::fs::create_dir_all(
            root.join("Titration_raw_data")
                .join("T01000042__2021-05-14T13_44_30-Measurement 1"),
        )
        .unwrap();
        let config = two_target_config(&root);
        let registry = VariantRegistry::open(&config.ledger_db, RetryPolicy::none())
            .await
            .unwrap();
        registry
            .add(VariantMapping::new("England2", "S01", "S02"))
            .await
            .unwrap();

        run_once(config, Some("titration"), true).await.unwrap();
        std::fs::remove_dir_all(root).ok();
    }

    fn plate(analysis: Option<Action>, replicates_found: usize) -> PlateReport {
        PlateReport {
            path: PathBuf::from("/d/S01000042__2021-05-14T13_44_30-Measurement 1"),
            plate_name: "S01000042".to_string(),
            stitching: Some(Action::Created),
            analysis,
            replicates_found,
            failures: Vec::new(),
        }
    }

    #[test]
    fn analysis_label_distinguishes_waiting_from_ambiguous() {
        assert_eq!(analysis_label(&plate(Some(Action::Created), 2)), "Created");
        assert_eq!(analysis_label(&plate(None, 1)), "waiting (1/2 plates)");
        assert_eq!(analysis_label(&plate(None, 3)), "ambiguous (3 matching plates)");
    }
}
