use anyhow::{Result, bail};
use std::path::PathBuf;

use super::Services;
use crate::core::completion::{infer_kind, record_completion};
use crate::core::config::LauncherConfig;
use crate::core::terminal::{print_success, print_warn};
use crate::interfaces::queue::JobKind;

/// `plate-launcher finish [--kind KIND] ARG...`, called by workers on success.
pub(super) async fn run_finish(config: LauncherConfig, kind: Option<&str>, args: &[String]) -> Result<()> {
    if args.is_empty() {
        bail!("finish needs the job arguments: an index file, or two plate directories");
    }
    let paths: Vec<PathBuf> = args.iter().map(PathBuf::from).collect();
    let kind = match kind {
        Some(k) => JobKind::parse(k)?,
        None => infer_kind(&paths)?,
    };
    let services = Services::open(config, false).await?;
    let updated = record_completion(
        kind,
        &paths,
        &services.ledger,
        &services.registry,
        services.notifier.as_ref(),
    )
    .await?;
    if updated {
        print_success(&format!("{} job marked finished", kind.as_str()));
    } else {
        print_warn(&format!("{} job was already finished", kind.as_str()));
    }
    Ok(())
}
