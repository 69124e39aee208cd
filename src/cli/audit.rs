use anyhow::{Context, Result};
use std::time::Duration;

use super::Services;
use crate::core::audit::{find_missing_stitching, format_report};
use crate::core::config::LauncherConfig;
use crate::core::terminal::{print_finding, print_success, print_warn};
use crate::interfaces::slack::{AlertContext, Severity};

const DEFAULT_MIN_AGE_MINS: u64 = 60;

/// `plate-launcher audit`: list analyses that lack two stitched plates.
pub(super) async fn run_audit(config: LauncherConfig, min_age: Option<&str>, notify: bool) -> Result<()> {
    let min_age_mins = match min_age {
        Some(v) => v
            .parse::<u64>()
            .with_context(|| format!("--min-age-mins expects whole minutes, got '{}'", v))?,
        None => DEFAULT_MIN_AGE_MINS,
    };
    let services = Services::open(config, !notify).await?;
    let missing = find_missing_stitching(
        &services.ledger,
        &services.registry,
        Duration::from_secs(min_age_mins * 60),
    )
    .await?;

    if missing.is_empty() {
        print_success("Every analysis has two stitched plates");
        return Ok(());
    }
    print_warn(&format!(
        "{} analyses with fewer than two stitched plates",
        missing.len()
    ));
    for m in &missing {
        print_finding(&format!("{}  {}  ({} stitched)", m.workflow_id, m.variant, m.stitched));
    }
    if notify {
        services
            .notifier
            .notify(Severity::Warning, &AlertContext::message(format_report(&missing)))
            .await;
    }
    Ok(())
}
