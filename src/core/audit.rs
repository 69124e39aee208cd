//! Cross-check of the analysis and stitching tables.
//!
//! Every analysed (workflow, variant) should have two stitched plates. A
//! stitching row counts when it finished, or when it is younger than
//! `min_age` and may still be running.

use anyhow::Result;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::identity::PlateIdentity;
use crate::core::ledger::{JobKey, JobLedger, JobRecord};
use crate::core::variants::VariantRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingStitching {
    pub workflow_id: String,
    pub variant: String,
    /// Stitching rows that counted towards the pair.
    pub stitched: usize,
}

struct StitchedPlate {
    workflow_id: String,
    variant: String,
    counts: bool,
}

pub async fn find_missing_stitching(
    ledger: &JobLedger,
    registry: &VariantRegistry,
    min_age: Duration,
) -> Result<Vec<MissingStitching>> {
    let mut plates = Vec::new();
    for record in ledger.stitching_records().await? {
        let JobKey::Stitching { plate_name } = &record.key else {
            continue;
        };
        let identity = match PlateIdentity::parse(plate_name) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("audit: ignoring stitching row {}: {}", plate_name, e);
                continue;
            }
        };
        let variant = match registry
            .resolve_variant(&identity.plate_name, identity.is_titration)
            .await
        {
            Ok(variant) => variant,
            Err(e) => {
                warn!("audit: ignoring stitching row {}: {}", plate_name, e);
                continue;
            }
        };
        plates.push(StitchedPlate {
            workflow_id: identity.workflow_id,
            variant,
            counts: counts_as_stitched(&record, min_age),
        });
    }

    let mut missing = Vec::new();
    for analysis in ledger.analysis_records().await? {
        let JobKey::Analysis {
            workflow_id,
            variant,
        } = analysis.key
        else {
            continue;
        };
        let stitched = plates
            .iter()
            .filter(|p| p.counts && p.workflow_id == workflow_id && p.variant == variant)
            .count();
        debug!("audit: {} {} has {} stitched plate(s)", workflow_id, variant, stitched);
        if stitched < 2 {
            missing.push(MissingStitching {
                workflow_id,
                variant,
                stitched,
            });
        }
    }
    Ok(missing)
}

/// Finished, or young enough that it may still finish.
fn counts_as_stitched(record: &JobRecord, min_age: Duration) -> bool {
    record.finished_at.is_some() || record.age_secs <= min_age.as_secs() as i64
}

pub fn format_report(missing: &[MissingStitching]) -> String {
    let mut msg = format!(
        ":warning: Found {} analyses with <2 stitched plates:\n",
        missing.len()
    );
    for m in missing {
        let _ = writeln!(msg, " - {}  {}", m.workflow_id, m.variant);
    }
    msg
}
