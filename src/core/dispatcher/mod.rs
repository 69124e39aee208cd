//! One dispatch run per watched results directory.
//!
//! A run diffs the directory against the stored snapshot, then for every new
//! plate export decides independently whether to stitch the plate and
//! whether its replicate pair is complete enough to analyse. Nothing is kept
//! in memory between runs; the ledger is the only memory of what was
//! submitted.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::core::identity::{self, PlateIdentity};
use crate::core::ledger::{JobKey, JobLedger, JobState, LedgerError};
use crate::core::snapshot::SnapshotStore;
use crate::core::variants::VariantRegistry;
use crate::interfaces::queue::{JobArgs, JobKind, TaskQueue};
use crate::interfaces::slack::{AlertContext, Notifier, Severity};

/// What happened to one job key during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Resubmitted,
    SkippedRecent,
    SkippedFinished,
}

impl Action {
    pub fn submitted(self) -> bool {
        matches!(self, Action::Created | Action::Resubmitted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlateReport {
    pub path: PathBuf,
    pub plate_name: String,
    /// `None` when the plate is not a 384-well plate.
    pub stitching: Option<Action>,
    /// `None` while the replicate pair is incomplete or ambiguous.
    pub analysis: Option<Action>,
    pub replicates_found: usize,
    /// Keys whose processing was aborted.
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub plates: Vec<PlateReport>,
    /// Paths that could not be identified at all.
    pub rejected: Vec<PathBuf>,
}

impl RunSummary {
    pub fn submitted(&self) -> usize {
        self.plates
            .iter()
            .map(|p| {
                p.stitching.is_some_and(Action::submitted) as usize
                    + p.analysis.is_some_and(Action::submitted) as usize
            })
            .sum()
    }

    pub fn failures(&self) -> usize {
        self.rejected.len() + self.plates.iter().map(|p| p.failures.len()).sum::<usize>()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Listing digest matches the stored one.
    Unchanged,
    /// The listing changed but nothing was added (e.g. a deletion).
    NoNewDirectories,
    Dispatched(RunSummary),
}

pub struct Dispatcher {
    name: String,
    snapshot: SnapshotStore,
    ledger: Arc<JobLedger>,
    registry: Arc<VariantRegistry>,
    queue: Arc<dyn TaskQueue>,
    notifier: Arc<dyn Notifier>,
    index_file: String,
}

impl Dispatcher {
    pub fn new(
        name: impl Into<String>,
        snapshot: SnapshotStore,
        ledger: Arc<JobLedger>,
        registry: Arc<VariantRegistry>,
        queue: Arc<dyn TaskQueue>,
        notifier: Arc<dyn Notifier>,
        index_file: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            snapshot,
            ledger,
            registry,
            queue,
            notifier,
            index_file: index_file.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Diff the results directory and dispatch every new plate. The
    /// snapshot is committed even when individual plates fail.
    pub async fn dispatch_run(&self) -> Result<RunOutcome> {
        let listing = self.snapshot.scan().await?;
        let stored = self.snapshot.stored_digest().await?;
        if stored.as_deref() == Some(listing.digest.as_str()) {
            info!(
                "[{}] hash of {} contents unchanged, nothing to do",
                self.name,
                self.snapshot.results_dir().display()
            );
            return Ok(RunOutcome::Unchanged);
        }

        let fresh = self.snapshot.new_entries(&listing).await?;
        if fresh.is_empty() {
            info!(
                "[{}] {} changed but no new directories found",
                self.name,
                self.snapshot.results_dir().display()
            );
            self.snapshot.commit(&listing).await?;
            return Ok(RunOutcome::NoNewDirectories);
        }

        info!("[{}] {} new directories", self.name, fresh.len());
        let mut summary = RunSummary::default();
        for name in &fresh {
            let path = self.snapshot.entry_path(name);
            match self.dispatch_plate(&path).await {
                Ok(report) => {
                    if !report.failures.is_empty() {
                        warn!(
                            "[{}] {} finished with {} failure(s)",
                            self.name,
                            report.plate_name,
                            report.failures.len()
                        );
                    }
                    summary.plates.push(report);
                }
                Err(e) => {
                    error!("[{}] skipping {}: {}", self.name, path.display(), e);
                    summary.rejected.push(path);
                }
            }
        }

        self.snapshot.commit(&listing).await?;
        info!(
            "[{}] run complete: {} job(s) submitted, {} failure(s)",
            self.name,
            summary.submitted(),
            summary.failures()
        );
        Ok(RunOutcome::Dispatched(summary))
    }

    /// Stitch the plate if it is a 384-well plate, then analyse its
    /// replicate pair if both plates are on disk.
    ///
    /// Identity and variant failures reject the whole path (after alerting).
    /// Failures on one job key are alerted and recorded in the report
    /// without touching the other key.
    pub async fn dispatch_plate(&self, path: &Path) -> Result<PlateReport> {
        let plate = match self.resolve(path).await {
            Ok(plate) => plate,
            Err(e) => {
                let ctx = AlertContext::message(format!("cannot identify {}: {}", path.display(), e))
                    .with_plate(identity::plate_name(path));
                self.notifier.notify(Severity::Warning, &ctx).await;
                return Err(e);
            }
        };
        let ResolvedPlate {
            identity,
            variant,
            plate_numbers,
        } = plate;

        let mut report = PlateReport {
            path: path.to_path_buf(),
            plate_name: identity.plate_name.clone(),
            stitching: None,
            analysis: None,
            replicates_found: 0,
            failures: Vec::new(),
        };

        if identity::is_384_well_plate(path, &identity.workflow_id) {
            let key = JobKey::stitching(&identity.plate_name);
            let kind = if identity.is_titration {
                JobKind::TitrationStitching
            } else {
                JobKind::Stitching
            };
            let args = JobArgs::IndexFile(path.join(&self.index_file));
            match self.advance(&key, kind, &args).await {
                Ok(action) => report.stitching = Some(action),
                Err(e) => self.escalate(&key, &identity, &variant, e, &mut report).await,
            }
        } else {
            warn!("{} is not a 384-well plate, skipping stitching", identity.plate_name);
        }

        let replicates = match self.find_replicates(&identity, &plate_numbers).await {
            Ok(paths) => paths,
            Err(e) => {
                let key = analysis_key(&identity, &variant);
                self.escalate(&key, &identity, &variant, e, &mut report).await;
                return Ok(report);
            }
        };
        report.replicates_found = replicates.len();
        info!(
            "{} {}: {} of 2 replicate plates on disk",
            identity.workflow_id,
            variant,
            replicates.len()
        );

        if let Some(pair) = replicate_pair(replicates) {
            let key = analysis_key(&identity, &variant);
            let kind = if identity.is_titration {
                JobKind::TitrationAnalysis
            } else {
                JobKind::Analysis
            };
            match self.advance(&key, kind, &JobArgs::PlatePair(pair)).await {
                Ok(action) => report.analysis = Some(action),
                Err(e) => self.escalate(&key, &identity, &variant, e, &mut report).await,
            }
        }
        Ok(report)
    }

    async fn resolve(&self, path: &Path) -> Result<ResolvedPlate> {
        let identity = PlateIdentity::parse(path)?;
        let variant = self
            .registry
            .resolve_variant(&identity.plate_name, identity.is_titration)
            .await?;
        let plate_numbers = self.registry.variant_plate_numbers(&variant).await?;
        Ok(ResolvedPlate {
            identity,
            variant,
            plate_numbers,
        })
    }

    /// Four-way branch on the ledger state of `key`.
    async fn advance(&self, key: &JobKey, kind: JobKind, args: &JobArgs) -> Result<Action> {
        match self.ledger.state(key).await? {
            JobState::Finished => {
                info!("{} has already finished, skipping", key);
                Ok(Action::SkippedFinished)
            }
            JobState::Recent => {
                info!("{} was recently submitted, skipping", key);
                Ok(Action::SkippedRecent)
            }
            JobState::Stale => {
                info!("{} is stale, resubmitting", key);
                self.ledger.resubmit(key).await?;
                self.queue.enqueue(kind.queue_name(), kind, args).await?;
                Ok(Action::Resubmitted)
            }
            JobState::New => {
                self.ledger.create(key).await?;
                self.queue.enqueue(kind.queue_name(), kind, args).await?;
                info!("{} launched", key);
                Ok(Action::Created)
            }
        }
    }

    /// Every plate export of the same workflow and role whose plate number
    /// belongs to the variant. Rescans the directory with the snapshot's name
    /// filter: the partner plate may have appeared in an earlier run.
    async fn find_replicates(
        &self,
        identity: &PlateIdentity,
        plate_numbers: &[u8; 2],
    ) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(self.snapshot.results_dir()).await?;
        let filter = self.snapshot.filter();
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let exported = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| filter.matches(n));
            if exported
                && identity::is_matching_plate(&path, &identity.workflow_id, identity.role, plate_numbers)
            {
                found.push(path);
            }
        }
        found.sort();
        Ok(found)
    }

    async fn escalate(
        &self,
        key: &JobKey,
        identity: &PlateIdentity,
        variant: &str,
        err: anyhow::Error,
        report: &mut PlateReport,
    ) {
        let severity = if err.downcast_ref::<LedgerError>().is_some() {
            Severity::Alert
        } else {
            Severity::Warning
        };
        error!("{} aborted: {}", key, err);
        let ctx = AlertContext::message(format!("{} aborted: {}", key, err))
            .with_workflow(&identity.workflow_id, variant)
            .with_plate(&identity.plate_name);
        self.notifier.notify(severity, &ctx).await;
        report.failures.push(key.to_string());
    }
}

struct ResolvedPlate {
    identity: PlateIdentity,
    variant: String,
    plate_numbers: [u8; 2],
}

fn analysis_key(identity: &PlateIdentity, variant: &str) -> JobKey {
    if identity.is_titration {
        JobKey::titration(&identity.workflow_id, variant)
    } else {
        JobKey::analysis(&identity.workflow_id, variant)
    }
}

/// The sorted pair, only when exactly two distinct replicate plates match.
/// Two exports of the same plate are not a pair.
fn replicate_pair(mut paths: Vec<PathBuf>) -> Option<[PathBuf; 2]> {
    if paths.len() > 2 {
        let names: Vec<String> = paths.iter().map(identity::plate_name).collect();
        warn!(
            "{} plates match one replicate pair ({}), cannot tell which two to analyse",
            paths.len(),
            names.join(", ")
        );
        return None;
    }
    if paths.len() != 2 {
        return None;
    }
    paths.sort();
    let second = paths.pop()?;
    let first = paths.pop()?;
    let same_plate = match (PlateIdentity::parse(&first), PlateIdentity::parse(&second)) {
        (Ok(a), Ok(b)) => a.plate_number == b.plate_number,
        _ => true,
    };
    if same_plate {
        warn!(
            "{} and {} are exports of the same plate, not a replicate pair",
            first.display(),
            second.display()
        );
        return None;
    }
    Some([first, second])
}
