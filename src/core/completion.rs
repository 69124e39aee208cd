//! Worker completion hook.
//!
//! Workers call `plate-launcher finish` with the same arguments they were
//! enqueued with. The job kind is inferred from the argument shape and the
//! ledger key is derived from the plate names.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::core::identity::{self, PlateIdentity};
use crate::core::ledger::{JobKey, JobLedger, LedgerError};
use crate::core::variants::VariantRegistry;
use crate::interfaces::queue::JobKind;
use crate::interfaces::slack::{AlertContext, Notifier, Severity};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("{kind} jobs take {expected} argument(s), got {got}")]
    WrongArgCount {
        kind: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("cannot infer a job kind from {0} argument(s)")]
    UnknownShape(usize),
    #[error("plates {0} and {1} mix titration and assay roles")]
    MixedPlateRoles(String, String),
    #[error("plates disagree on workflow id: {0} vs {1}")]
    WorkflowMismatch(String, String),
    #[error("plates disagree on variant: {0} vs {1}")]
    VariantMismatch(String, String),
}

/// One argument is a stitching index file; two are an analysis pair.
pub fn infer_kind(args: &[PathBuf]) -> Result<JobKind> {
    match args {
        [index_file] => {
            let plate = plate_dir_name(index_file);
            if identity::is_titration_plate(&plate) {
                Ok(JobKind::TitrationStitching)
            } else {
                Ok(JobKind::Stitching)
            }
        }
        [a, b] => {
            let (name_a, name_b) = (identity::plate_name(a), identity::plate_name(b));
            match (
                identity::is_titration_plate(&name_a),
                identity::is_titration_plate(&name_b),
            ) {
                (true, true) => Ok(JobKind::TitrationAnalysis),
                (false, false) => Ok(JobKind::Analysis),
                _ => Err(CompletionError::MixedPlateRoles(name_a, name_b).into()),
            }
        }
        other => Err(CompletionError::UnknownShape(other.len()).into()),
    }
}

/// Ledger key of a finished job.
pub async fn completion_key(
    kind: JobKind,
    args: &[PathBuf],
    registry: &VariantRegistry,
) -> Result<JobKey> {
    if kind.is_stitching() {
        let [index_file] = args else {
            return Err(CompletionError::WrongArgCount {
                kind: kind.as_str(),
                expected: 1,
                got: args.len(),
            }
            .into());
        };
        return Ok(JobKey::stitching(plate_dir_name(index_file)));
    }

    let [a, b] = args else {
        return Err(CompletionError::WrongArgCount {
            kind: kind.as_str(),
            expected: 2,
            got: args.len(),
        }
        .into());
    };
    let first = PlateIdentity::parse(a)?;
    let second = PlateIdentity::parse(b)?;
    if first.workflow_id != second.workflow_id {
        return Err(
            CompletionError::WorkflowMismatch(first.workflow_id, second.workflow_id).into(),
        );
    }
    let variant = registry
        .resolve_variant(&first.plate_name, first.is_titration)
        .await?;
    let other = registry
        .resolve_variant(&second.plate_name, second.is_titration)
        .await?;
    if variant != other {
        return Err(CompletionError::VariantMismatch(variant, other).into());
    }
    Ok(match kind {
        JobKind::TitrationAnalysis => JobKey::titration(first.workflow_id, variant),
        _ => JobKey::analysis(first.workflow_id, variant),
    })
}

/// Mark the job finished. A missing ledger row is alerted before the
/// error is returned.
pub async fn record_completion(
    kind: JobKind,
    args: &[PathBuf],
    ledger: &JobLedger,
    registry: &VariantRegistry,
    notifier: &dyn Notifier,
) -> Result<bool> {
    let key = completion_key(kind, args, registry).await?;
    match ledger.mark_finished(&key).await {
        Ok(updated) => {
            info!("{} {} complete", kind.as_str(), key);
            Ok(updated)
        }
        Err(e) => {
            if let Some(LedgerError::MissingRecord(_)) = e.downcast_ref::<LedgerError>() {
                let mut ctx = AlertContext::message(format!("no ledger row for {}, cannot update", key));
                if let JobKey::Analysis {
                    workflow_id,
                    variant,
                }
                | JobKey::Titration {
                    workflow_id,
                    variant,
                } = &key
                {
                    ctx = ctx.with_workflow(workflow_id, variant);
                }
                notifier.notify(Severity::Alert, &ctx).await;
            }
            Err(e)
        }
    }
}

/// Plate name of the directory holding `path`, or of `path` itself when it
/// is a plate directory.
fn plate_dir_name(path: &Path) -> String {
    if PlateIdentity::parse(path).is_ok() {
        return identity::plate_name(path);
    }
    match path.parent() {
        Some(parent) => identity::plate_name(parent),
        None => identity::plate_name(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::{JobState, test_ledger};
    use crate::core::variants::test_registry;
    use crate::interfaces::slack::testing::RecordingNotifier;

    fn paths(args: &[&str]) -> Vec<PathBuf> {
        args.iter().map(PathBuf::from).collect()
    }

    const INDEX: &str = "/d/S01000042__2021-05-14T13_44_30-Measurement 1/indexfile.txt";
    const S01: &str = "/d/S01000042__2021-05-14T13_44_30-Measurement 1";
    const S02: &str = "/d/S02000042__2021-05-14T14_02_11-Measurement 1";
    const T01: &str = "/d/T01000042__2021-05-14T13_44_30-Measurement 1";
    const T02: &str = "/d/T02000042__2021-05-14T14_02_11-Measurement 1";

    #[test]
    fn kind_follows_argument_shape() {
        assert_eq!(infer_kind(&paths(&[INDEX])).unwrap(), JobKind::Stitching);
        assert_eq!(
            infer_kind(&paths(&[&format!("{}/indexfile.txt", T01)])).unwrap(),
            JobKind::TitrationStitching
        );
        assert_eq!(infer_kind(&paths(&[S01, S02])).unwrap(), JobKind::Analysis);
        assert_eq!(
            infer_kind(&paths(&[T01, T02])).unwrap(),
            JobKind::TitrationAnalysis
        );
    }

    #[test]
    fn mixed_or_odd_shapes_are_rejected() {
        let err = infer_kind(&paths(&[S01, T02])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CompletionError>(),
            Some(CompletionError::MixedPlateRoles(..))
        ));
        let err = infer_kind(&paths(&[S01, S02, T01])).unwrap_err();
        assert_eq!(
            err.downcast_ref::<CompletionError>(),
            Some(&CompletionError::UnknownShape(3))
        );
    }

    #[tokio::test]
    async fn stitching_key_is_the_parent_plate() {
        let registry = test_registry(&[]).await;
        let key = completion_key(JobKind::Stitching, &paths(&[INDEX]), &registry)
            .await
            .unwrap();
        assert_eq!(key, JobKey::stitching("S01000042"));
    }

    #[tokio::test]
    async fn analysis_key_uses_shared_workflow_and_variant() {
        let registry = test_registry(&[("England2", "S01", "S02")]).await;
        let key = completion_key(JobKind::Analysis, &paths(&[S01, S02]), &registry)
            .await
            .unwrap();
        assert_eq!(key, JobKey::analysis("000042", "England2"));
        let key = completion_key(JobKind::TitrationAnalysis, &paths(&[T01, T02]), &registry)
            .await
            .unwrap();
        assert_eq!(key, JobKey::titration("000042", "England2"));
    }

    #[tokio::test]
    async fn plates_must_agree() {
        let registry = test_registry(&[("England2", "S01", "S02"), ("B117", "S03", "S04")]).await;
        let other_workflow = "/d/S02000043__2021-05-14T14_02_11-Measurement 1";
        let err = completion_key(JobKind::Analysis, &paths(&[S01, other_workflow]), &registry)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CompletionError>(),
            Some(CompletionError::WorkflowMismatch(..))
        ));
        let other_variant = "/d/S03000042__2021-05-14T14_02_11-Measurement 1";
        let err = completion_key(JobKind::Analysis, &paths(&[S01, other_variant]), &registry)
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<CompletionError>(),
            Some(&CompletionError::VariantMismatch(
                "England2".to_string(),
                "B117".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn record_completion_finishes_the_row() {
        let registry = test_registry(&[("England2", "S01", "S02")]).await;
        let ledger = test_ledger();
        let notifier = RecordingNotifier::default();
        let key = JobKey::analysis("000042", "England2");
        ledger.create(&key).await.unwrap();

        let args = paths(&[S01, S02]);
        assert!(record_completion(JobKind::Analysis, &args, &ledger, &registry, &notifier)
            .await
            .unwrap());
        assert_eq!(ledger.state(&key).await.unwrap(), JobState::Finished);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn record_completion_alerts_on_missing_row() {
        let registry = test_registry(&[]).await;
        let ledger = test_ledger();
        let notifier = RecordingNotifier::default();
        let err = record_completion(
            JobKind::Stitching,
            &paths(&[INDEX]),
            &ledger,
            &registry,
            &notifier,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LedgerError>(),
            Some(LedgerError::MissingRecord(_))
        ));
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Severity::Alert);
    }
}
