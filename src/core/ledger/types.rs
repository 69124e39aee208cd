use std::fmt;
use std::time::Duration;

/// Identifies one logical job. Analyses are tracked per (workflow, variant),
/// stitching per plate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobKey {
    Analysis { workflow_id: String, variant: String },
    Titration { workflow_id: String, variant: String },
    Stitching { plate_name: String },
}

impl JobKey {
    pub fn analysis(workflow_id: impl Into<String>, variant: impl Into<String>) -> Self {
        JobKey::Analysis {
            workflow_id: workflow_id.into(),
            variant: variant.into(),
        }
    }

    pub fn titration(workflow_id: impl Into<String>, variant: impl Into<String>) -> Self {
        JobKey::Titration {
            workflow_id: workflow_id.into(),
            variant: variant.into(),
        }
    }

    pub fn stitching(plate_name: impl Into<String>) -> Self {
        JobKey::Stitching {
            plate_name: plate_name.into(),
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            JobKey::Analysis { .. } => "analysis_jobs",
            JobKey::Titration { .. } => "titration_jobs",
            JobKey::Stitching { .. } => "stitching_jobs",
        }
    }

    pub(crate) fn key_columns(&self) -> &'static [&'static str] {
        match self {
            JobKey::Analysis { .. } | JobKey::Titration { .. } => &["workflow_id", "variant"],
            JobKey::Stitching { .. } => &["plate_name"],
        }
    }

    /// Values bound to `key_columns`, in order.
    pub(crate) fn key_values(&self) -> Vec<&str> {
        match self {
            JobKey::Analysis {
                workflow_id,
                variant,
            }
            | JobKey::Titration {
                workflow_id,
                variant,
            } => vec![workflow_id.as_str(), variant.as_str()],
            JobKey::Stitching { plate_name } => vec![plate_name.as_str()],
        }
    }

    /// `workflow_id = ?1 AND variant = ?2`
    pub(crate) fn where_clause(&self) -> String {
        self.key_columns()
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{} = ?{}", col, i + 1))
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKey::Analysis {
                workflow_id,
                variant,
            } => write!(f, "analysis {} {}", workflow_id, variant),
            JobKey::Titration {
                workflow_id,
                variant,
            } => write!(f, "titration {} {}", workflow_id, variant),
            JobKey::Stitching { plate_name } => write!(f, "stitching {}", plate_name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// No row for the key.
    New,
    /// Submitted within the timeout, probably queued or running.
    Recent,
    /// Submitted longer ago than the timeout and never finished.
    Stale,
    Finished,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::New => "new",
            JobState::Recent => "recent",
            JobState::Stale => "stale",
            JobState::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// One ledger row. Timestamps are SQLite `CURRENT_TIMESTAMP` strings (UTC).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub key: JobKey,
    pub created_at: String,
    pub finished_at: Option<String>,
    /// Seconds since `created_at`, computed by SQLite at read time.
    pub age_secs: i64,
}

pub fn classify(record: Option<&JobRecord>, timeout: Duration) -> JobState {
    match record {
        None => JobState::New,
        Some(r) if r.finished_at.is_some() => JobState::Finished,
        Some(r) if r.age_secs < timeout.as_secs() as i64 => JobState::Recent,
        Some(_) => JobState::Stale,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("no ledger row for {0}")]
    MissingRecord(JobKey),
    #[error("{0} is already finished and cannot be resubmitted")]
    AlreadyFinished(JobKey),
    #[error("ledger row for {key} has an unreadable created_at '{value}'")]
    CorruptRecord { key: JobKey, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(age_mins: i64, finished: bool) -> JobRecord {
        JobRecord {
            key: JobKey::stitching("S01000001"),
            created_at: "2021-05-14 13:44:30".to_string(),
            finished_at: finished.then(|| "2021-05-14 14:00:00".to_string()),
            age_secs: age_mins * 60,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(30 * 60);

    #[test]
    fn classify_follows_age_and_completion() {
        assert_eq!(classify(None, TIMEOUT), JobState::New);
        assert_eq!(classify(Some(&record(29, false)), TIMEOUT), JobState::Recent);
        assert_eq!(classify(Some(&record(30, false)), TIMEOUT), JobState::Stale);
        assert_eq!(classify(Some(&record(31, false)), TIMEOUT), JobState::Stale);
        assert_eq!(classify(Some(&record(45, true)), TIMEOUT), JobState::Finished);
        assert_eq!(classify(Some(&record(1, true)), TIMEOUT), JobState::Finished);
    }

    #[test]
    fn where_clause_binds_every_key_column() {
        let key = JobKey::analysis("000042", "England2");
        assert_eq!(key.where_clause(), "workflow_id = ?1 AND variant = ?2");
        assert_eq!(key.key_values(), vec!["000042", "England2"]);
        assert_eq!(JobKey::stitching("S01").where_clause(), "plate_name = ?1");
        assert_eq!(JobKey::titration("1", "v").table(), "titration_jobs");
    }
}
