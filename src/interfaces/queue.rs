use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

/// Kind of work submitted to the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Stitching,
    Analysis,
    TitrationAnalysis,
    TitrationStitching,
}

impl JobKind {
    /// Broker queue the workers for this kind listen on.
    pub fn queue_name(self) -> &'static str {
        match self {
            JobKind::Stitching => "image_stitch",
            JobKind::Analysis => "analysis",
            JobKind::TitrationAnalysis => "titration",
            JobKind::TitrationStitching => "image_stitch_titration",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::Stitching => "stitching",
            JobKind::Analysis => "analysis",
            JobKind::TitrationAnalysis => "titration-analysis",
            JobKind::TitrationStitching => "titration-stitching",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "stitching" => Ok(JobKind::Stitching),
            "analysis" => Ok(JobKind::Analysis),
            "titration-analysis" | "titration" => Ok(JobKind::TitrationAnalysis),
            "titration-stitching" => Ok(JobKind::TitrationStitching),
            other => bail!("unknown job kind '{}'", other),
        }
    }

    pub fn is_stitching(self) -> bool {
        matches!(self, JobKind::Stitching | JobKind::TitrationStitching)
    }
}

/// Stitching takes the plate's index file, analysis the two replicate plate
/// directories (sorted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum JobArgs {
    IndexFile(PathBuf),
    PlatePair([PathBuf; 2]),
}

impl std::fmt::Display for JobArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobArgs::IndexFile(p) => write!(f, "{}", p.display()),
            JobArgs::PlatePair([a, b]) => write!(f, "[{}, {}]", a.display(), b.display()),
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Hand a job to the broker. Returns once the broker accepted it; the
    /// job itself runs later.
    async fn enqueue(&self, queue: &str, kind: JobKind, args: &JobArgs) -> Result<()>;
}

#[derive(Serialize)]
struct Submission<'a> {
    queue: &'a str,
    task: JobKind,
    args: &'a JobArgs,
}

/// Posts submissions as JSON to the broker endpoint.
pub struct HttpTaskQueue {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTaskQueue {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl TaskQueue for HttpTaskQueue {
    async fn enqueue(&self, queue: &str, kind: JobKind, args: &JobArgs) -> Result<()> {
        let body = Submission {
            queue,
            task: kind,
            args,
        };
        let res = self.client.post(&self.endpoint).json(&body).send().await;
        match res {
            Ok(r) if r.status().is_success() => {
                info!("Enqueued {} on '{}': {}", kind.as_str(), queue, args);
                Ok(())
            }
            Ok(r) => {
                let status = r.status();
                error!("Broker rejected {} job: {}", kind.as_str(), status);
                bail!("broker returned {} for {} job", status, kind.as_str())
            }
            Err(e) => {
                error!("Failed to reach broker at {}: {}", self.endpoint, e);
                Err(e.into())
            }
        }
    }
}

/// Logs what would be submitted. Used with `--dry-run`.
pub struct DryRunQueue;

#[async_trait]
impl TaskQueue for DryRunQueue {
    async fn enqueue(&self, queue: &str, kind: JobKind, args: &JobArgs) -> Result<()> {
        info!("[dry-run] would enqueue {} on '{}': {}", kind.as_str(), queue, args);
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names() {
        assert_eq!(JobKind::Stitching.queue_name(), "image_stitch");
        assert_eq!(JobKind::Analysis.queue_name(), "analysis");
        assert_eq!(JobKind::TitrationAnalysis.queue_name(), "titration");
        assert_eq!(
            JobKind::TitrationStitching.queue_name(),
            "image_stitch_titration"
        );
    }

    #[test]
    fn kind_names_parse_back() {
        for kind in [
            JobKind::Stitching,
            JobKind::Analysis,
            JobKind::TitrationAnalysis,
            JobKind::TitrationStitching,
        ] {
            assert_eq!(JobKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(JobKind::parse("plaque").is_err());
    }

    #[test]
    fn submission_json_shape() {
        let args = JobArgs::PlatePair([PathBuf::from("/d/S01"), PathBuf::from("/d/S02")]);
        let body = Submission {
            queue: "analysis",
            task: JobKind::TitrationAnalysis,
            args: &args,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "queue": "analysis",
                "task": "titration-analysis",
                "args": ["/d/S01", "/d/S02"]
            })
        );
        let index = serde_json::to_value(JobArgs::IndexFile(PathBuf::from("/d/S01/indexfile.txt")))
            .unwrap();
        assert_eq!(index, serde_json::json!("/d/S01/indexfile.txt"));
    }

    #[tokio::test]
    async fn dry_run_accepts_everything() {
        let args = JobArgs::IndexFile(PathBuf::from("/d/S01/indexfile.txt"));
        assert!(DryRunQueue.enqueue("image_stitch", JobKind::Stitching, &args).await.is_ok());
    }
}
