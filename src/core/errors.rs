use std::path::PathBuf;

/// Problems with the environment a run depends on. Never retried: a run that
/// hits one of these stops and exits non-zero.
#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("cannot read results directory {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(
        "no directories matching '{prefix}*{suffix}' in {path}; is the results mount available?"
    )]
    EmptyListing {
        path: PathBuf,
        prefix: String,
        suffix: String,
    },
    #[error("environment variable {0} is not set")]
    MissingVariable(String),
    #[error("config file {0} not found")]
    MissingConfig(PathBuf),
    #[error("no task queue endpoint configured; set [queue].endpoint or pass --dry-run")]
    NoQueueEndpoint,
    #[error("unknown watch target '{0}'")]
    UnknownWatch(String),
}
