use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::core::errors::EnvironmentError;
use crate::core::retry::RetryPolicy;
use crate::core::snapshot::NameFilter;

/// Overrides the default `~/.plate-launcher` data directory.
pub const DATA_DIR_ENV: &str = "PLATE_LAUNCHER_DATA_DIR";

pub const CONFIG_FILE_NAME: &str = "launcher.toml";

/// Root directory for databases, config and logs.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".plate-launcher")
}

pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            tokio::fs::create_dir_all(parent).await?;
        }
        _ => {}
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct LauncherConfig {
    #[serde(default = "default_ledger_db")]
    pub ledger_db: PathBuf,

    /// Age after which an unfinished job is considered lost.
    #[serde(default = "default_task_timeout_mins")]
    pub task_timeout_mins: u64,

    /// File inside each plate export handed to the stitching worker.
    #[serde(default = "default_index_file")]
    pub index_file: String,

    #[serde(default = "default_watch")]
    pub watch: Vec<WatchConfig>,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub alerts: AlertConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One polled results directory with its own snapshot database.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    pub name: String,
    pub results_dir: PathBuf,
    pub snapshot_db: PathBuf,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_suffix")]
    pub suffix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Broker endpoint accepting JSON job submissions.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_queue_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_alerts_enabled")]
    pub enabled: bool,
    /// Name of the environment variable holding the Slack webhook URL.
    #[serde(default = "default_webhook_env")]
    pub webhook_env: String,
    #[serde(default = "default_alert_username")]
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Six-field cron expression (seconds first) for `watch` mode.
    #[serde(default = "default_cron")]
    pub cron: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_ledger_db() -> PathBuf {
    data_dir().join("ledger.db")
}
fn default_task_timeout_mins() -> u64 {
    30
}
fn default_index_file() -> String {
    "indexfile.txt".to_string()
}
fn default_watch() -> Vec<WatchConfig> {
    vec![WatchConfig {
        name: "assay".to_string(),
        results_dir: PathBuf::from("/mnt/proj-c19/ABNEUTRALISATION/NA_raw_data"),
        snapshot_db: data_dir().join("snapshot.db"),
        prefix: default_prefix(),
        suffix: default_suffix(),
    }]
}
fn default_prefix() -> String {
    "S".to_string()
}
fn default_suffix() -> String {
    "-Measurement 1".to_string()
}
fn default_queue_timeout_secs() -> u64 {
    10
}
fn default_alerts_enabled() -> bool {
    true
}
fn default_webhook_env() -> String {
    "SLACK_WEBHOOK_NEUTRALISATION".to_string()
}
fn default_alert_username() -> String {
    "NE analysis".to_string()
}
fn default_cron() -> String {
    "0 */5 * * * *".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_queue_timeout_secs(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: default_alerts_enabled(),
            webhook_env: default_webhook_env(),
            username: default_alert_username(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: default_cron(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            ledger_db: default_ledger_db(),
            task_timeout_mins: default_task_timeout_mins(),
            index_file: default_index_file(),
            watch: default_watch(),
            queue: QueueConfig::default(),
            alerts: AlertConfig::default(),
            retry: RetryPolicy::default(),
            schedule: ScheduleConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl WatchConfig {
    pub fn filter(&self) -> NameFilter {
        NameFilter::new(&self.prefix, &self.suffix)
    }
}

impl LauncherConfig {
    /// Load an explicit config file. A missing file is an error.
    pub async fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(EnvironmentError::MissingConfig(path.to_path_buf()).into());
        }
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::parse(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        info!(
            "Loaded config {}: {} watch target(s), timeout={}m",
            path.display(),
            config.watch.len(),
            config.task_timeout_mins
        );
        Ok(config)
    }

    /// Load `<data_dir>/launcher.toml`, falling back to defaults.
    pub async fn load_default() -> Result<Self> {
        let path = data_dir().join(CONFIG_FILE_NAME);
        if !path.exists() {
            info!("No {} found, using defaults.", path.display());
            return Ok(Self::default());
        }
        Self::load_from(path).await
    }

    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load_from(path).await,
            None => Self::load_default().await,
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: LauncherConfig = toml::from_str(content)?;
        if config.watch.is_empty() {
            anyhow::bail!("config must declare at least one [[watch]] target");
        }
        Ok(config)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_mins * 60)
    }

    pub fn watch_target(&self, name: &str) -> Result<&WatchConfig> {
        self.watch
            .iter()
            .find(|w| w.name == name)
            .ok_or_else(|| EnvironmentError::UnknownWatch(name.to_string()).into())
    }

    /// Slack webhook URL, required whenever alerts are enabled.
    pub fn webhook_url(&self) -> Result<Option<String>> {
        if !self.alerts.enabled {
            return Ok(None);
        }
        match std::env::var(&self.alerts.webhook_env) {
            Ok(url) if !url.trim().is_empty() => Ok(Some(url)),
            _ => Err(EnvironmentError::MissingVariable(self.alerts.webhook_env.clone()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_lab_setup() {
        let config = LauncherConfig::default();
        assert_eq!(config.task_timeout_mins, 30);
        assert_eq!(config.task_timeout(), Duration::from_secs(1800));
        assert_eq!(config.index_file, "indexfile.txt");
        assert_eq!(config.watch.len(), 1);
        assert_eq!(config.watch[0].prefix, "S");
        assert_eq!(config.watch[0].suffix, "-Measurement 1");
        assert!(config.alerts.enabled);
        assert!(config.queue.endpoint.is_none());
        assert_eq!(config.queue.timeout_secs, 10);
    }

    #[test]
    fn omitted_queue_table_keeps_the_request_timeout() {
        let content = r#"
[[watch]]
name = "assay"
results_dir = "/mnt/NA_raw_data"
snapshot_db = "/var/lib/launcher/snapshot.db"
"#;
        let config = LauncherConfig::parse(content).unwrap();
        assert!(config.queue.endpoint.is_none());
        assert_eq!(config.queue.timeout_secs, 10);
    }

    #[test]
    fn parse_full_config() {
        let content = r#"
ledger_db = "/var/lib/launcher/ledger.db"
task_timeout_mins = 45

[[watch]]
name = "assay"
results_dir = "/mnt/NA_raw_data"
snapshot_db = "/var/lib/launcher/snapshot.db"

[[watch]]
name = "titration"
results_dir = "/mnt/Titration_raw_data"
snapshot_db = "/var/lib/launcher/snapshot_titration.db"
prefix = "T"

[queue]
endpoint = "http://broker:5555/api/enqueue"

[alerts]
enabled = false

[retry]
total_tries = 5

[schedule]
cron = "0 */2 * * * *"
"#;
        let config = LauncherConfig::parse(content).unwrap();
        assert_eq!(config.task_timeout_mins, 45);
        assert_eq!(config.watch.len(), 2);
        assert_eq!(config.watch[1].prefix, "T");
        assert_eq!(config.watch[1].suffix, "-Measurement 1");
        assert_eq!(
            config.queue.endpoint.as_deref(),
            Some("http://broker:5555/api/enqueue")
        );
        assert!(!config.alerts.enabled);
        assert_eq!(config.retry.total_tries, 5);
        assert_eq!(config.retry.initial_wait_secs, 3.0);
        assert_eq!(config.schedule.cron, "0 */2 * * * *");
        assert!(config.watch_target("titration").is_ok());
        assert!(config.watch_target("other").is_err());
    }

    #[test]
    fn empty_watch_list_is_rejected() {
        assert!(LauncherConfig::parse("watch = []").is_err());
    }

    #[test]
    fn disabled_alerts_need_no_webhook() {
        let mut config = LauncherConfig::default();
        config.alerts.enabled = false;
        assert!(config.webhook_url().unwrap().is_none());
    }

    #[test]
    fn enabled_alerts_require_the_webhook_variable() {
        let mut config = LauncherConfig::default();
        config.alerts.webhook_env = format!("PLATE_LAUNCHER_TEST_UNSET_{}", std::process::id());
        let err = config.webhook_url().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EnvironmentError>(),
            Some(EnvironmentError::MissingVariable(_))
        ));
    }

    #[tokio::test]
    async fn explicit_missing_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("plate-launcher-{}.toml", uuid::Uuid::new_v4()));
        let err = LauncherConfig::load_from(&path).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EnvironmentError>(),
            Some(EnvironmentError::MissingConfig(_))
        ));
    }
}
