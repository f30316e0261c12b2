use anyhow::{bail, Context, Result};
use orchestrator::QueenConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "hive.toml";
pub const CONFIG_ENV: &str = "HIVE_CONFIG";
const DEFAULT_DATABASE_URL: &str = "sqlite:hive.db";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HiveConfig {
    pub database: DatabaseConfig,
    pub queen: QueenSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueenSection {
    pub max_concurrent: usize,
    pub poll_interval_ms: u64,
    /// 0 disables the default phase timeout.
    pub phase_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub heartbeat_secs: u64,
    pub shell: String,
}

impl Default for QueenSection {
    fn default() -> Self {
        let defaults = QueenConfig::default();
        Self {
            max_concurrent: defaults.max_concurrent,
            poll_interval_ms: millis(defaults.poll_interval),
            phase_timeout_secs: defaults
                .default_phase_timeout
                .map(|timeout| timeout.as_secs())
                .unwrap_or(0),
            shutdown_grace_secs: defaults.shutdown_grace.as_secs(),
            heartbeat_secs: defaults.heartbeat_interval.as_secs(),
            shell: defaults.worker_shell,
        }
    }
}

impl QueenSection {
    pub fn to_queen_config(&self) -> QueenConfig {
        let timeout = Some(self.phase_timeout_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        QueenConfig::default()
            .with_max_concurrent(self.max_concurrent)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms.max(1)))
            .with_phase_timeout(timeout)
            .with_shutdown_grace(Duration::from_secs(self.shutdown_grace_secs))
            .with_heartbeat_interval(self.heartbeat())
            .with_shell(self.shell.clone())
    }

    fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    /// A reclaim window shorter than two heartbeats could catch a live
    /// driver between refreshes.
    pub fn check_reclaim_threshold(&self, older_than: Duration) -> Result<()> {
        let floor = self.heartbeat() * 2;
        if older_than < floor {
            bail!(
                "reclaim threshold {}s is below twice the heartbeat interval ({}s)",
                older_than.as_secs(),
                floor.as_secs()
            );
        }
        Ok(())
    }
}

impl HiveConfig {
    /// `--config` wins over `HIVE_CONFIG`, which wins over `./hive.toml`.
    pub fn resolve_path(explicit: Option<PathBuf>) -> PathBuf {
        explicit
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
    }

    /// Reads `path`, falling back to defaults when the file does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
