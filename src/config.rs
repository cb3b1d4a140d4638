use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
    #[serde(default = "default_sync_on_close")]
    pub sync_on_close: bool,
}

fn default_sync_on_close() -> bool {
    true
}

/// Parameters of the simulated hardware feed
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    pub sample_interval_ms: u64,
    #[serde(default)]
    pub heading_rate_dps: f32,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub feed: FeedConfig,
    pub log: Option<LogConfig>,
}

impl AppConfig {
    pub fn load_default() -> anyhow::Result<Self> {
        let default = include_str!("../config/default.toml");
        let cfg: AppConfig = toml::from_str(default)?;
        Ok(cfg)
    }

    pub fn load_from(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let p = path.into();
        let s = fs::read_to_string(&p)?;
        let cfg: AppConfig = toml::from_str(&s)?;
        Ok(cfg)
    }

    /// Filter directive used when `RUST_LOG` is unset
    pub fn log_filter(&self) -> &str {
        self.log.as_ref().map(|l| l.filter.as_str()).unwrap_or("info")
    }
}
