use serde::Deserialize;
use std::{fs, path::Path, time::Duration};
use telemetry_engine::EngineConfig;

pub const CONFIG_ENV: &str = "TELEMETRY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "telemetry-config.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSourceConfig {
    pub http_bind_addr: String,
    pub channel_capacity: usize,
    #[serde(default = "default_max_request_records")]
    pub max_request_records: usize,
}

fn default_max_request_records() -> usize {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Flush a partial batch after this long without new readings.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_flush_interval_ms() -> u64 {
    500
}

impl SinkConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    pub source: HttpSourceConfig,
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryApiConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimulatorConfig {
    pub meters: Vec<String>,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Daily readings emitted per meter for the days before start.
    #[serde(default)]
    pub history_days: u32,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_interval_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    pub ingest: IngestConfig,
    pub query_api: QueryApiConfig,
    pub metrics: Option<MetricsConfig>,
    pub simulator: Option<SimulatorConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
        let cfg: AppConfig = toml::from_str(&contents)?;
        Ok(cfg)
    }
}
