//! Configuration management

use fifostack_sqs::QueueConfig;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    /// Queues created at startup
    #[serde(default)]
    pub queues: Vec<QueueDefinition>,

    /// Event source mappings started once the queues exist
    #[serde(default)]
    pub event_sources: Vec<EventSourceConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Base of generated queue URLs; derived from host and port when unset
    #[serde(default)]
    pub endpoint_url: Option<String>,

    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            endpoint_url: None,
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl ServerConfig {
    pub fn endpoint_url(&self) -> String {
        self.endpoint_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
    }
}

#[derive(Debug, Deserialize)]
pub struct QueueDefinition {
    pub name: String,

    #[serde(flatten)]
    pub config: QueueConfig,
}

#[derive(Debug, Deserialize)]
pub struct EventSourceConfig {
    pub queue: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_wait_time_seconds")]
    pub wait_time_seconds: u64,
}

fn default_port() -> u16 {
    4566
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    1
}

fn default_wait_time_seconds() -> u64 {
    20
}

impl Config {
    /// Load configuration from an optional file, then `FIFOSTACK__*`
    /// environment overrides (e.g. `FIFOSTACK__SERVER__PORT`)
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("fifostack").required(false)),
        };

        let config = builder
            .add_source(config::Environment::with_prefix("FIFOSTACK").separator("__"))
            .build()?;

        Ok(config.try_deserialize::<Config>()?)
    }
}
