use crate::factory::{FrameControllerFactory, SourceDescriptor};
use crate::policy::{BackoffConfig, PublishPolicy};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use common::{Environment, LogLevel};

/// Names a TOML file to load instead of `framefeed.toml`.
pub const CONFIG_PATH_VAR: &str = "FRAMEFEED_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "framefeed.toml";
const ENV_PREFIX: &str = "FRAMEFEED";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    Drop,
    #[default]
    Backoff,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Shared channel capacity; derived from the sources' fps when unset.
    #[serde(default)]
    pub capacity: Option<usize>,
    #[serde(default)]
    pub policy: PolicyKind,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    #[serde(default)]
    pub sources: Vec<SourceDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub log_level: LogLevel,
    pub environment: Environment,
    #[serde(default)]
    pub otel_endpoint: Option<String>,
    pub poll_interval_ms: u64,
    pub drain_timeout_ms: u64,
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    /// Load `FRAMEFEED_CONFIG` (required if set) or `framefeed.toml` (optional),
    /// then apply `FRAMEFEED_*` overrides.
    pub fn load() -> Result<Self, config::ConfigError> {
        match env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::build(PathBuf::from(path), true),
            Err(_) => Self::build(PathBuf::from(DEFAULT_CONFIG_FILE), false),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        Self::build(path.to_path_buf(), true)
    }

    fn build(file: PathBuf, required: bool) -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .set_default("log_level", "info")?
            .set_default("environment", "development")?
            .set_default("poll_interval_ms", 100)?
            .set_default("drain_timeout_ms", 100)?
            .set_default("pipeline.policy", "backoff")?
            .set_default("pipeline.backoff_initial_ms", 10)?
            .set_default("pipeline.backoff_max_ms", 1000)?
            .add_source(config::File::from(file).required(required))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize::<AppConfig>()
    }

    pub fn publish_policy(&self) -> PublishPolicy {
        match self.pipeline.policy {
            PolicyKind::Drop => PublishPolicy::DropOnFull,
            PolicyKind::Backoff => PublishPolicy::Backoff(BackoffConfig {
                initial: Duration::from_millis(self.pipeline.backoff_initial_ms),
                max: Duration::from_millis(self.pipeline.backoff_max_ms),
                ..BackoffConfig::default()
            }),
        }
    }

    pub fn factory(&self) -> FrameControllerFactory {
        FrameControllerFactory::new(self.pipeline.sources.clone())
            .with_capacity(self.pipeline.capacity)
            .with_policy(self.publish_policy())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
