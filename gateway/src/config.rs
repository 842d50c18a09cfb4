use aggregator::config::Config as AggregatorConfig;
use registry::config::Config as RegistryConfig;
use serde::Deserialize;
use shared::metrics::MetricsConfig;
use std::fs::File;

fn default_level() -> String {
    "info".into()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default)]
    pub sentry_dsn: Option<String>,
    /// Default filter directive, `RUST_LOG` takes precedence.
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            sentry_dsn: None,
            level: default_level(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub aggregator: AggregatorConfig,
    pub registry: RegistryConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data: Config = serde_yaml::from_reader(file)?;
        data.aggregator.validate()?;
        data.registry.validate()?;

        Ok(data)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid aggregator config: {0}")]
    Aggregator(#[from] aggregator::config::ValidationError),
    #[error("invalid registry config: {0}")]
    Registry(#[from] registry::config::ValidationError),
}
