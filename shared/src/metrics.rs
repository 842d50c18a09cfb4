use metrics_exporter_statsd::{StatsdBuilder, StatsdError};
use serde::Deserialize;

const DEFAULT_PREFIX: &str = "aggregator";

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum MetricsError {
    #[error("could not build statsd exporter: {0}")]
    Statsd(#[from] StatsdError),
    #[error("a metrics recorder is already installed")]
    AlreadyInstalled,
}

/// Installs a global StatsD recorder.
///
/// Without a recorder every metric macro is a no-op, which is what happens when
/// no `metrics` section is configured.
pub fn install_statsd(config: &MetricsConfig) -> Result<(), MetricsError> {
    let prefix = config.prefix.as_deref().unwrap_or(DEFAULT_PREFIX);
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some(prefix))?;

    ::metrics::set_global_recorder(recorder).map_err(|_| MetricsError::AlreadyInstalled)?;
    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        prefix,
        "StatsD metrics exporter installed"
    );
    Ok(())
}
