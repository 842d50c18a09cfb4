pub mod api;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod executor;
pub mod filter;
pub mod identity;
pub mod metrics_defs;
pub mod token;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testutils;

use crate::api::{AggregatorService, ApiSettings};
use crate::dispatcher::Dispatcher;
use crate::errors::AggregatorError;
use crate::executor::Executor;
use crate::filter::ClusterSelector;
use crate::token::{HmacTokenIssuer, TokenError};
use crate::transport::TransportFactory;
use registry::{ClusterRegistry, RegistryError};
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to set up token issuer: {0}")]
    Token(#[from] TokenError),
    #[error(transparent)]
    Serve(#[from] AggregatorError),
}

/// Syncs the cluster registry, then serves the API and admin listeners until
/// either of them fails.
pub async fn run(
    config: config::Config,
    registry_config: registry::config::Config,
) -> Result<(), RunError> {
    shared::metrics_defs::describe_all(metrics_defs::ALL_METRICS);
    shared::metrics_defs::describe_all(registry::metrics_defs::ALL_METRICS);

    let issuer = Arc::new(HmacTokenIssuer::from_config(&config.token)?);

    let registry = ClusterRegistry::from_config(&registry_config)?;
    let sync_timeout = Duration::from_secs(registry_config.sync_timeout_secs);
    tracing::info!(timeout_secs = sync_timeout.as_secs(), "Waiting for cluster index to sync");
    registry.wait_for_sync(sync_timeout).await?;
    tracing::info!("Cluster index synced");

    let selector = ClusterSelector::new(
        registry.index(),
        registry_config.labels.clone(),
        &config.env_whitelist,
    );
    let dispatcher = Dispatcher::new(
        issuer,
        TransportFactory::new(&config.transport_cache)
            .allow_insecure_http(config.transport.allow_insecure_http),
        &config.token.audience,
    );
    let executor = Executor::new(Arc::new(dispatcher), config.max_concurrent_dispatches);

    let service = AggregatorService::new(
        ApiSettings {
            api_root: config.normalized_api_root().to_string(),
            api_spec_file: config.api_spec_file.clone(),
            identity: config.identity.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        },
        selector,
        executor,
    );

    let ready_registry = registry.clone();
    let admin_service = AdminService::<_, AggregatorError>::new(move || ready_registry.is_ready());

    let api_task = run_http_service(&config.listener.host, config.listener.port, service);
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    let result = tokio::try_join!(api_task, admin_task);
    registry.shutdown().await;
    result?;
    Ok(())
}
