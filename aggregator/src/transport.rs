// Builds HTTP clients that trust exactly one cluster's CA bundle. No client
// certificate is ever presented. Clients can optionally be cached per cluster and
// are rebuilt whenever the cluster's endpoint or CA bundle changes.
use crate::config::TransportCacheConfig;
use crate::metrics_defs::{TRANSPORT_CACHE_HIT, TRANSPORT_CACHE_MISS};
use moka::sync::Cache;
use registry::types::Cluster;
use sha2::{Digest, Sha256};
use shared::counter;
use std::time::Duration;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("cluster has no API endpoint")]
    MissingEndpoint,
    #[error("invalid API endpoint {0}: {1}")]
    InvalidEndpoint(String, url::ParseError),
    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),
    #[error("cluster has no CA bundle for a TLS endpoint")]
    MissingCaBundle,
    #[error("CA bundle contains no certificates")]
    EmptyCaBundle,
    #[error("invalid CA certificate: {0}")]
    InvalidCertificate(reqwest::Error),
    #[error("failed to build client: {0}")]
    Build(reqwest::Error),
}

/// A client plus the base URL it should be pointed at.
#[derive(Clone, Debug)]
pub struct ClusterTransport {
    pub base_url: Url,
    pub client: reqwest::Client,
}

/// Builds a one-way TLS client whose only roots are the cluster's CA bundle.
///
/// Plain `http` endpoints are rejected unless `allow_insecure_http` is set.
pub fn build_transport(
    cluster: &Cluster,
    allow_insecure_http: bool,
) -> Result<ClusterTransport, TransportError> {
    let address = cluster
        .server_address()
        .ok_or(TransportError::MissingEndpoint)?;
    let base_url =
        Url::parse(address).map_err(|e| TransportError::InvalidEndpoint(address.to_string(), e))?;

    let mut builder = reqwest::Client::builder()
        .tls_built_in_root_certs(false)
        .redirect(reqwest::redirect::Policy::none());

    match base_url.scheme() {
        "https" => {
            if cluster.ca_bundle().is_empty() {
                return Err(TransportError::MissingCaBundle);
            }
            let certs = reqwest::Certificate::from_pem_bundle(cluster.ca_bundle())
                .map_err(TransportError::InvalidCertificate)?;
            if certs.is_empty() {
                return Err(TransportError::EmptyCaBundle);
            }
            for cert in certs {
                builder = builder.add_root_certificate(cert);
            }
        }
        "http" if allow_insecure_http => {}
        other => return Err(TransportError::UnsupportedScheme(other.to_string())),
    }

    let client = builder.build().map_err(TransportError::Build)?;
    Ok(ClusterTransport { base_url, client })
}

#[derive(Clone)]
struct CachedTransport {
    fingerprint: [u8; 32],
    transport: ClusterTransport,
}

fn fingerprint(cluster: &Cluster) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(cluster.server_address().unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update(cluster.ca_bundle());
    hasher.finalize().into()
}

/// Hands out per-cluster transports, either fresh per call or from a cache keyed
/// by cluster name.
pub struct TransportFactory {
    cache: Option<Cache<String, CachedTransport>>,
    allow_insecure_http: bool,
}

impl TransportFactory {
    pub fn new(config: &TransportCacheConfig) -> Self {
        let cache = config.enabled.then(|| {
            Cache::builder()
                .max_capacity(config.max_capacity)
                .time_to_idle(Duration::from_secs(config.idle_timeout_secs))
                .build()
        });
        TransportFactory {
            cache,
            allow_insecure_http: false,
        }
    }

    /// A factory that builds a new client for every call.
    pub fn uncached() -> Self {
        TransportFactory {
            cache: None,
            allow_insecure_http: false,
        }
    }

    pub fn allow_insecure_http(mut self, allow: bool) -> Self {
        self.allow_insecure_http = allow;
        self
    }

    pub fn transport_for(&self, cluster: &Cluster) -> Result<ClusterTransport, TransportError> {
        let Some(cache) = &self.cache else {
            return build_transport(cluster, self.allow_insecure_http);
        };

        let fingerprint = fingerprint(cluster);
        match cache.get(cluster.name()) {
            Some(cached) if cached.fingerprint == fingerprint => {
                counter!(TRANSPORT_CACHE_HIT).increment(1);
                return Ok(cached.transport);
            }
            _ => {}
        }

        counter!(TRANSPORT_CACHE_MISS).increment(1);
        // Drop a stale entry even if the rebuild below fails.
        cache.invalidate(cluster.name());
        let transport = build_transport(cluster, self.allow_insecure_http)?;
        cache.insert(
            cluster.name().to_string(),
            CachedTransport {
                fingerprint,
                transport: transport.clone(),
            },
        );
        Ok(transport)
    }
}
