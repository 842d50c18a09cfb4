//! Relays one request to one cluster and records the outcome as an [`Aggregate`].

use crate::filter::Candidate;
use crate::identity::CallerIdentity;
use crate::token::{TokenClaims, TokenError, TokenIssuer};
use crate::transport::{TransportError, TransportFactory};
use crate::types::Aggregate;
use http::StatusCode;
use http::header::AUTHORIZATION;
use std::sync::Arc;
use tokio::time::Instant;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("auth information missing from context")]
    MissingIdentity,

    #[error("failed to mint token: {0}")]
    Token(#[from] TokenError),

    #[error("failed to build transport: {0}")]
    Transport(#[from] TransportError),

    #[error("request failed: {0}")]
    Request(reqwest::Error),

    #[error("request deadline exceeded")]
    Timeout,

    #[error("Failed to read response body: {source}")]
    UnreadableBody { status: u16, source: reqwest::Error },

    #[error("Got non OK response {status} from request with body: {body}")]
    Upstream { status: u16, body: String },

    #[error("Failed to unmarshal response: {0}")]
    MalformedBody(serde_json::Error),

    #[error("dispatch task panicked: {0}")]
    Panicked(String),

    #[error("dispatch pool closed")]
    PoolClosed,
}

impl DispatchError {
    /// Status recorded on the cluster's aggregate.
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::UnreadableBody { status, .. } if *status != 200 => *status,
            DispatchError::UnreadableBody { .. } | DispatchError::MalformedBody(_) => {
                StatusCode::UNPROCESSABLE_ENTITY.as_u16()
            }
            DispatchError::Upstream { status, .. } => *status,
            _ => StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
        }
    }

    /// Downstream failures are the cluster's fault and are logged at info.
    /// Everything else is a gateway fault and is logged at error.
    pub fn is_downstream(&self) -> bool {
        match self {
            DispatchError::Upstream { .. } | DispatchError::MalformedBody(_) => true,
            DispatchError::UnreadableBody { status, .. } => *status != 200,
            _ => false,
        }
    }

    pub fn record(self, aggregate: Aggregate) -> Aggregate {
        if self.is_downstream() {
            tracing::info!(cluster = %aggregate.name, error = %self, "Cluster request failed");
        } else {
            tracing::error!(cluster = %aggregate.name, error = %self, "Failed to dispatch to cluster");
        }
        let status = self.status_code();
        aggregate.failed(status, self.to_string())
    }
}

pub struct Dispatcher {
    issuer: Arc<dyn TokenIssuer>,
    transports: TransportFactory,
    audience: String,
}

impl Dispatcher {
    pub fn new(issuer: Arc<dyn TokenIssuer>, transports: TransportFactory, audience: &str) -> Self {
        Dispatcher {
            issuer,
            transports,
            audience: audience.to_string(),
        }
    }

    /// Never fails: every outcome, good or bad, ends up in the returned aggregate.
    pub async fn dispatch(
        &self,
        candidate: &Candidate,
        uri: &str,
        caller: Option<&CallerIdentity>,
        deadline: Instant,
    ) -> Aggregate {
        let aggregate = Aggregate::new(candidate.name().to_string(), candidate.location.clone());

        let outcome = match tokio::time::timeout_at(deadline, self.call(candidate, uri, caller, deadline)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DispatchError::Timeout),
        };

        match outcome {
            Ok((status, body)) => aggregate.succeeded(status, body),
            Err(e) => e.record(aggregate),
        }
    }

    async fn call(
        &self,
        candidate: &Candidate,
        uri: &str,
        caller: Option<&CallerIdentity>,
        deadline: Instant,
    ) -> Result<(u16, serde_json::Value), DispatchError> {
        let caller = caller.ok_or(DispatchError::MissingIdentity)?;
        let token = self
            .issuer
            .issue_token(&self.audience, &caller.user, &TokenClaims::for_caller(&caller.groups))
            .await?;

        let transport = self.transports.transport_for(&candidate.cluster)?;
        let url = relay_url(&transport.base_url, uri);

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(DispatchError::Timeout);
        }

        tracing::debug!(cluster = %candidate.name(), %url, "Dispatching");
        let response = transport
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .timeout(remaining)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::Timeout
                } else {
                    DispatchError::Request(e)
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|source| DispatchError::UnreadableBody { status, source })?;

        if status != 200 {
            return Err(DispatchError::Upstream {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let body = serde_json::from_slice(&body).map_err(DispatchError::MalformedBody)?;
        Ok((status, body))
    }
}

/// Points the cluster's base address at `uri`. The path and query of `uri`
/// replace whatever the base address carries, scheme and authority are kept.
fn relay_url(base: &Url, uri: &str) -> Url {
    let (path, query) = match uri.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (uri, None),
    };
    let mut url = base.clone();
    url.set_path(path);
    url.set_query(query);
    url.set_fragment(None);
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{
        FailingIssuer, MockCluster, OTHER_CA_PEM, TEST_CA_PEM, caller, candidate,
        candidate_with_ca, spawn_truncated_server, test_issuer,
    };
    use crate::types::Location;
    use serde_json::json;
    use std::time::Duration;

    fn dispatcher(issuer: Arc<dyn TokenIssuer>) -> Dispatcher {
        Dispatcher::new(
            issuer,
            TransportFactory::uncached().allow_insecure_http(true),
            "atlassian.com/kube/tokenator",
        )
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn test_relay_url() {
        let base = Url::parse("https://a.example.com:6443").unwrap();
        assert_eq!(
            relay_url(&base, "/api/v1/pods?limit=1").as_str(),
            "https://a.example.com:6443/api/v1/pods?limit=1"
        );
        assert_eq!(relay_url(&base, "/healthz").as_str(), "https://a.example.com:6443/healthz");
    }

    #[test]
    fn test_relay_url_replaces_base_path() {
        let base = Url::parse("https://a.example.com/prefix/?stale=1#frag").unwrap();
        assert_eq!(
            relay_url(&base, "/api/v1/pods").as_str(),
            "https://a.example.com/api/v1/pods"
        );

        let relayed = relay_url(&base, "//evil.example.com/x?y=1");
        assert_eq!(relayed.host_str(), Some("a.example.com"));
        assert_eq!(relayed.query(), Some("y=1"));
    }

    #[test]
    fn test_classification() {
        let upstream = DispatchError::Upstream {
            status: 404,
            body: "nope".into(),
        };
        assert_eq!(upstream.status_code(), 404);
        assert!(upstream.is_downstream());
        assert_eq!(
            upstream.to_string(),
            "Got non OK response 404 from request with body: nope"
        );

        let malformed = DispatchError::MalformedBody(serde_json::from_str::<u8>("x").unwrap_err());
        assert_eq!(malformed.status_code(), 422);
        assert!(malformed.is_downstream());

        assert_eq!(DispatchError::MissingIdentity.status_code(), 500);
        assert!(!DispatchError::MissingIdentity.is_downstream());
        assert_eq!(DispatchError::Timeout.status_code(), 500);
        assert_eq!(DispatchError::Panicked("boom".into()).status_code(), 500);
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let cluster = MockCluster::spawn(200, r#"{"test":"case"}"#).await;
        let candidate = candidate("dev.ap-southeast-2", &cluster.address, "ap-southeast-2", "dev");

        let aggregate = dispatcher(test_issuer())
            .dispatch(&candidate, "/test?x=1", Some(&caller()), deadline())
            .await;

        assert_eq!(aggregate.status_code, 200);
        assert_eq!(aggregate.body, Some(json!({"test": "case"})));
        assert_eq!(aggregate.error, None);
        assert_eq!(
            aggregate.location,
            Location {
                region: "ap-southeast-2".into(),
                env_type: "dev".into()
            }
        );

        let requests = cluster.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].uri, "/test?x=1");
        assert!(
            requests[0]
                .authorization
                .as_deref()
                .unwrap()
                .starts_with("Bearer ")
        );
    }

    #[tokio::test]
    async fn test_dispatch_upstream_error() {
        let cluster = MockCluster::spawn(404, "not found").await;
        let candidate = candidate("a", &cluster.address, "r", "dev");

        let aggregate = dispatcher(test_issuer())
            .dispatch(&candidate, "/missing", Some(&caller()), deadline())
            .await;

        assert_eq!(aggregate.status_code, 404);
        assert_eq!(
            aggregate.error.as_deref(),
            Some("Got non OK response 404 from request with body: not found")
        );
        assert_eq!(aggregate.body, None);
    }

    #[tokio::test]
    async fn test_dispatch_malformed_body() {
        let cluster = MockCluster::spawn(200, "not json").await;
        let candidate = candidate("a", &cluster.address, "r", "dev");

        let aggregate = dispatcher(test_issuer())
            .dispatch(&candidate, "/x", Some(&caller()), deadline())
            .await;
        assert_eq!(aggregate.status_code, 422);
        assert!(aggregate.error.unwrap().starts_with("Failed to unmarshal response"));
    }

    #[tokio::test]
    async fn test_dispatch_unreadable_body() {
        let address = spawn_truncated_server(200).await;
        let candidate_ok = candidate("a", &address, "r", "dev");
        let aggregate = dispatcher(test_issuer())
            .dispatch(&candidate_ok, "/x", Some(&caller()), deadline())
            .await;
        assert_eq!(aggregate.status_code, 422);
        assert!(aggregate.error.is_some());

        let address = spawn_truncated_server(503).await;
        let candidate_failed = candidate("b", &address, "r", "dev");
        let aggregate = dispatcher(test_issuer())
            .dispatch(&candidate_failed, "/x", Some(&caller()), deadline())
            .await;
        assert_eq!(aggregate.status_code, 503);
        assert!(aggregate.error.is_some());
    }

    #[tokio::test]
    async fn test_dispatch_internal_failures() {
        let cluster = MockCluster::spawn(200, "{}").await;
        let candidate_ok = candidate("a", &cluster.address, "r", "dev");

        // No caller identity
        let aggregate = dispatcher(test_issuer())
            .dispatch(&candidate_ok, "/x", None, deadline())
            .await;
        assert_eq!(aggregate.status_code, 500);
        assert_eq!(
            aggregate.error.as_deref(),
            Some("auth information missing from context")
        );

        // Token mint failure
        let aggregate = dispatcher(Arc::new(FailingIssuer))
            .dispatch(&candidate_ok, "/x", Some(&caller()), deadline())
            .await;
        assert_eq!(aggregate.status_code, 500);
        assert!(aggregate.error.unwrap().starts_with("failed to mint token"));

        // Transport failure
        let broken = candidate("b", "https://127.0.0.1:1", "r", "dev");
        let aggregate = dispatcher(test_issuer())
            .dispatch(&broken, "/x", Some(&caller()), deadline())
            .await;
        assert_eq!(aggregate.status_code, 500);
        assert!(aggregate.error.unwrap().starts_with("failed to build transport"));

        // Network failure
        let unreachable = candidate("c", "http://127.0.0.1:1", "r", "dev");
        let aggregate = dispatcher(test_issuer())
            .dispatch(&unreachable, "/x", Some(&caller()), deadline())
            .await;
        assert_eq!(aggregate.status_code, 500);
        assert!(aggregate.error.unwrap().starts_with("request failed"));

        // Failures before the request never reach the cluster.
        assert!(cluster.requests().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_over_tls() {
        let cluster = MockCluster::spawn_tls(200, r#"{"secure":true}"#).await;
        let trusted = candidate_with_ca("a", &cluster.address, "r", "dev", TEST_CA_PEM);

        let aggregate = Dispatcher::new(test_issuer(), TransportFactory::uncached(), "aud")
            .dispatch(&trusted, "/api/v1/pods", Some(&caller()), deadline())
            .await;

        assert_eq!(aggregate.status_code, 200, "{:?}", aggregate.error);
        assert_eq!(aggregate.body, Some(json!({"secure": true})));
        let requests = cluster.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].uri, "/api/v1/pods");
        assert!(requests[0].authorization.is_some());
    }

    #[tokio::test]
    async fn test_dispatch_rejects_untrusted_server() {
        let cluster = MockCluster::spawn_tls(200, "{}").await;
        let untrusted = candidate_with_ca("a", &cluster.address, "r", "dev", OTHER_CA_PEM);

        let aggregate = Dispatcher::new(test_issuer(), TransportFactory::uncached(), "aud")
            .dispatch(&untrusted, "/x", Some(&caller()), deadline())
            .await;

        assert_eq!(aggregate.status_code, 500);
        assert!(aggregate.error.unwrap().starts_with("request failed"));
        // The token never left the gateway.
        assert!(cluster.requests().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_refuses_plain_http_by_default() {
        let cluster = MockCluster::spawn(200, "{}").await;
        let candidate = candidate("a", &cluster.address, "r", "dev");

        let aggregate = Dispatcher::new(test_issuer(), TransportFactory::uncached(), "aud")
            .dispatch(&candidate, "/x", Some(&caller()), deadline())
            .await;

        assert_eq!(aggregate.status_code, 500);
        assert_eq!(
            aggregate.error.as_deref(),
            Some("failed to build transport: unsupported endpoint scheme: http")
        );
        assert!(cluster.requests().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_honors_deadline() {
        let cluster = MockCluster::spawn_with_delay(200, "{}", Duration::from_secs(10)).await;
        let candidate = candidate("slow", &cluster.address, "r", "dev");

        let started = Instant::now();
        let aggregate = dispatcher(test_issuer())
            .dispatch(
                &candidate,
                "/x",
                Some(&caller()),
                Instant::now() + Duration::from_millis(200),
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(aggregate.status_code, 500);
        assert_eq!(aggregate.error.as_deref(), Some("request deadline exceeded"));
    }
}
