use crate::filter::Candidate;
use crate::identity::CallerIdentity;
use crate::token::{HmacTokenIssuer, TokenClaims, TokenError, TokenIssuer};
use crate::types::Location;
use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::AUTHORIZATION;
use hyper::server::conn::http1;
use hyper::service::{Service, service_fn};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use registry::types::Cluster;
use shared::http::serve_listener;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Self-signed CA for `ca.cluster.test`, issuer of the mock cluster's server certificate.
pub const TEST_CA_PEM: &str = include_str!("testdata/cluster-ca.pem");
/// An unrelated self-signed CA.
pub const OTHER_CA_PEM: &str = include_str!("testdata/other-ca.pem");
// Valid for 127.0.0.1 and localhost.
const SERVER_CERT_PEM: &[u8] = include_bytes!("testdata/server.pem");
const SERVER_KEY_PEM: &[u8] = include_bytes!("testdata/server.key");

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub uri: String,
    pub authorization: Option<String>,
}

#[derive(Default)]
struct ClusterState {
    requests: Mutex<Vec<RecordedRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A fake cluster API server answering every request with a fixed response.
pub struct MockCluster {
    pub address: String,
    state: Arc<ClusterState>,
}

impl MockCluster {
    pub async fn spawn(status: u16, body: &'static str) -> Self {
        Self::spawn_with_delay(status, body, Duration::ZERO).await
    }

    pub async fn spawn_with_delay(status: u16, body: &'static str, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        let state = Arc::new(ClusterState::default());

        let service = cluster_service(state.clone(), status, body, delay);
        tokio::spawn(serve_listener(listener, service));

        MockCluster { address, state }
    }

    /// Serves over TLS with a certificate issued by [`TEST_CA_PEM`].
    pub async fn spawn_tls(status: u16, body: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("https://{}", listener.local_addr().unwrap());
        let state = Arc::new(ClusterState::default());

        let service = cluster_service(state.clone(), status, body, Duration::ZERO);
        let acceptor = tls_acceptor();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let acceptor = acceptor.clone();
                let service = service.clone();
                tokio::spawn(async move {
                    // Clients that do not trust the CA abort the handshake.
                    let Ok(stream) = acceptor.accept(stream).await else {
                        return;
                    };
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        MockCluster { address, state }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

fn cluster_service(
    state: Arc<ClusterState>,
    status: u16,
    body: &'static str,
    delay: Duration,
) -> impl Service<
    Request<Incoming>,
    Response = Response<Full<Bytes>>,
    Error = std::io::Error,
    Future: Send + 'static,
> + Clone
+ Send
+ Sync
+ 'static {
    service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        async move {
            state.requests.lock().unwrap().push(RecordedRequest {
                uri: req.uri().to_string(),
                authorization: req
                    .headers()
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
            });

            let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            state.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            state.in_flight.fetch_sub(1, Ordering::SeqCst);

            let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
            *response.status_mut() = StatusCode::from_u16(status).unwrap();
            Ok::<_, std::io::Error>(response)
        }
    })
}

fn tls_acceptor() -> TlsAcceptor {
    let certs = CertificateDer::pem_slice_iter(SERVER_CERT_PEM)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = PrivateKeyDer::from_pem_slice(SERVER_KEY_PEM).unwrap();
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

/// Answers with a status line and a body shorter than its declared length,
/// then closes the connection.
pub async fn spawn_truncated_server(status: u16) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status} Whatever\r\ncontent-length: 100\r\n\r\n{{\"partial\""
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    address
}

pub fn test_issuer() -> Arc<dyn TokenIssuer> {
    Arc::new(
        HmacTokenIssuer::new(
            "aggregator",
            "aggregator/1",
            b"test-secret".to_vec(),
            Duration::from_secs(60),
        )
        .unwrap(),
    )
}

pub struct FailingIssuer;

#[async_trait]
impl TokenIssuer for FailingIssuer {
    async fn issue_token(&self, _: &str, _: &str, _: &TokenClaims) -> Result<String, TokenError> {
        Err(TokenError::InvalidKey)
    }
}

/// Panics on the given (1-based) call, succeeds otherwise.
pub struct PanickingIssuer {
    panic_on: u64,
    calls: AtomicU64,
}

impl PanickingIssuer {
    pub fn on_call(panic_on: u64) -> Self {
        PanickingIssuer {
            panic_on,
            calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl TokenIssuer for PanickingIssuer {
    async fn issue_token(&self, _: &str, subject: &str, _: &TokenClaims) -> Result<String, TokenError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.panic_on {
            panic!("issuer exploded");
        }
        Ok(format!("token-{subject}-{call}"))
    }
}

pub fn caller() -> CallerIdentity {
    CallerIdentity {
        user: "alice".into(),
        groups: vec!["admins".into()],
    }
}

pub fn candidate(name: &str, address: &str, region: &str, env: &str) -> Candidate {
    candidate_with_ca(name, address, region, env, "")
}

pub fn candidate_with_ca(
    name: &str,
    address: &str,
    region: &str,
    env: &str,
    ca: &str,
) -> Candidate {
    let cluster = Cluster::new(name)
        .with_label("customer", "paas")
        .with_label("region", region)
        .with_label("paas-env", env)
        .with_endpoint(address, ca.as_bytes().to_vec());
    Candidate {
        cluster: Arc::new(cluster),
        location: Location {
            region: region.into(),
            env_type: env.into(),
        },
    }
}
