use crate::config::IdentityConfig;
use crate::errors::AggregatorError;
use crate::executor::Executor;
use crate::filter::{ClusterSelector, RequestFilter};
use crate::identity::CallerIdentity;
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS};
use crate::types::{AggregateList, ApiResourceList, Status};
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{Method, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use shared::http::make_boxed_error_response;
use shared::{counter, histogram};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::Instrument;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

type ApiResponse = Response<BoxBody<Bytes, AggregatorError>>;

pub struct ApiSettings {
    pub api_root: String,
    pub api_spec_file: Option<PathBuf>,
    pub identity: IdentityConfig,
    pub request_timeout: Duration,
}

struct ApiInner {
    settings: ApiSettings,
    selector: ClusterSelector,
    executor: Executor,
    request_seq: AtomicU64,
}

/// Serves the aggregation API under the configured root.
#[derive(Clone)]
pub struct AggregatorService {
    inner: Arc<ApiInner>,
}

enum Route {
    Discovery,
    Aggregate,
    OpenApi,
    Unknown,
}

impl AggregatorService {
    pub fn new(settings: ApiSettings, selector: ClusterSelector, executor: Executor) -> Self {
        AggregatorService {
            inner: Arc::new(ApiInner {
                settings,
                selector,
                executor,
                request_seq: AtomicU64::new(0),
            }),
        }
    }

    fn route(&self, path: &str) -> Route {
        let root = self.inner.settings.api_root.trim_end_matches('/');
        let Some(rest) = path.strip_prefix(root) else {
            return Route::Unknown;
        };
        match rest.trim_end_matches('/') {
            "" => Route::Discovery,
            "/aggregate" => Route::Aggregate,
            "/openapi" => Route::OpenApi,
            _ => Route::Unknown,
        }
    }

    fn request_id<B>(&self, req: &Request<B>) -> String {
        if let Some(id) = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            return id.to_string();
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let seq = self.inner.request_seq.fetch_add(1, Ordering::Relaxed);
        format!("{nanos:016x}{seq:08x}")
    }

    /// Handles one request end to end, including instrumentation. The body is
    /// never read, so any body type is accepted.
    pub async fn handle<B>(&self, req: Request<B>) -> ApiResponse {
        let started = Instant::now();
        let deadline = started + self.inner.settings.request_timeout;

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let filter = RequestFilter::from_query(req.uri().query());
        let request_id = self.request_id(&req);
        let caller = CallerIdentity::from_headers(req.headers(), &self.inner.settings.identity);

        let span = tracing::info_span!(
            "request",
            %method,
            %path,
            request_id = %request_id,
            user = tracing::field::Empty,
            groups = tracing::field::Empty,
        );
        if let Some(caller) = &caller {
            span.record("user", caller.user.as_str());
            span.record("groups", tracing::field::debug(&caller.groups));
        }

        let result = self
            .dispatch_route(&method, &path, filter.clone(), caller, deadline)
            .instrument(span.clone())
            .await;

        let mut response = match result {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => {
                span.in_scope(|| match e.status_code() {
                    s if s.is_server_error() => tracing::error!(error = %e, "Request failed"),
                    _ => tracing::info!(error = %e, "Request rejected"),
                });
                error_response(&e, &request_id)
            }
        };
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        let labels = [
            ("status", response.status().as_u16().to_string()),
            ("method", method.to_string()),
            ("region", filter.region),
            ("environment", filter.environment),
            ("path", path),
        ];
        histogram!(REQUEST_DURATION, &labels).record(started.elapsed().as_secs_f64());
        counter!(REQUESTS, &labels).increment(1);

        response
    }

    async fn dispatch_route(
        &self,
        method: &Method,
        path: &str,
        filter: RequestFilter,
        caller: Option<CallerIdentity>,
        deadline: Instant,
    ) -> Result<Bytes, AggregatorError> {
        if *method != Method::GET {
            return Err(AggregatorError::MethodNotAllowed);
        }
        match self.route(path) {
            Route::Discovery => Ok(serde_json::to_vec(&ApiResourceList::default())?.into()),
            Route::Aggregate => self.aggregate(filter, caller, deadline).await,
            Route::OpenApi => self.openapi().await,
            Route::Unknown => Err(AggregatorError::NotFound),
        }
    }

    async fn aggregate(
        &self,
        filter: RequestFilter,
        caller: Option<CallerIdentity>,
        deadline: Instant,
    ) -> Result<Bytes, AggregatorError> {
        if filter.uri.is_empty() {
            return Err(AggregatorError::MissingUri);
        }

        let candidates = self.inner.selector.select(&filter)?;
        tracing::debug!(candidates = candidates.len(), uri = %filter.uri, "Fanning out");

        let items = self
            .inner
            .executor
            .execute(candidates, &filter.uri, caller, deadline)
            .await;
        Ok(serde_json::to_vec(&AggregateList::new(items))?.into())
    }

    async fn openapi(&self) -> Result<Bytes, AggregatorError> {
        let Some(path) = &self.inner.settings.api_spec_file else {
            return Err(AggregatorError::NotFound);
        };
        tokio::fs::read(path).await.map(Bytes::from).map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read API spec file");
            AggregatorError::NotFound
        })
    }
}

fn json_response(status: StatusCode, body: Bytes) -> ApiResponse {
    let mut response = Response::new(Full::new(body).map_err(|e| match e {}).boxed());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn error_response(error: &AggregatorError, request_id: &str) -> ApiResponse {
    let status = error.status_code();
    let body = Status::failure(
        status.as_u16(),
        error.reason(),
        format!("{request_id}: {error}"),
    );
    match serde_json::to_vec(&body) {
        Ok(body) => json_response(status, body.into()),
        Err(_) => make_boxed_error_response(status),
    }
}

impl Service<Request<Incoming>> for AggregatorService {
    type Response = ApiResponse;
    type Error = AggregatorError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(req).await) })
    }
}
