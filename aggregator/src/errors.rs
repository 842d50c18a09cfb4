use http::StatusCode;
use registry::index::IndexError;
use thiserror::Error;

/// Errors that fail a whole inbound request. Per-cluster failures are never
/// raised as one of these; they are recorded on the cluster's aggregate.
#[derive(Error, Debug)]
pub enum AggregatorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing required query parameter: uri")]
    MissingUri,

    #[error("failed to list clusters: {0}")]
    ListClusters(#[from] IndexError),

    #[error("failed to serialize response: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found")]
    NotFound,

    #[error("method not allowed")]
    MethodNotAllowed,
}

impl AggregatorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AggregatorError::NotFound => StatusCode::NOT_FOUND,
            AggregatorError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Kubernetes `Status.reason` for this failure.
    pub fn reason(&self) -> &'static str {
        match self {
            AggregatorError::NotFound => "NotFound",
            AggregatorError::MethodNotAllowed => "MethodNotAllowed",
            _ => "InternalError",
        }
    }
}
