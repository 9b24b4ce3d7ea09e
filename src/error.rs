use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Discovery failed. Partial results are never returned alongside this.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,

    #[error("scan failed: {0}")]
    Failed(String),

    #[error("connection manager is not running")]
    ManagerStopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectCause {
    Timeout(Duration),
    NotFound,
    Rejected(String),
    AdapterUnavailable,
    ManagerStopped,
}

impl fmt::Display for ConnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectCause::Timeout(after) => write!(f, "timed out after {}s", after.as_secs()),
            ConnectCause::NotFound => f.write_str("device not found"),
            ConnectCause::Rejected(reason) => write!(f, "rejected: {reason}"),
            ConnectCause::AdapterUnavailable => f.write_str("no Bluetooth adapter available"),
            ConnectCause::ManagerStopped => f.write_str("connection manager is not running"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to connect to {address}: {cause}")]
pub struct ConnectError {
    pub address: String,
    pub cause: ConnectCause,
}

impl ConnectError {
    pub fn new(address: impl Into<String>, cause: ConnectCause) -> Self {
        Self {
            address: address.into(),
            cause,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("heart rate measurement characteristic not found")]
    CharacteristicMissing,

    #[error("failed to enable notifications: {0}")]
    NotifyFailed(String),
}

/// The zone artifact could not be used. Workers recover from this by
/// running with an empty zone table.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot access zone file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("zone file {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("zone file {0} has no \"zones\" list")]
    MissingZones(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to start monitoring worker for {address}: {source}")]
    Spawn {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to stop monitoring worker (pid {pid}): {source}")]
    Terminate {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Everything that ends a monitoring session early.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error("notification stream ended unexpectedly")]
    StreamClosed,

    #[error("BLE error: {0}")]
    Ble(String),
}

/// Error type for HTTP handlers. Every variant renders as
/// `{"error": <message>}` with a non-2xx status.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Busy(&'static str),

    #[error("{0}")]
    Validation(&'static str),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Busy(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Scan(_)
            | ApiError::Connect(_)
            | ApiError::Worker(_)
            | ApiError::Config(_)
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(error = %message, "Request failed");
        } else {
            tracing::info!(status = status.as_u16(), error = %message, "Request rejected");
        }

        (status, axum::Json(json!({ "error": message }))).into_response()
    }
}
