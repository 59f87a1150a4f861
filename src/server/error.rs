use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

pub type AppResult<T> = Result<T, Error>;

/// anything that went wrong while talking to the origin site
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream {url} responded with {status}")]
    Status { status: StatusCode, url: String },

    #[error("upstream request to {url} timed out")]
    Timeout { url: String },

    #[error("upstream request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("no upstream client strategy is configured")]
    NoStrategy,
}

impl UpstreamError {
    pub fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else {
            Self::Transport {
                url: url.to_string(),
                message: err.to_string(),
            }
        }
    }

    /// the status the origin answered with, none for transport level failures
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 4xx from the origin is mirrored so the player sees the real reason (403 usually), anything
    /// 5xx or transport related is our gateway failing
    pub fn response_status(&self) -> StatusCode {
        match self {
            Self::Status { status, .. } if status.is_client_error() => *status,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error("{0}")]
    InternalServerErrorWithContext(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(e) => e.response_status(),
            Self::InternalServerErrorWithContext(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // internals never leak to the client, upstream failures are expected noise
        let detail = match &self {
            Self::InternalServerErrorWithContext(context) => {
                error!("internal error: {}", context);
                "Internal server error".to_string()
            }
            Self::Upstream(e) => {
                debug!("surfacing upstream failure as {}: {}", status, e);
                e.to_string()
            }
            other => other.to_string(),
        };

        (status, Json(ErrorBody { detail })).into_response()
    }
}
