use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failures surfaced to the caller of the proxy or admin API.
///
/// Per-attempt upstream failures never show up here; they are recovered by failover and only the
/// final outcome (`AllCandidatesExhausted`) reaches the caller.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("missing or invalid bearer credential")]
    Unauthorized,

    /// The deployment has no admin key, so nothing can be authenticated.
    #[error("admin key is not configured on the server")]
    AdminKeyNotConfigured,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// The requested scheme is unknown and there is no default scheme to fall back to.
    #[error("no scheme matches '{0}' and no default scheme is configured")]
    SchemeNotFound(String),

    /// Every channel in the resolved scheme is disabled, or the scheme is empty.
    #[error("no eligible channel in scheme '{scheme}'")]
    NoEligibleChannel { scheme: String },

    #[error("all {attempts} candidate channel(s) failed")]
    AllCandidatesExhausted { attempts: usize },

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProxyError::AdminKeyNotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::SchemeNotFound(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::NoEligibleChannel { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::AllCandidatesExhausted { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::ChannelNotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable reason.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::Unauthorized => "unauthorized",
            ProxyError::AdminKeyNotConfigured => "admin_key_not_configured",
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::PayloadTooLarge { .. } => "payload_too_large",
            ProxyError::SchemeNotFound(_) => "scheme_not_found",
            ProxyError::NoEligibleChannel { .. } => "no_eligible_channel",
            ProxyError::AllCandidatesExhausted { .. } => "upstream_unavailable",
            ProxyError::ChannelNotFound(_) => "channel_not_found",
            ProxyError::Internal(_) => "internal_error",
        }
    }
}

impl From<anyhow::Error> for ProxyError {
    fn from(e: anyhow::Error) -> Self {
        ProxyError::Internal(e.to_string())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}
