use http::StatusCode;
use thiserror::Error;

/// Core error type for scope.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("malformed request body: {0}")]
    MalformedRequest(String),

    #[error("no API credential configured; add one in settings or set the environment default")]
    MissingCredential,

    /// Upstream rejected the credential. The provider body is deliberately dropped.
    #[error("upstream rejected the configured credential")]
    UpstreamAuth,

    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<u64> },

    #[error("upstream unavailable (status {status})")]
    UpstreamUnavailable { status: u16 },

    #[error("upstream rejected the request: {status} {message}")]
    UpstreamBadRequest { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// Non-success answer from a Scope server, seen by the client.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("network failure: {0}")]
    Network(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScopeError {
    /// Caller-facing HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::MalformedRequest(_) | Self::UpstreamBadRequest { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::MissingCredential | Self::UpstreamAuth | Self::UpstreamUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Server { status, .. } => StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY),
            Self::Network(_) | Self::Io(_) | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short stable label used in logs and traces.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::MalformedRequest(_) => "malformed_request",
            Self::MissingCredential => "missing_credential",
            Self::UpstreamAuth => "upstream_auth",
            Self::RateLimited { .. } => "rate_limited",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::UpstreamBadRequest { .. } => "upstream_bad_request",
            Self::NotFound(_) => "not_found",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::Server { .. } => "server",
            Self::Network(_) => "network",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, ScopeError>;
