use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("API error: {code} - {message}")]
    ApiError { code: u16, message: String },

    #[error("Rate limited on {route}: {reason}")]
    RateLimited { route: String, reason: String },

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Gateway closed with fatal code {code}: {reason}")]
    FatalClose { code: u16, reason: String },

    #[error("Unknown event name: {0}")]
    UnknownEvent(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::core::config::ConfigError),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Other error: {0}")]
    Other(String),
}

impl ClientError {
    /// True for outcomes produced by a local or cached rate limit
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// True for connect/send/timeout failures
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::NetworkError(_) | Self::HttpError(_))
    }
}
