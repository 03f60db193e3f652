use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Not found: {details}")]
    NotFound { details: String },

    #[error("SQL Gateway error (Status: {status_code}): {details}")]
    Server { status_code: u16, details: String },

    #[error("Failed to parse SQL Gateway response: {details}")]
    ResponseParsing { details: String },

    #[error("Invalid gateway URL: {0}")]
    InvalidUrl(String),
}

impl GatewayError {
    /// The session or operation no longer exists on the gateway.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound { .. })
    }

    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Network(_) => true,
            GatewayError::Server { status_code, .. } => *status_code >= 500,
            GatewayError::NotFound { .. }
            | GatewayError::ResponseParsing { .. }
            | GatewayError::InvalidUrl(_) => false,
        }
    }

    /// Server-provided detail text, if any.
    pub fn details(&self) -> String {
        match self {
            GatewayError::Server { details, .. }
            | GatewayError::NotFound { details }
            | GatewayError::ResponseParsing { details } => details.clone(),
            other => other.to_string(),
        }
    }
}
