//! Discovery error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Invalid discovery base URL '{0}': {1}")]
    InvalidBaseUrl(String, url::ParseError),

    #[error("Discovery request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Discovery service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed discovery response: {0}")]
    Decode(#[from] serde_json::Error),
}
