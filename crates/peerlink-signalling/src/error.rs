//! Error types for the signalling channel.
//!
//! Transport and protocol faults never surface here: they are logged and reported as
//! [`ChannelEvent`](crate::ChannelEvent)s. Only caller mistakes and cancellation do.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignallingError {
    /// The URL handed to `connect` cannot be used for a WebSocket.
    #[error("Invalid signalling URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The channel was closed while a request was waiting for its answer.
    #[error("Request cancelled: signalling channel closed")]
    Cancelled,
}

pub type SignallingResult<T> = std::result::Result<T, SignallingError>;
