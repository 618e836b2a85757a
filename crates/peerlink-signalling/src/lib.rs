//! # peerlink-signalling
//!
//! Client side of the signalling channel:
//! - One persistent WebSocket to the signalling server, reconnected after a fixed backoff
//! - Request/answer correlation (identity, session id, available streams)
//! - Per-session routing of inbound ICE/SDP negotiation messages
//! - Lifecycle and status events for observers
//!
//! Media never flows through here; this only carries the control plane that sets it up.

pub mod channel;
pub mod error;
pub mod listeners;
pub mod registry;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use channel::{ChannelEvent, ChannelOptions, ConnectionState, SignallingChannel};
pub use error::{SignallingError, SignallingResult};
pub use listeners::ListenerHandle;
pub use registry::{IceHandler, MediaHandler, RouteOutcome};
