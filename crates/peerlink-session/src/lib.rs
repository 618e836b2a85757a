//! # peerlink-session
//!
//! One [`NegotiationSession`] per (consumer, producer, session) triple. It owns exactly one
//! media-engine peer connection and drives it from the remote offer to teardown:
//!
//! 1. Configure a receive-only video transceiver
//! 2. Remote offer → set remote → create answer → set local → send answer
//! 3. Exchange ICE candidates, optionally filtered by address/protocol
//! 4. Connection `failed` → close notification + teardown; ICE `failed` → ICE restart
//! 5. `end()` detaches everything, exactly once
//!
//! The media engine itself is abstracted behind [`PeerConnection`].

pub mod engine;
pub mod ice;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{
    EngineError, EngineEvent, IceConnectionState, IceGatheringState, MediaKind,
    PeerConnection, PeerConnectionState, RemoteTrack, RtpReceiver, SignalingState,
};
pub use ice::{CandidateFilter, CandidateVerdict};
pub use session::{NegotiationSession, SessionEvent, SessionOptions, MAX_PLAYBACK_DELAY_MS};
