//! Media engine capability — what a session needs from a WebRTC peer connection.
//!
//! The engine is a black box: it accepts remote descriptions and candidates and emits
//! local candidates, tracks and state changes. Anything that can do that (a browser
//! bridge, a native WebRTC stack, a test double) plugs in here.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use peerlink_common::{IceCandidateInit, SessionDescription};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Failed to create answer: {0}")]
    CreateAnswer(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Peer connection is closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Overall peer connection state (`RTCPeerConnectionState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE transport state (`RTCIceConnectionState`). Distinct from the overall state:
/// ICE `failed` is recoverable by an ICE restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        })
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        })
    }
}

impl fmt::Display for IceGatheringState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::New => "new",
            Self::Gathering => "gathering",
            Self::Complete => "complete",
        })
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stable => "stable",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::HaveLocalPranswer => "have-local-pranswer",
            Self::HaveRemotePranswer => "have-remote-pranswer",
            Self::Closed => "closed",
        })
    }
}

/// A remote track surfaced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub stream_ids: Vec<String>,
}

/// Everything the engine reports asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A locally gathered candidate; `None` marks the end of gathering.
    LocalCandidate(Option<IceCandidateInit>),
    Track(RemoteTrack),
    ConnectionState(PeerConnectionState),
    IceConnectionState(IceConnectionState),
    IceGatheringState(IceGatheringState),
    SignalingState(SignalingState),
}

/// An active receiver with adjustable buffering hints.
pub trait RtpReceiver: Send + Sync {
    fn kind(&self) -> MediaKind;

    /// Target jitter buffer depth.
    fn set_jitter_buffer_target(&self, target: Duration);

    /// Playout delay hint; `None` leaves the choice to the engine.
    fn set_playout_delay_hint(&self, delay: Option<Duration>);
}

/// One WebRTC peer connection. A session owns exactly one and never shares it.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Add a receive-only video transceiver.
    fn add_recv_only_video(&self) -> Result<(), EngineError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    /// The local description currently applied, once `set_local_description` succeeded.
    fn local_description(&self) -> Option<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), EngineError>;

    fn receivers(&self) -> Vec<Arc<dyn RtpReceiver>>;

    fn restart_ice(&self);

    /// Current overall connection state, for observers that missed events.
    fn connection_state(&self) -> PeerConnectionState;

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    /// Close the connection. Calls on a closed engine are expected to be ignored.
    fn close(&self);
}
