//! # peerlink-common
//!
//! Shared types, configuration, and the signalling wire protocol used across all PeerLink crates.
//! This is the foundation layer: no I/O, only primitives and contracts.

pub mod config;
pub mod protocol;
pub mod stream;

pub use protocol::{
    Answer, IceCandidateInit, Message, Negotiation, Question, SdpType, SessionBind,
    SessionDescription,
};
pub use stream::StreamDescriptor;
