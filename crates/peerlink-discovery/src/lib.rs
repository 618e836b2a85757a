//! # peerlink-discovery
//!
//! Lists the producers a discovery service knows about (`GET {base}/streams`) and maps
//! its raw records into [`StreamDescriptor`]s.

pub mod client;
pub mod error;
pub mod raw;

pub use client::DiscoveryClient;
pub use error::DiscoveryError;
pub use peerlink_common::StreamDescriptor;
pub use raw::RawStream;
