//! Producer descriptor — an immutable snapshot of one remote video source.

use serde::{Deserialize, Serialize};

/// A remote media producer as seen by the control client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub id: String,
    pub name: String,
    pub running: bool,
    /// Last error reported by the producer, if any.
    pub error: Option<String>,
    pub encode: Option<String>,
    pub height: Option<u32>,
    pub width: Option<u32>,
    /// Frames per second; `0.0` when the producer does not report a frame interval.
    pub fps: f64,
    pub thermal: bool,
    /// Device path of the capture source, `"unknown"` when not a local device.
    pub source: String,
}

impl StreamDescriptor {
    pub fn resolution(&self) -> Option<(u32, u32)> {
        self.width.zip(self.height)
    }

    pub fn is_healthy(&self) -> bool {
        self.running && self.error.is_none()
    }
}
