//! Raw producer records as served by the discovery endpoint.
//!
//! Only the fields the control client needs are modelled; everything else in the
//! record is ignored.

use peerlink_common::StreamDescriptor;
use serde::Deserialize;

const UNKNOWN_SOURCE: &str = "unknown";

#[derive(Debug, Clone, Deserialize)]
pub struct RawStream {
    pub id: String,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub video_and_stream: RawVideoAndStream,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawVideoAndStream {
    pub name: String,
    #[serde(default)]
    pub stream_information: RawStreamInformation,
    #[serde(default)]
    pub video_source: RawVideoSource,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawStreamInformation {
    #[serde(default)]
    pub configuration: RawConfiguration,
    #[serde(default)]
    pub extended_configuration: Option<RawExtendedConfiguration>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfiguration {
    #[serde(default)]
    pub encode: Option<String>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub frame_interval: Option<RawFrameInterval>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct RawFrameInterval {
    #[serde(default)]
    pub numerator: Option<u32>,
    #[serde(default)]
    pub denominator: Option<u32>,
}

impl RawFrameInterval {
    /// `denominator / numerator`, or `0` unless both are present and the division is defined.
    pub fn fps(&self) -> f64 {
        match (self.numerator, self.denominator) {
            (Some(num), Some(den)) if num != 0 => f64::from(den) / f64::from(num),
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawExtendedConfiguration {
    #[serde(default)]
    pub thermal: bool,
}

/// Source variants are externally tagged; only local devices carry a path we use.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawVideoSource {
    #[serde(rename = "Local", default)]
    pub local: Option<RawLocalSource>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawLocalSource {
    #[serde(default)]
    pub device_path: Option<String>,
}

impl From<RawStream> for StreamDescriptor {
    fn from(raw: RawStream) -> Self {
        let RawVideoAndStream {
            name,
            stream_information,
            video_source,
        } = raw.video_and_stream;
        let config = stream_information.configuration;

        Self {
            id: raw.id,
            name,
            running: raw.running,
            error: raw.error,
            encode: config.encode,
            height: config.height,
            width: config.width,
            fps: config.frame_interval.map(|i| i.fps()).unwrap_or(0.0),
            thermal: stream_information
                .extended_configuration
                .is_some_and(|ext| ext.thermal),
            source: video_source
                .local
                .and_then(|local| local.device_path)
                .unwrap_or_else(|| UNKNOWN_SOURCE.to_owned()),
        }
    }
}
