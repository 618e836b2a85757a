//! HTTP client for the producer discovery service.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use peerlink_discovery::DiscoveryClient;
//!
//! # async fn run() -> Result<(), peerlink_discovery::DiscoveryError> {
//! let client = DiscoveryClient::new("http://192.168.2.2:6020", Duration::from_secs(5))?;
//! for stream in client.streams().await? {
//!     println!("{} ({})", stream.name, stream.id);
//! }
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use peerlink_common::StreamDescriptor;
use peerlink_common::config::DiscoveryConfig;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::{error::DiscoveryError, raw::RawStream};

pub struct DiscoveryClient {
    base_url: Url,
    http: Client,
}

impl DiscoveryClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DiscoveryError> {
        let mut base = Url::parse(base_url)
            .map_err(|e| DiscoveryError::InvalidBaseUrl(base_url.to_owned(), e))?;
        // Relative joins replace the last segment unless the path ends in '/'.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("PeerLink/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { base_url: base, http })
    }

    pub fn from_config(cfg: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        Self::new(&cfg.base_url, Duration::from_secs(cfg.timeout_secs))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Fetch every producer the service knows about.
    ///
    /// `GET {base}/streams`
    pub async fn streams(&self) -> Result<Vec<StreamDescriptor>, DiscoveryError> {
        let url = self
            .base_url
            .join("streams")
            .map_err(|e| DiscoveryError::InvalidBaseUrl(self.base_url.to_string(), e))?;
        debug!(%url, "Fetching available streams");

        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), %body, "Discovery request rejected");
            return Err(DiscoveryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await?;
        let raw: Vec<RawStream> = serde_json::from_slice(&bytes)?;
        debug!(count = raw.len(), "Discovered streams");
        Ok(raw.into_iter().map(StreamDescriptor::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one canned HTTP response and return the request head it received.
    async fn serve_once(status: &str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let status = status.to_owned();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (format!("http://{addr}/v1"), task)
    }

    #[test]
    fn rejects_invalid_base_url() {
        let err = DiscoveryClient::new("not a url", Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, DiscoveryError::InvalidBaseUrl(..)));
    }

    #[test]
    fn base_url_gains_trailing_slash() {
        let client = DiscoveryClient::new("http://10.0.0.1:6020/api", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url().as_str(), "http://10.0.0.1:6020/api/");
    }

    #[tokio::test]
    async fn fetches_and_maps_streams() {
        let (base, server) = serve_once(
            "200 OK",
            r#"[{"id":"cam-1","running":true,"error":null,"video_and_stream":{"name":"Front","stream_information":{"configuration":{"encode":"H264","height":720,"width":1280,"frame_interval":{"numerator":1,"denominator":15}}},"video_source":{"Local":{"device_path":"/dev/video2"}}}}]"#,
        )
        .await;

        let client = DiscoveryClient::new(&base, Duration::from_secs(5)).unwrap();
        let streams = client.streams().await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /v1/streams "));
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].name, "Front");
        assert_eq!(streams[0].fps, 15.0);
        assert_eq!(streams[0].source, "/dev/video2");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (base, _server) = serve_once("503 Service Unavailable", "busy").await;

        let client = DiscoveryClient::new(&base, Duration::from_secs(5)).unwrap();
        match client.streams().await {
            Err(DiscoveryError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "busy");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }
}
