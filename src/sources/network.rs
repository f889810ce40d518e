//! Snapshot-polling source for cameras reachable over HTTP, such as the
//! robot's vision service or an ESPHome camera.

use std::time::Duration;

use reqwest::blocking::Client;
use tracing::{debug, info};
use url::Url;

use super::FrameSource;
use crate::frame::{RawFrame, SourceId};
use crate::{OurError, OurResult};

pub struct NetworkCameraSource {
    source_id: SourceId,
    snapshot_url: Url,
    timeout: Duration,
    client: Option<Client>,
}

impl NetworkCameraSource {
    pub fn new(source_id: SourceId, snapshot_url: Url, timeout: Duration) -> OurResult<Self> {
        match snapshot_url.scheme() {
            "http" | "https" => Ok(Self {
                source_id,
                snapshot_url,
                timeout,
                client: None,
            }),
            scheme => Err(OurError::Config(format!(
                "source {source_id}: unsupported snapshot URL scheme '{scheme}'"
            ))),
        }
    }

    fn fetch(&self, client: &Client) -> OurResult<RawFrame> {
        let response = client
            .get(self.snapshot_url.clone())
            .send()?
            .error_for_status()?;
        let image_bytes = response.bytes()?;
        let image = image::load_from_memory(&image_bytes)?.to_rgb8();
        debug!(
            "Fetched {} byte snapshot from {} for {}",
            image_bytes.len(),
            self.snapshot_url,
            self.source_id
        );
        Ok(RawFrame::from_rgb_image(image))
    }
}

impl FrameSource for NetworkCameraSource {
    fn open(&mut self) -> OurResult<()> {
        if self.client.is_some() {
            return Ok(());
        }

        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| OurError::Open {
                source_id: self.source_id.clone(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        // Fetch once so an unreachable camera is reported at open time.
        self.fetch(&client).map_err(|e| OurError::Open {
            source_id: self.source_id.clone(),
            reason: format!("Test fetch from {} failed: {e}", self.snapshot_url),
        })?;

        info!(
            "Connected to network camera {} for {}",
            self.snapshot_url, self.source_id
        );
        self.client = Some(client);
        Ok(())
    }

    fn read_frame(&mut self) -> OurResult<RawFrame> {
        let client = self.client.as_ref().ok_or_else(|| OurError::Read {
            source_id: self.source_id.clone(),
            reason: "camera is not open".to_string(),
        })?;
        self.fetch(client).map_err(|e| OurError::Read {
            source_id: self.source_id.clone(),
            reason: e.to_string(),
        })
    }

    fn close(&mut self) {
        if self.client.take().is_some() {
            info!("Disconnected from network camera {}", self.snapshot_url);
        }
    }

    fn is_open(&self) -> bool {
        self.client.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_scheme() {
        let url = Url::parse("rtsp://camera.local/stream").expect("url");
        let result = NetworkCameraSource::new(SourceId::from("robot"), url, Duration::from_secs(1));
        assert!(matches!(result, Err(OurError::Config(_))));
    }

    #[test]
    fn test_read_before_open_fails() {
        let url = Url::parse("http://127.0.0.1:9/snapshot").expect("url");
        let mut source =
            NetworkCameraSource::new(SourceId::from("robot"), url, Duration::from_millis(200))
                .expect("source");
        assert!(!source.is_open());
        assert!(matches!(source.read_frame(), Err(OurError::Read { .. })));
        source.close();
    }
}
