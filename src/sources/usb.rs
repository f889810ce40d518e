//! USB camera source backed by nokhwa.

use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    utils::{
        CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType, Resolution,
    },
};
use tracing::{debug, info, warn};

use super::FrameSource;
use crate::frame::{RawFrame, SourceId};
use crate::{OurError, OurResult};

pub struct UsbCameraSource {
    source_id: SourceId,
    index: u32,
    width: u32,
    height: u32,
    fps: u32,
    camera: Option<Camera>,
}

impl UsbCameraSource {
    pub fn new(source_id: SourceId, index: u32, width: u32, height: u32, fps: u32) -> Self {
        Self {
            source_id,
            index,
            width,
            height,
            fps,
            camera: None,
        }
    }

    fn open_error(&self, reason: impl std::fmt::Display) -> OurError {
        OurError::Open {
            source_id: self.source_id.clone(),
            reason: reason.to_string(),
        }
    }

    fn read_error(&self, reason: impl std::fmt::Display) -> OurError {
        OurError::Read {
            source_id: self.source_id.clone(),
            reason: reason.to_string(),
        }
    }
}

impl FrameSource for UsbCameraSource {
    fn open(&mut self) -> OurResult<()> {
        if self.camera.is_some() {
            return Ok(());
        }

        let resolution = Resolution::new(self.width, self.height);
        let camera_format = CameraFormat::new(resolution, FrameFormat::MJPEG, self.fps);
        let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(camera_format));

        let mut camera = Camera::new(CameraIndex::Index(self.index), format)
            .map_err(|e| self.open_error(format!("Failed to create camera: {e}")))?;
        camera
            .open_stream()
            .map_err(|e| self.open_error(format!("Failed to open camera stream: {e}")))?;

        info!(
            "Opened USB camera {} for {} at {}",
            self.index,
            self.source_id,
            camera.camera_format()
        );
        self.camera = Some(camera);
        Ok(())
    }

    fn read_frame(&mut self) -> OurResult<RawFrame> {
        let camera = self
            .camera
            .as_mut()
            .ok_or_else(|| OurError::Read {
                source_id: self.source_id.clone(),
                reason: "camera is not open".to_string(),
            })?;

        let buffer = camera.frame();
        let buffer = buffer.map_err(|e| self.read_error(format!("Failed to capture frame: {e}")))?;
        let image = buffer
            .decode_image::<RgbFormat>()
            .map_err(|e| self.read_error(format!("Failed to decode frame: {e}")))?;
        debug!("Decoded {}x{} frame", image.width(), image.height());
        Ok(RawFrame::from_rgb_image(image))
    }

    fn close(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            if let Err(e) = camera.stop_stream() {
                warn!("Failed to stop camera stream for {}: {e}", self.source_id);
            }
            info!("Released USB camera {} ({})", self.index, self.source_id);
        }
    }

    fn is_open(&self) -> bool {
        self.camera.is_some()
    }
}

impl Drop for UsbCameraSource {
    fn drop(&mut self) {
        self.close();
    }
}
