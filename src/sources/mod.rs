//! Camera sources.
//!
//! A [`FrameSource`] is the blocking "give me the next frame" capability of a
//! single camera. Each one lives on its own worker thread (see [`worker`]) and
//! the async side only ever talks to it through a [`SourceHandle`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::OurResult;
use crate::config::{SourceConfig, SourceKind};
use crate::frame::RawFrame;

pub mod network;
pub mod test_pattern;
pub mod usb;
pub mod worker;

pub use worker::SourceHandle;

/// Lifecycle of one source as reported by health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Unopened,
    Open,
    /// Open failed or the last read failed; retried on the next cycle
    Unavailable,
    Closed,
}

/// A single camera.
///
/// Implementations may block; they are only ever driven from a dedicated
/// worker thread. `open` on an open source and `close` on a closed one must
/// be no-ops.
pub trait FrameSource {
    fn open(&mut self) -> OurResult<()>;

    fn read_frame(&mut self) -> OurResult<RawFrame>;

    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Builds the source for a configuration entry.
///
/// Called on the source's worker thread, so sources do not need to be `Send`.
pub type SourceFactory =
    Arc<dyn Fn(&SourceConfig) -> OurResult<Box<dyn FrameSource>> + Send + Sync>;

/// The factory used by the binary: one backend per [`SourceKind`].
pub fn default_factory(read_timeout: std::time::Duration) -> SourceFactory {
    Arc::new(move |config: &SourceConfig| -> OurResult<Box<dyn FrameSource>> {
        Ok(match &config.kind {
            SourceKind::Usb {
                index,
                width,
                height,
                fps,
            } => Box::new(usb::UsbCameraSource::new(
                config.id.clone(),
                *index,
                *width,
                *height,
                *fps,
            )),
            SourceKind::Network { url } => Box::new(network::NetworkCameraSource::new(
                config.id.clone(),
                url.clone(),
                read_timeout,
            )?),
            SourceKind::TestPattern { width, height } => {
                Box::new(test_pattern::TestPatternSource::new(*width, *height))
            }
        })
    })
}
