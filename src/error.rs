//! Error handling for the frame relay.

use std::time::Duration;

use thiserror::Error;

use crate::frame::SourceId;

/// Application error types
#[derive(Error, Debug)]
pub enum OurError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Image processing errors
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A camera could not be acquired
    #[error("Failed to open source {source_id}: {reason}")]
    Open { source_id: SourceId, reason: String },

    /// A single frame read failed
    #[error("Failed to read frame from {source_id}: {reason}")]
    Read { source_id: SourceId, reason: String },

    /// A frame read did not complete in time
    #[error("Frame read from {source_id} timed out after {timeout:?}")]
    ReadTimeout {
        source_id: SourceId,
        timeout: Duration,
    },

    /// A raw frame could not be compressed
    #[error("Encode error: {0}")]
    Encode(String),

    /// The requested source is not configured
    #[error("Unknown source: {0}")]
    UnknownSource(SourceId),

    /// Generic application errors
    #[error("Application error: {0}")]
    App(String),
}

/// Application result type
pub type OurResult<T> = std::result::Result<T, OurError>;
