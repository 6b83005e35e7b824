//! Error types for the incident engine.

use std::time::Duration;

use crate::incident::ArtifactKind;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The frame source ended or became unreadable. Terminal for that pipeline.
    #[error("Frame source exhausted: {0}")]
    SourceExhausted(String),

    /// A live source produced no frame within the configured timeout.
    #[error("Frame source stalled: no frame within {0:?}")]
    SourceStalled(Duration),

    /// A crop region collapsed to zero area after clamping.
    #[error("Degenerate crop region for {0}")]
    DegenerateCrop(ArtifactKind),

    /// A clip was requested while the ring buffer held no frames.
    #[error("Frame buffer is empty")]
    EmptyBuffer,

    /// An upload or record submission failed after every retry.
    #[error("Upload of {kind} failed after {attempts} attempts: {reason}")]
    Upload {
        kind: ArtifactKind,
        attempts: u32,
        reason: String,
    },

    /// The reporting API refused the incident record.
    #[error("Incident {0} rejected by reporting API")]
    Rejected(String),

    /// A single downstream call exceeded its timeout.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Reporting API transport error
    #[error("API error: {0}")]
    Api(String),

    /// Pixel buffer does not match the declared frame geometry.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// A pipeline for this camera id is already active.
    #[error("Camera {0} is already active")]
    AlreadyRunning(String),

    /// No pipeline for this camera id is active.
    #[error("Camera {0} is not active")]
    NotRunning(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image encoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Video encoding error
    #[error("Video error: {0}")]
    Video(#[from] opencv::Error),
}

impl Error {
    /// Whether a failed downstream call is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Api(_) | Error::Io(_))
    }
}
