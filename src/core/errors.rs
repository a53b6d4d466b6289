// Typed errors for every stage of the capture-to-translation pipeline
//
// Each layer surfaces its own error enum; the orchestrator wraps them in
// PipelineError so the UI-facing caller can map any terminal failure to a
// user-visible state.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Camera / capture-layer errors
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("No suitable camera device is available")]
    DeviceUnavailable,

    #[error("Camera access has not been granted")]
    PermissionDenied,

    #[error("Photo capture produced no image")]
    NoImage,

    #[error("Camera session worker is no longer running")]
    SessionClosed,
}

/// Foreground segmentation errors
///
/// All of these are recoverable: the caller falls back to the unmodified
/// source image.
#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("Invalid or undecodable image: {0}")]
    InvalidImage(String),

    #[error("Foreground mask generation failed: {0}")]
    MaskGenerationFailed(#[source] anyhow::Error),

    #[error("Mask buffer exposes no directly addressable memory")]
    NoAddressablePixelBuffer,

    #[error("Mask buffer is malformed: {0}")]
    MalformedMask(String),

    #[error("Segmentation task failed: {0}")]
    TaskJoinFailed(String),
}

/// Object classification errors
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Classifier model '{base_name}' not found (searched: {searched:?})")]
    ModelNotFound {
        base_name: String,
        searched: Vec<String>,
    },

    #[error("Detection failed: {0}")]
    DetectionFailed(#[source] anyhow::Error),

    #[error("Remote vision request failed: {0}")]
    Remote(#[from] NetworkError),

    #[error("No objects detected")]
    NoObjectsDetected,
}

/// Translation errors
///
/// Multi-target translation is all-or-nothing: any single failure is
/// reported as the error for the whole request.
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("Translation failed (status: {status})")]
    Failed { status: u16 },

    #[error("Translation request failed: {0}")]
    Network(#[source] NetworkError),

    #[error("Invalid translation response: {0}")]
    InvalidResponse(String),

    #[error("No target languages requested")]
    NoTargets,

    #[error("Translation task failed: {0}")]
    TaskJoinFailed(String),
}

impl From<NetworkError> for TranslationError {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::Http { status } => TranslationError::Failed { status },
            other => TranslationError::Network(other),
        }
    }
}

/// Network-layer errors
///
/// Kept `Clone + PartialEq` so the retry loop can hold on to the last
/// error and callers can match on the connectivity variants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("No network connection")]
    NoConnection,

    #[error("Slow network connection (latency {}ms)", .latency.as_millis())]
    SlowConnection { latency: Duration },

    #[error("Request timed out")]
    Timeout,

    #[error("HTTP error (status: {status})")]
    Http { status: u16 },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Request failed: {0}")]
    Request(String),
}

impl NetworkError {
    /// Whether the UI should suggest checking connectivity
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            NetworkError::NoConnection | NetworkError::SlowConnection { .. } | NetworkError::Timeout
        )
    }
}

/// Speech output errors (never fatal to the caller)
#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("Audio session error: {0}")]
    AudioSession(String),

    #[error("Speech synthesizer error: {0}")]
    Synthesizer(String),
}

/// Word store errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Word {0} not found")]
    NotFound(Uuid),

    #[error("Stored image data for word {0} is not a valid image")]
    InvalidImage(Uuid),

    #[error("Database operation failed: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Image storage failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<anyhow::Error> for StorageError {
    fn from(err: anyhow::Error) -> Self {
        StorageError::Database(err)
    }
}

/// Pipeline orchestration errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("Classification failed: {0}")]
    Classification(#[from] ClassificationError),

    #[error("Translation failed: {0}")]
    Translation(#[from] TranslationError),

    #[error("Saving word failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid source image: {0}")]
    InvalidImage(String),

    #[error("Pipeline task failed: {0}")]
    TaskJoinFailed(String),
}

impl PipelineError {
    /// Whether the failure stems from missing or degraded connectivity
    pub fn is_connectivity(&self) -> bool {
        match self {
            PipelineError::Classification(ClassificationError::Remote(e)) => e.is_connectivity(),
            PipelineError::Translation(TranslationError::Network(e)) => e.is_connectivity(),
            _ => false,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Threshold '{name}' must be in [0.0, 1.0], got {value}")]
    InvalidThreshold { name: &'static str, value: f32 },

    #[error("Invalid segmentation config: {0}")]
    InvalidSegmentationConfig(String),

    #[error("Invalid classifier config: {0}")]
    InvalidClassifierConfig(String),

    #[error("Invalid speech config: {0}")]
    InvalidSpeechConfig(String),

    #[error("Invalid network config: {0}")]
    InvalidNetworkConfig(String),

    #[error("Invalid storage path: {0}")]
    InvalidStoragePath(String),

    #[error("Environment variable parsing failed: {0}")]
    EnvVarError(String),
}

// Convenience type aliases for Results
pub type CaptureResult<T> = Result<T, CaptureError>;
pub type SegmentationResult<T> = Result<T, SegmentationError>;
pub type ClassificationResult<T> = Result<T, ClassificationError>;
pub type TranslationResult<T> = Result<T, TranslationError>;
pub type NetworkResult<T> = Result<T, NetworkError>;
pub type StorageResult<T> = Result<T, StorageError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
