pub mod config;
pub mod errors;
pub mod languages;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{
    CaptureError, ClassificationError, ConfigError, NetworkError, PipelineError, SegmentationError,
    SpeechError, StorageError, TranslationError,
};
pub use languages::Language;
pub use types::{CapturedWord, Contour, Label, Orientation, PipelineResult, SourceImage};
