// Library exports for the capture-to-translation pipeline
//
// Photograph an object, cut it out of its background, name it, translate
// the name and keep it as a word in the user's collection.

// Core modules
pub mod core;
pub mod orchestration;
pub mod services;
pub mod storage;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::Config,
    errors::{
        CaptureError, ClassificationError, ConfigError, NetworkError, PipelineError,
        SegmentationError, SpeechError, StorageError, TranslationError,
    },
    types::{CapturedWord, Contour, Label, Orientation, PipelineResult, SourceImage},
};

pub use orchestration::{CaptureOptions, CaptureOutcome, CapturePipeline};

pub use services::{
    CameraSession, ForegroundSegmenter, NetworkClient, ObjectClassifier, SpeechNarrator,
    TranslationService, Translator,
};

pub use storage::WordStore;

pub use utils::Metrics;
