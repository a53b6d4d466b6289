pub mod camera;
pub mod classification;
pub mod network;
pub mod onnx_builder; // Shared ONNX session builder for the mask and classifier models
pub mod segmentation;
pub mod speech;
pub mod translation;

// Re-export commonly used services
pub use camera::CameraSession;
pub use classification::{LocalClassifier, ObjectClassifier, VisionClassifier};
pub use network::NetworkClient;
pub use segmentation::ForegroundSegmenter;
pub use speech::SpeechNarrator;
pub use translation::{CachedTranslator, GoogleTranslator, TranslationService, Translator};
