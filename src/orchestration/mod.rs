pub mod capture_pipeline;

pub use capture_pipeline::{CaptureOptions, CaptureOutcome, CapturePipeline};
