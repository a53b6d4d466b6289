pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{
    decode_with_orientation,
    decode_with_orientation_async,
    encode_png,
    encode_png_async,
    load_image_from_memory_async,
    thumbnail_png_async,
};
pub use metrics::{Metrics, MetricsSnapshot, Stage};
