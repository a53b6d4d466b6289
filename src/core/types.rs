// Shared types for the capture-to-translation pipeline

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// EXIF-style orientation stored alongside a captured frame
///
/// Pixels are kept as the sensor delivered them; `apply` produces the
/// upright image that all segmentation work happens in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Orientation {
    #[default]
    Up,
    UpMirrored,
    Down,
    DownMirrored,
    LeftMirrored,
    Right,
    RightMirrored,
    Left,
}

impl Orientation {
    /// Map an EXIF orientation tag (1-8). Unknown values fall back to `Up`.
    pub fn from_exif(value: u8) -> Self {
        match value {
            2 => Orientation::UpMirrored,
            3 => Orientation::Down,
            4 => Orientation::DownMirrored,
            5 => Orientation::LeftMirrored,
            6 => Orientation::Right,
            7 => Orientation::RightMirrored,
            8 => Orientation::Left,
            _ => Orientation::Up,
        }
    }

    pub fn exif_value(self) -> u8 {
        match self {
            Orientation::Up => 1,
            Orientation::UpMirrored => 2,
            Orientation::Down => 3,
            Orientation::DownMirrored => 4,
            Orientation::LeftMirrored => 5,
            Orientation::Right => 6,
            Orientation::RightMirrored => 7,
            Orientation::Left => 8,
        }
    }

    /// Render the stored pixels upright.
    pub fn apply(self, image: &DynamicImage) -> DynamicImage {
        match self {
            Orientation::Up => image.clone(),
            Orientation::UpMirrored => image.fliph(),
            Orientation::Down => image.rotate180(),
            Orientation::DownMirrored => image.flipv(),
            Orientation::LeftMirrored => image.rotate90().fliph(),
            Orientation::Right => image.rotate90(),
            Orientation::RightMirrored => image.rotate270().fliph(),
            Orientation::Left => image.rotate270(),
        }
    }
}

/// A raw frame as delivered by the camera (or an upload)
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub image: DynamicImage,
    pub orientation: Orientation,
    /// Pixels per display point
    pub scale: f32,
}

impl SourceImage {
    pub fn new(image: DynamicImage, orientation: Orientation, scale: f32) -> Self {
        Self {
            image,
            orientation,
            scale,
        }
    }

    /// The frame in upright pixel space
    pub fn upright(&self) -> DynamicImage {
        self.orientation.apply(&self.image)
    }
}

/// A boundary point in normalized (0..1) image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPoint {
    pub x: f32,
    pub y: f32,
}

/// Closed polygon approximating the subject's silhouette
///
/// Points are angularly sorted around their centroid; the last point is
/// implicitly joined back to the first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contour {
    pub points: Vec<NormalizedPoint>,
}

impl Contour {
    pub fn empty() -> Self {
        Self { points: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Closed SVG path in a `width` x `height` frame
    pub fn to_svg_path(&self, width: f32, height: f32) -> String {
        let mut path = String::with_capacity(self.points.len() * 16);
        for (i, p) in self.points.iter().enumerate() {
            let cmd = if i == 0 { 'M' } else { 'L' };
            path.push_str(&format!("{}{:.1} {:.1} ", cmd, p.x * width, p.y * height));
        }
        if !self.points.is_empty() {
            path.push('Z');
        }
        path
    }
}

/// One ranked classifier candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub identifier: String,
    pub confidence: f32,
}

impl Label {
    pub fn new(identifier: impl Into<String>, confidence: f32) -> Self {
        Self {
            identifier: identifier.into(),
            confidence,
        }
    }
}

/// Output of the foreground segmenter
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// Foreground mask in upright pixel space; `None` when nothing was found
    pub mask: Option<GrayImage>,
    pub contour: Contour,
    pub cutout: DynamicImage,
}

/// Ephemeral state of one pipeline run; owned by the in-flight request
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub source_image: SourceImage,
    pub mask: Option<GrayImage>,
    pub contour: Contour,
    pub cutout: DynamicImage,
    pub labels: Vec<Label>,
    pub translations: HashMap<String, String>,
}

impl PipelineResult {
    /// The best label (index 0 of the ranked list)
    pub fn best_label(&self) -> Option<&Label> {
        self.labels.first()
    }
}

/// A persisted word in the user's collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedWord {
    pub id: Uuid,
    pub detected_text: String,
    pub translation: String,
    pub target_language: String,
    pub captured_date: DateTime<Utc>,
    /// Encoded cut-out image; stored out-of-line by the word store
    #[serde(skip)]
    pub image_data: Option<Vec<u8>>,
    pub notes: Option<String>,
    pub is_reviewed: bool,
    pub review_count: u32,
    pub last_reviewed_date: Option<DateTime<Utc>>,
}

impl CapturedWord {
    pub fn new(
        detected_text: impl Into<String>,
        translation: impl Into<String>,
        target_language: impl Into<String>,
        image_data: Option<Vec<u8>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            detected_text: detected_text.into(),
            translation: translation.into(),
            target_language: target_language.into(),
            captured_date: Utc::now(),
            image_data,
            notes: None,
            is_reviewed: false,
            review_count: 0,
            last_reviewed_date: None,
        }
    }

    pub fn has_image(&self) -> bool {
        self.image_data.is_some()
    }

    /// Whether `image_data`, if present, decodes to an image
    pub fn image_is_valid(&self) -> bool {
        match &self.image_data {
            Some(bytes) => image::load_from_memory(bytes).is_ok(),
            None => true,
        }
    }

    pub fn mark_reviewed(&mut self, at: DateTime<Utc>) {
        self.is_reviewed = true;
        self.review_count += 1;
        self.last_reviewed_date = Some(at);
    }
}
