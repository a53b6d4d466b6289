// Foreground segmentation: mask, contour and cut-out for a captured frame

pub mod compositing;
pub mod contour;
pub mod mask_model;

use anyhow::Result;
use image::{DynamicImage, GenericImageView, GrayImage};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::core::config::SegmentationConfig;
use crate::core::errors::{SegmentationError, SegmentationResult};
use crate::core::types::{Contour, Segmentation, SourceImage};

pub use compositing::HaloStyle;
pub use mask_model::OnnxMaskGenerator;

/// One plane of a mask buffer; `data` is `None` when the memory cannot be addressed
#[derive(Debug, Clone)]
pub struct MaskPlane {
    pub bytes_per_row: usize,
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub enum MaskLayout {
    Contiguous { bytes_per_row: usize, data: Vec<u8> },
    Planar { planes: Vec<MaskPlane> },
}

/// Single-channel 8-bit mask as produced by a mask generator
#[derive(Debug, Clone)]
pub struct MaskBuffer {
    pub width: u32,
    pub height: u32,
    pub layout: MaskLayout,
}

impl MaskBuffer {
    pub fn contiguous(mask: GrayImage) -> Self {
        let (width, height) = mask.dimensions();
        Self {
            width,
            height,
            layout: MaskLayout::Contiguous {
                bytes_per_row: width as usize,
                data: mask.into_raw(),
            },
        }
    }

    /// Copy the mask into a tightly packed image
    ///
    /// Planar buffers are read from plane 0 only.
    pub fn to_gray(&self) -> SegmentationResult<GrayImage> {
        let (bytes_per_row, data) = match &self.layout {
            MaskLayout::Contiguous {
                bytes_per_row,
                data,
            } => (*bytes_per_row, data.as_slice()),
            MaskLayout::Planar { planes } => {
                let plane = planes
                    .first()
                    .ok_or(SegmentationError::NoAddressablePixelBuffer)?;
                let data = plane
                    .data
                    .as_deref()
                    .ok_or(SegmentationError::NoAddressablePixelBuffer)?;
                (plane.bytes_per_row, data)
            }
        };

        let (w, h) = (self.width as usize, self.height as usize);
        if bytes_per_row < w || data.len() < bytes_per_row * h.saturating_sub(1) + w {
            return Err(SegmentationError::MalformedMask(format!(
                "{}x{} mask with {} bytes per row needs more than {} bytes",
                w,
                h,
                bytes_per_row,
                data.len()
            )));
        }

        let mut packed = Vec::with_capacity(w * h);
        for row in 0..h {
            let start = row * bytes_per_row;
            packed.extend_from_slice(&data[start..start + w]);
        }
        GrayImage::from_raw(self.width, self.height, packed)
            .ok_or_else(|| SegmentationError::MalformedMask("packed size mismatch".to_string()))
    }
}

/// Produces a foreground mask covering all salient instances of an upright image
pub trait MaskGenerator: Send + Sync {
    fn generate(&self, image: &DynamicImage) -> Result<MaskBuffer>;
}

/// Segments captured frames into a cut-out and a contour
///
/// Owns a rayon pool that is created once and reused for every compositing
/// call.
pub struct ForegroundSegmenter {
    generator: Arc<dyn MaskGenerator>,
    pool: Arc<rayon::ThreadPool>,
    config: SegmentationConfig,
}

impl ForegroundSegmenter {
    pub fn new(generator: Arc<dyn MaskGenerator>, config: SegmentationConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.compositing_threads)
            .thread_name(|i| format!("capword-compose-{}", i))
            .build()?;
        info!(
            "Foreground segmenter ready ({} compositing threads, halo {})",
            config.compositing_threads,
            if config.halo_enabled { "on" } else { "off" }
        );
        Ok(Self {
            generator,
            pool: Arc::new(pool),
            config,
        })
    }

    /// Segment `source` into a cut-out and contour
    ///
    /// The frame is rendered upright first; mask, contour and cut-out all
    /// live in that upright pixel space. When the mask holds no foreground
    /// the upright frame is returned unchanged with an empty contour.
    #[instrument(skip(self, source), fields(width = source.image.width(), height = source.image.height()))]
    pub async fn segment(&self, source: &SourceImage) -> SegmentationResult<Segmentation> {
        if source.image.width() == 0 || source.image.height() == 0 {
            return Err(SegmentationError::InvalidImage(
                "image has zero width or height".to_string(),
            ));
        }

        let generator = Arc::clone(&self.generator);
        let pool = Arc::clone(&self.pool);
        let source = source.clone();
        let halo = self.config.halo_enabled.then(|| {
            HaloStyle::from_points(
                self.config.halo_radius_points,
                source.scale,
                self.config.halo_color,
            )
        });

        tokio::task::spawn_blocking(move || {
            let start = std::time::Instant::now();
            let upright = source.upright();

            let buffer = generator
                .generate(&upright)
                .map_err(SegmentationError::MaskGenerationFailed)?;
            let mut mask = buffer.to_gray()?;
            if mask.dimensions() != upright.dimensions() {
                mask = image::imageops::resize(
                    &mask,
                    upright.width(),
                    upright.height(),
                    image::imageops::FilterType::Triangle,
                );
            }

            if !pool.install(|| contour::has_foreground(&mask)) {
                warn!("No foreground found, returning the original frame");
                return Ok(Segmentation {
                    mask: None,
                    contour: Contour::empty(),
                    cutout: upright,
                });
            }

            let (contour, cutout) = pool.install(|| {
                rayon::join(
                    || contour::extract_contour(&mask),
                    || compositing::composite(&upright, &mask, halo),
                )
            });

            debug!(
                "Segmented {}x{} frame: {} contour points in {:.2}ms",
                upright.width(),
                upright.height(),
                contour.len(),
                start.elapsed().as_secs_f64() * 1000.0
            );

            Ok(Segmentation {
                mask: Some(mask),
                contour,
                cutout,
            })
        })
        .await
        .map_err(|e| SegmentationError::TaskJoinFailed(e.to_string()))?
    }

    /// Crop a cut-out to its visible pixels, padding given in display points
    pub fn crop_cutout(&self, cutout: &DynamicImage, padding_points: f32, scale: f32) -> DynamicImage {
        let padding = (padding_points * scale).round().max(0.0) as u32;
        self.pool
            .install(|| compositing::crop_to_non_transparent(cutout, padding))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::types::Orientation;
    use image::{Luma, Rgba, RgbaImage};
    use parking_lot::Mutex;

    /// Returns a fixed mask and records the dimensions it was asked for
    pub(crate) struct ScriptedMask {
        pub buffer: Box<dyn Fn(u32, u32) -> MaskBuffer + Send + Sync>,
        pub seen: Mutex<Vec<(u32, u32)>>,
    }

    impl ScriptedMask {
        pub(crate) fn new(f: impl Fn(u32, u32) -> MaskBuffer + Send + Sync + 'static) -> Self {
            Self {
                buffer: Box::new(f),
                seen: Mutex::new(Vec::new()),
            }
        }

        /// Square foreground in the middle third of the frame
        pub(crate) fn centre_square() -> Self {
            Self::new(|w, h| {
                MaskBuffer::contiguous(GrayImage::from_fn(w, h, |x, y| {
                    let inside = (w / 3..2 * w / 3).contains(&x) && (h / 3..2 * h / 3).contains(&y);
                    Luma([if inside { 255 } else { 0 }])
                }))
            })
        }
    }

    impl MaskGenerator for ScriptedMask {
        fn generate(&self, image: &DynamicImage) -> Result<MaskBuffer> {
            self.seen.lock().push((image.width(), image.height()));
            Ok((self.buffer)(image.width(), image.height()))
        }
    }

    pub(crate) struct FailingMask;

    impl MaskGenerator for FailingMask {
        fn generate(&self, _image: &DynamicImage) -> Result<MaskBuffer> {
            anyhow::bail!("vision request failed")
        }
    }

    fn config(halo: bool) -> SegmentationConfig {
        SegmentationConfig {
            halo_enabled: halo,
            halo_radius_points: 1.0,
            compositing_threads: 2,
            ..SegmentationConfig::default()
        }
    }

    fn frame(w: u32, h: u32, orientation: Orientation) -> SourceImage {
        SourceImage::new(
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([50, 100, 150, 255]))),
            orientation,
            2.0,
        )
    }

    #[tokio::test]
    async fn test_segment_produces_cutout_and_contour() {
        let segmenter =
            ForegroundSegmenter::new(Arc::new(ScriptedMask::centre_square()), config(false)).unwrap();
        let result = segmenter.segment(&frame(90, 90, Orientation::Up)).await.unwrap();

        assert!(result.mask.is_some());
        assert!(!result.contour.is_empty());
        let cut = result.cutout.to_rgba8();
        assert_eq!(cut.get_pixel(0, 0)[3], 0);
        assert_eq!(cut.get_pixel(45, 45)[3], 255);
    }

    #[tokio::test]
    async fn test_mask_runs_on_upright_frame() {
        let generator = Arc::new(ScriptedMask::centre_square());
        let segmenter = ForegroundSegmenter::new(generator.clone(), config(false)).unwrap();
        let result = segmenter.segment(&frame(120, 60, Orientation::Right)).await.unwrap();

        assert_eq!(generator.seen.lock().as_slice(), &[(60, 120)]);
        assert_eq!((result.cutout.width(), result.cutout.height()), (60, 120));
        assert_eq!(result.mask.map(|m| m.dimensions()), Some((60, 120)));
    }

    #[tokio::test]
    async fn test_empty_mask_returns_original_frame() {
        let segmenter = ForegroundSegmenter::new(
            Arc::new(ScriptedMask::new(|w, h| MaskBuffer::contiguous(GrayImage::new(w, h)))),
            config(true),
        )
        .unwrap();
        let source = frame(40, 30, Orientation::Up);
        let result = segmenter.segment(&source).await.unwrap();

        assert!(result.mask.is_none());
        assert!(result.contour.is_empty());
        assert_eq!(result.cutout, source.image);
    }

    #[tokio::test]
    async fn test_low_resolution_mask_is_scaled_to_frame() {
        let segmenter = ForegroundSegmenter::new(
            Arc::new(ScriptedMask::new(|_, _| {
                MaskBuffer::contiguous(GrayImage::from_fn(10, 10, |x, y| {
                    Luma([if (3..7).contains(&x) && (3..7).contains(&y) { 255 } else { 0 }])
                }))
            })),
            config(true),
        )
        .unwrap();
        let result = segmenter.segment(&frame(100, 100, Orientation::Up)).await.unwrap();
        assert_eq!(result.cutout.width(), 100);
        assert_eq!(result.cutout.to_rgba8().get_pixel(50, 50)[3], 255);
    }

    #[tokio::test]
    async fn test_planar_without_memory_fails() {
        let segmenter = ForegroundSegmenter::new(
            Arc::new(ScriptedMask::new(|w, h| MaskBuffer {
                width: w,
                height: h,
                layout: MaskLayout::Planar {
                    planes: vec![MaskPlane {
                        bytes_per_row: w as usize,
                        data: None,
                    }],
                },
            })),
            config(false),
        )
        .unwrap();
        let err = segmenter.segment(&frame(20, 20, Orientation::Up)).await.unwrap_err();
        assert!(matches!(err, SegmentationError::NoAddressablePixelBuffer));
    }

    #[tokio::test]
    async fn test_generator_failure_is_typed() {
        let segmenter = ForegroundSegmenter::new(Arc::new(FailingMask), config(false)).unwrap();
        let err = segmenter.segment(&frame(20, 20, Orientation::Up)).await.unwrap_err();
        assert!(matches!(err, SegmentationError::MaskGenerationFailed(_)));
    }

    #[test]
    fn test_padded_rows_are_repacked() {
        let buffer = MaskBuffer {
            width: 2,
            height: 2,
            layout: MaskLayout::Planar {
                planes: vec![MaskPlane {
                    bytes_per_row: 4,
                    data: Some(vec![1, 2, 0, 0, 3, 4]),
                }],
            },
        };
        assert_eq!(buffer.to_gray().unwrap().into_raw(), vec![1, 2, 3, 4]);

        let short = MaskBuffer {
            width: 4,
            height: 2,
            layout: MaskLayout::Contiguous {
                bytes_per_row: 4,
                data: vec![0; 5],
            },
        };
        assert!(matches!(short.to_gray(), Err(SegmentationError::MalformedMask(_))));
    }

    #[test]
    fn test_crop_cutout_uses_display_scale() {
        let segmenter =
            ForegroundSegmenter::new(Arc::new(ScriptedMask::centre_square()), config(false)).unwrap();
        let mut img = RgbaImage::new(50, 50);
        img.put_pixel(25, 25, Rgba([1, 1, 1, 255]));
        let cropped = segmenter.crop_cutout(&DynamicImage::ImageRgba8(img), 2.0, 3.0);
        assert_eq!((cropped.width(), cropped.height()), (13, 13));
    }
}
