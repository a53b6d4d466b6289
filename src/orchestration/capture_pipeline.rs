// Capture pipeline: capture -> segment -> classify -> translate -> persist

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

use crate::core::errors::{CaptureError, ClassificationError, PipelineError};
use crate::core::types::{CapturedWord, Contour, PipelineResult, SourceImage};
use crate::services::camera::CameraSession;
use crate::services::classification::ObjectClassifier;
use crate::services::segmentation::ForegroundSegmenter;
use crate::services::translation::TranslationService;
use crate::storage::WordStore;
use crate::utils::metrics::Stage;
use crate::utils::{thumbnail_png_async, Metrics};

/// Stored word images are square thumbnails of this size
pub const THUMBNAIL_SIZE: u32 = 512;
/// Transparent margin kept around the cropped cut-out, in display points
pub const CUTOUT_PADDING_POINTS: f32 = 8.0;

#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    /// Target language codes; empty means the configured defaults
    pub targets: Vec<String>,
    /// Persist one word per target on success
    pub save: bool,
}

#[derive(Debug)]
pub struct CaptureOutcome {
    pub result: PipelineResult,
    /// Segmentation failed and the raw frame was used instead
    pub segmentation_fallback: bool,
    pub saved: Vec<CapturedWord>,
}

/// Runs one capture through every stage, strictly in order
pub struct CapturePipeline {
    segmenter: Arc<ForegroundSegmenter>,
    classifier: Arc<dyn ObjectClassifier>,
    translator: Arc<TranslationService>,
    store: Option<WordStore>,
    default_targets: Vec<String>,
    metrics: Metrics,
}

impl CapturePipeline {
    pub fn new(
        segmenter: Arc<ForegroundSegmenter>,
        classifier: Arc<dyn ObjectClassifier>,
        translator: Arc<TranslationService>,
        store: Option<WordStore>,
        default_targets: Vec<String>,
        metrics: Metrics,
    ) -> Self {
        Self {
            segmenter,
            classifier,
            translator,
            store,
            default_targets,
            metrics,
        }
    }

    /// Take a photo with `camera` and run it through the pipeline
    pub async fn capture_and_run(
        &self,
        camera: &CameraSession,
        options: &CaptureOptions,
    ) -> Result<CaptureOutcome, PipelineError> {
        let start = Instant::now();
        let frame = camera.capture_photo().await;
        self.metrics.record_stage(Stage::Capture, start.elapsed());
        match frame {
            Some(frame) => self.run(frame, options).await,
            None => {
                self.metrics.record_pipeline(false);
                Err(CaptureError::NoImage.into())
            }
        }
    }

    /// Run segment -> classify -> translate (-> persist) on one frame
    ///
    /// Segmentation failures fall back to the upright frame; classification
    /// and translation failures end the run.
    #[instrument(skip(self, source, options), fields(targets = options.targets.len(), save = options.save))]
    pub async fn run(
        &self,
        source: SourceImage,
        options: &CaptureOptions,
    ) -> Result<CaptureOutcome, PipelineError> {
        let outcome = self.run_stages(source, options).await;
        self.metrics.record_pipeline(outcome.is_ok());
        outcome
    }

    async fn run_stages(
        &self,
        source: SourceImage,
        options: &CaptureOptions,
    ) -> Result<CaptureOutcome, PipelineError> {
        let pipeline_start = Instant::now();

        let stage = Instant::now();
        let (mask, contour, cutout, segmentation_fallback) = match self.segmenter.segment(&source).await {
            Ok(seg) => (seg.mask, seg.contour, seg.cutout, false),
            Err(e) => {
                warn!("Segmentation failed, using the raw frame: {}", e);
                self.metrics.record_segmentation_fallback();
                (None, Contour::empty(), source.upright(), true)
            }
        };
        self.metrics.record_stage(Stage::Segmentation, stage.elapsed());

        let stage = Instant::now();
        let labels = self.classifier.classify(&cutout).await?;
        self.metrics.record_stage(Stage::Classification, stage.elapsed());
        let best = labels
            .first()
            .map(|l| l.identifier.clone())
            .ok_or(ClassificationError::NoObjectsDetected)?;

        let targets = if options.targets.is_empty() {
            &self.default_targets
        } else {
            &options.targets
        };
        let stage = Instant::now();
        let translations = self.translator.translate_all(&best, targets).await?;
        self.metrics.record_stage(Stage::Translation, stage.elapsed());

        let result = PipelineResult {
            source_image: source,
            mask,
            contour,
            cutout,
            labels,
            translations,
        };

        let saved = match (&self.store, options.save) {
            (Some(store), true) => self.persist(store, &result, targets).await?,
            _ => Vec::new(),
        };

        info!(
            "✓ '{}' -> {} translations in {:.2}ms{}",
            best,
            result.translations.len(),
            pipeline_start.elapsed().as_secs_f64() * 1000.0,
            if segmentation_fallback { " (raw frame)" } else { "" }
        );

        Ok(CaptureOutcome {
            result,
            segmentation_fallback,
            saved,
        })
    }

    /// Store one word per distinct target in a single transaction
    async fn persist(
        &self,
        store: &WordStore,
        result: &PipelineResult,
        targets: &[String],
    ) -> Result<Vec<CapturedWord>, PipelineError> {
        let Some(best) = result.best_label() else {
            return Ok(Vec::new());
        };

        let cropped = if result.contour.is_empty() {
            result.cutout.clone()
        } else {
            self.segmenter
                .crop_cutout(&result.cutout, CUTOUT_PADDING_POINTS, result.source_image.scale)
        };
        let image = thumbnail_png_async(cropped, THUMBNAIL_SIZE)
            .await
            .map_err(|e| PipelineError::InvalidImage(format!("{:#}", e)))?;

        let mut saved = Vec::new();
        let mut seen: Vec<&str> = Vec::new();
        for code in targets.iter().map(|c| c.trim()) {
            if seen.contains(&code) {
                continue;
            }
            seen.push(code);
            let Some(translation) = result.translations.get(code) else {
                continue;
            };
            saved.push(CapturedWord::new(
                best.identifier.clone(),
                translation.clone(),
                code,
                Some(image.clone()),
            ));
        }
        store.insert_all(&saved).await?;
        for _ in &saved {
            self.metrics.record_word_saved();
        }
        Ok(saved)
    }
}
