// On-device classification through ONNX Runtime

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::DynamicImage;
use ndarray::{Array2, Array4};
use ort::session::Session;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

use super::{
    load_first_model, rank_observations, Detection, ObjectClassifier, Observations, RankingPolicy,
};
use crate::core::config::ClassifierConfig;
use crate::core::errors::{ClassificationError, ClassificationResult};
use crate::core::types::Label;
use crate::services::onnx_builder;

/// Runs a vision model and reports its raw observations
pub trait ObservationModel: Send + Sync {
    fn observe(&self, image: &DynamicImage) -> Result<Observations>;
}

/// Output layout, decided once from the model's declared outputs
#[derive(Debug, Clone, PartialEq, Eq)]
enum OutputKind {
    /// `labels` (i64), `boxes`, `scores`; optional `orig_target_sizes` input
    Detection { takes_sizes: bool },
    /// One [1, C] score tensor
    Classification { output: String },
    Unknown,
}

pub struct OnnxObservationModel {
    session: Mutex<Session>,
    input_name: String,
    kind: OutputKind,
    class_names: Vec<String>,
    input_size: u32,
}

fn output_kind(inputs: &[String], outputs: &[String]) -> OutputKind {
    let has = |name: &str| outputs.iter().any(|o| o == name);
    if has("labels") && has("boxes") && has("scores") {
        OutputKind::Detection {
            takes_sizes: inputs.iter().any(|i| i == "orig_target_sizes"),
        }
    } else if outputs.len() == 1 {
        OutputKind::Classification {
            output: outputs[0].clone(),
        }
    } else {
        OutputKind::Unknown
    }
}

/// Read one class name per line
pub fn load_class_names(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read labels file {}", path.display()))?;
    Ok(text.lines().map(|l| l.trim().to_string()).collect())
}

/// Softmax unless the scores already look like probabilities
pub(crate) fn to_probabilities(scores: &[f32]) -> Vec<f32> {
    let in_range = scores.iter().all(|s| (0.0..=1.0).contains(s));
    let sum: f32 = scores.iter().sum();
    if in_range && (sum - 1.0).abs() < 0.01 {
        return scores.to_vec();
    }
    let max = scores.iter().copied().fold(f32::MIN, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

impl OnnxObservationModel {
    /// Resolve and load the configured model
    #[instrument(skip(config), fields(base = %config.model_base_name))]
    pub fn load(config: &ClassifierConfig) -> ClassificationResult<Self> {
        let (path, (backend, session)) = load_first_model(
            Path::new(&config.models_dir),
            &config.model_base_name,
            |p| onnx_builder::load_session_from_file(p, "object classifier"),
        )?;

        let (inputs, outputs) = onnx_builder::io_names(&session);
        let kind = output_kind(&inputs, &outputs);
        let input_name = inputs
            .first()
            .cloned()
            .unwrap_or_else(|| "images".to_string());

        let class_names = match &config.labels_path {
            Some(p) => load_class_names(Path::new(p)).map_err(ClassificationError::DetectionFailed)?,
            None => Vec::new(),
        };

        info!(
            "✓ Classifier model {} loaded ({}, {:?}, {} class names)",
            path.display(),
            backend,
            kind,
            class_names.len()
        );
        Ok(Self {
            session: Mutex::new(session),
            input_name,
            kind,
            class_names,
            input_size: config.input_size,
        })
    }

    fn class_name(&self, index: usize) -> String {
        self.class_names
            .get(index)
            .filter(|n| !n.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("class_{}", index))
    }

    fn preprocess(&self, img: &DynamicImage) -> Array4<f32> {
        let size = self.input_size;
        let rgb = img
            .resize_exact(size, size, image::imageops::FilterType::Triangle)
            .to_rgb8();
        let mut input = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
            }
        }
        input
    }

    fn detect(&self, image: &DynamicImage, takes_sizes: bool) -> Result<Observations> {
        let images = ort::value::Value::from_array(self.preprocess(image))?;

        let (labels, boxes, scores) = {
            let mut session = self.session.lock();
            let outputs = if takes_sizes {
                let size = self.input_size as i64;
                let sizes = Array2::<i64>::from_shape_vec((1, 2), vec![size, size])?;
                let sizes = ort::value::Value::from_array(sizes)?;
                session.run(ort::inputs![
                    self.input_name.as_str() => images,
                    "orig_target_sizes" => sizes
                ])?
            } else {
                session.run(ort::inputs![self.input_name.as_str() => images])?
            };
            let (_, labels) = outputs["labels"].try_extract_tensor::<i64>()?;
            let (_, boxes) = outputs["boxes"].try_extract_tensor::<f32>()?;
            let (_, scores) = outputs["scores"].try_extract_tensor::<f32>()?;
            (labels.to_vec(), boxes.to_vec(), scores.to_vec())
        };

        let detections = labels
            .iter()
            .zip(scores.iter())
            .enumerate()
            .filter_map(|(i, (&label, &confidence))| {
                let b = boxes.get(i * 4..i * 4 + 4)?;
                Some(Detection {
                    label: self.class_name(label.max(0) as usize),
                    confidence,
                    bbox: [b[0], b[1], b[2], b[3]],
                })
            })
            .collect();
        Ok(Observations::Detections(detections))
    }

    fn classify_scores(&self, image: &DynamicImage, output: &str) -> Result<Observations> {
        let images = ort::value::Value::from_array(self.preprocess(image))?;
        let scores = {
            let mut session = self.session.lock();
            let outputs = session.run(ort::inputs![self.input_name.as_str() => images])?;
            let (_, scores) = outputs[output].try_extract_tensor::<f32>()?;
            scores.to_vec()
        };
        let labels = to_probabilities(&scores)
            .into_iter()
            .enumerate()
            .map(|(i, p)| Label::new(self.class_name(i), p))
            .collect();
        Ok(Observations::Classifications(labels))
    }
}

impl ObservationModel for OnnxObservationModel {
    fn observe(&self, image: &DynamicImage) -> Result<Observations> {
        match &self.kind {
            OutputKind::Detection { takes_sizes } => self.detect(image, *takes_sizes),
            OutputKind::Classification { output } => self.classify_scores(image, output),
            OutputKind::Unknown => Ok(Observations::Empty),
        }
    }
}

/// Local model strategy
pub struct LocalClassifier {
    model: Arc<dyn ObservationModel>,
    policy: RankingPolicy,
}

impl LocalClassifier {
    pub fn new(model: Arc<dyn ObservationModel>, policy: RankingPolicy) -> Self {
        Self { model, policy }
    }
}

#[async_trait]
impl ObjectClassifier for LocalClassifier {
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    async fn classify(&self, image: &DynamicImage) -> ClassificationResult<Vec<Label>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(ClassificationError::InvalidImage(
                "image has zero width or height".to_string(),
            ));
        }
        let model = Arc::clone(&self.model);
        let image = image.clone();
        let start = Instant::now();

        let observations = tokio::task::spawn_blocking(move || model.observe(&image))
            .await
            .map_err(|e| ClassificationError::DetectionFailed(anyhow::anyhow!(e)))?
            .map_err(ClassificationError::DetectionFailed)?;

        let labels = rank_observations(observations, &self.policy)?;
        debug!(
            "Classified as {:?} in {:.2}ms",
            labels.first().map(|l| &l.identifier),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(labels)
    }
}
