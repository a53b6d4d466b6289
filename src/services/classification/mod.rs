// Object classification: ranked labels for a (preferably cut-out) image

pub mod local;
pub mod remote;

use async_trait::async_trait;
use image::DynamicImage;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::core::config::ClassifierConfig;
use crate::core::errors::{ClassificationError, ClassificationResult};
use crate::core::types::Label;

pub use local::{LocalClassifier, OnnxObservationModel, ObservationModel};
pub use remote::VisionClassifier;

/// Produces confidence-sorted labels for an image
///
/// A successful result is never empty; absence is `NoObjectsDetected`.
#[async_trait]
pub trait ObjectClassifier: Send + Sync {
    async fn classify(&self, image: &DynamicImage) -> ClassificationResult<Vec<Label>>;
}

/// One localized instance from a detection-style model
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    /// x1, y1, x2, y2 in model input pixels
    pub bbox: [f32; 4],
}

/// Raw model output, by result shape
#[derive(Debug, Clone, PartialEq)]
pub enum Observations {
    Detections(Vec<Detection>),
    Classifications(Vec<Label>),
    Empty,
}

#[derive(Debug, Clone, Copy)]
pub struct RankingPolicy {
    /// A detection must exceed this to be accepted
    pub detection_threshold: f32,
    /// Whole-image scores below this are dropped
    pub classification_floor: f32,
    pub max_results: usize,
}

impl RankingPolicy {
    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self {
            detection_threshold: config.detection_threshold,
            classification_floor: config.classification_floor,
            max_results: config.max_results,
        }
    }
}

/// Strip synonym lists ("tabby, tabby cat") down to the first name
pub fn normalize_label(identifier: &str) -> String {
    identifier
        .split(',')
        .next()
        .unwrap_or(identifier)
        .trim()
        .to_string()
}

/// Turn model observations into a ranked, non-empty label list
///
/// Detection-style output yields the single best instance if it clears the
/// detection threshold. Otherwise classification-style output is tried:
/// scores under the floor are dropped, the rest sorted descending,
/// de-duplicated by label and capped. Anything else is `NoObjectsDetected`.
pub fn rank_observations(
    observations: Observations,
    policy: &RankingPolicy,
) -> ClassificationResult<Vec<Label>> {
    if let Observations::Detections(detections) = &observations {
        let best = detections
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
        match best {
            Some(best) if best.confidence > policy.detection_threshold => {
                return Ok(vec![Label::new(normalize_label(&best.label), best.confidence)]);
            }
            Some(best) => debug!(
                "Best detection '{}' at {:.2} is under {:.2}",
                best.label, best.confidence, policy.detection_threshold
            ),
            None => {}
        }
    }

    if let Observations::Classifications(mut scores) = observations {
        scores.retain(|l| l.confidence >= policy.classification_floor);
        scores.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let mut ranked: Vec<Label> = Vec::with_capacity(policy.max_results);
        for label in scores {
            let name = normalize_label(&label.identifier);
            if name.is_empty() || ranked.iter().any(|l| l.identifier == name) {
                continue;
            }
            ranked.push(Label::new(name, label.confidence));
            if ranked.len() == policy.max_results {
                break;
            }
        }
        if !ranked.is_empty() {
            return Ok(ranked);
        }
    }

    Err(ClassificationError::NoObjectsDetected)
}

/// Candidate model paths, in load priority order
///
/// 1. `<dir>/<base>.onnx` (single file)
/// 2. `<dir>/<base>.onnxpkg/model.ort`, or the package root if that is absent
/// 3. `<dir>/<base>.ort` (precompiled)
pub fn model_candidates(dir: &Path, base_name: &str) -> Vec<PathBuf> {
    let package = dir.join(format!("{}.onnxpkg", base_name));
    let inner = package.join("model.ort");
    vec![
        dir.join(format!("{}.onnx", base_name)),
        if inner.exists() { inner } else { package },
        dir.join(format!("{}.ort", base_name)),
    ]
}

/// Load the first candidate that exists and loads successfully
pub fn load_first_model<T>(
    dir: &Path,
    base_name: &str,
    mut load: impl FnMut(&Path) -> anyhow::Result<T>,
) -> ClassificationResult<(PathBuf, T)> {
    let candidates = model_candidates(dir, base_name);
    for path in &candidates {
        if !path.exists() {
            continue;
        }
        match load(path) {
            Ok(model) => return Ok((path.clone(), model)),
            Err(e) => warn!("Failed to load classifier model {}: {:#}", path.display(), e),
        }
    }
    Err(ClassificationError::ModelNotFound {
        base_name: base_name.to_string(),
        searched: candidates.iter().map(|p| p.display().to_string()).collect(),
    })
}
