// Cloud label detection (Google Vision images:annotate)

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::DynamicImage;
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::ObjectClassifier;
use crate::core::config::ClassifierConfig;
use crate::core::errors::{ClassificationError, ClassificationResult};
use crate::core::types::Label;
use crate::services::network::{FetchOptions, NetworkClient};
use crate::utils::encode_png_async;

/// Labels requested from the service before local filtering
const REQUESTED_LABELS: usize = 5;

#[derive(Debug, Deserialize)]
struct LabelAnnotation {
    description: String,
    #[serde(default)]
    score: f32,
}

#[derive(Debug, Deserialize)]
struct AnnotateError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateResponse {
    #[serde(default)]
    label_annotations: Vec<LabelAnnotation>,
    error: Option<AnnotateError>,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    responses: Vec<AnnotateResponse>,
}

/// Remote strategy; sends the image as PNG and keeps only confident labels
pub struct VisionClassifier {
    client: Arc<NetworkClient>,
    url: String,
    locale: String,
    floor: f32,
    max_results: usize,
    options: FetchOptions,
}

impl VisionClassifier {
    pub fn new(
        client: Arc<NetworkClient>,
        config: &ClassifierConfig,
        options: FetchOptions,
    ) -> ClassificationResult<Self> {
        let key = config.api_key.as_deref().unwrap_or_default();
        let url = Url::parse_with_params(&config.vision_endpoint, &[("key", key)]).map_err(|e| {
            ClassificationError::DetectionFailed(anyhow::anyhow!("invalid vision endpoint: {}", e))
        })?;
        Ok(Self {
            client,
            url: url.to_string(),
            locale: config.locale.clone(),
            floor: config.remote_floor,
            max_results: config.max_results,
            options,
        })
    }

    fn request_body(&self, png: &[u8]) -> serde_json::Value {
        json!({
            "requests": [{
                "image": {"content": STANDARD.encode(png)},
                "features": [{"type": "LABEL_DETECTION", "maxResults": REQUESTED_LABELS}],
                "imageContext": {"languageHints": [self.locale]},
            }]
        })
    }
}

/// Parse an annotate response into ranked labels
pub(crate) fn parse_labels(
    body: &[u8],
    floor: f32,
    max_results: usize,
) -> ClassificationResult<Vec<Label>> {
    let parsed: BatchResponse = serde_json::from_slice(body)
        .map_err(|e| ClassificationError::DetectionFailed(anyhow::anyhow!("bad response: {}", e)))?;
    let Some(response) = parsed.responses.into_iter().next() else {
        return Err(ClassificationError::NoObjectsDetected);
    };
    if let Some(err) = response.error {
        return Err(ClassificationError::DetectionFailed(anyhow::anyhow!(
            "vision service: {}",
            err.message
        )));
    }

    let mut annotations = response.label_annotations;
    annotations.retain(|a| a.score >= floor);
    annotations.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut labels: Vec<Label> = Vec::with_capacity(max_results);
    for a in annotations {
        let name = a.description.trim().to_lowercase();
        if name.is_empty() || labels.iter().any(|l| l.identifier == name) {
            continue;
        }
        labels.push(Label::new(name, a.score));
        if labels.len() == max_results {
            break;
        }
    }

    if labels.is_empty() {
        Err(ClassificationError::NoObjectsDetected)
    } else {
        Ok(labels)
    }
}

#[async_trait]
impl ObjectClassifier for VisionClassifier {
    #[instrument(skip(self, image), fields(width = image.width(), height = image.height()))]
    async fn classify(&self, image: &DynamicImage) -> ClassificationResult<Vec<Label>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(ClassificationError::InvalidImage(
                "image has zero width or height".to_string(),
            ));
        }

        let png = encode_png_async(image.clone())
            .await
            .map_err(|e| ClassificationError::InvalidImage(format!("{:#}", e)))?;

        let body = self.request_body(&png);
        let bytes = self.client.post_json(&self.url, &body, &self.options).await?;
        let labels = parse_labels(&bytes, self.floor, self.max_results)?;
        debug!("Remote labels: {:?}", labels);
        Ok(labels)
    }
}
