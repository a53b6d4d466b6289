// Foreground instance mask from a YOLO-style segmentation model
//
// Output 0 is [1, 4 + classes + P, N] (box, class scores, mask coefficients),
// output 1 is the prototype tensor [1, P, mh, mw]. Every instance above the
// confidence floor contributes to one combined mask.

use anyhow::{Context, Result};
use image::{DynamicImage, GrayImage};
use ndarray::{s, Array2, Array4, ArrayView2};
use ort::session::Session;
use parking_lot::Mutex;
use std::path::Path;
use tracing::{debug, info, instrument};

use super::{MaskBuffer, MaskGenerator};
use crate::core::config::SegmentationConfig;
use crate::services::onnx_builder;

const SIGMOID_THRESHOLD: f32 = 0.5;

pub struct OnnxMaskGenerator {
    session: Mutex<Session>,
    input_name: String,
    detections_output: String,
    prototypes_output: String,
    input_size: u32,
    instance_confidence: f32,
    backend: String,
}

impl OnnxMaskGenerator {
    /// Load the mask model
    ///
    /// # Arguments
    /// * `config` - segmentation settings (model path, input size, confidence floor)
    #[instrument(skip(config), fields(path = %config.mask_model_path))]
    pub fn new(config: &SegmentationConfig) -> Result<Self> {
        let (backend, session) =
            onnx_builder::load_session_from_file(Path::new(&config.mask_model_path), "foreground mask")?;
        let (inputs, outputs) = onnx_builder::io_names(&session);

        let input_name = inputs
            .first()
            .cloned()
            .context("Mask model declares no inputs")?;
        if outputs.len() < 2 {
            anyhow::bail!(
                "Mask model must expose detection and prototype outputs, found {:?}",
                outputs
            );
        }

        info!("✓ Foreground mask model loaded ({})", backend);
        Ok(Self {
            session: Mutex::new(session),
            input_name,
            detections_output: outputs[0].clone(),
            prototypes_output: outputs[1].clone(),
            input_size: config.input_size,
            instance_confidence: config.instance_confidence,
            backend,
        })
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Resize to the square model input, normalize to [0, 1], NCHW
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
}

/// Combine all confident instances into one low-resolution mask
///
/// `detections` is [channels, N] with channels >= 4 + 1 + P; `prototypes` is [P, mh * mw].
pub(crate) fn combine_instances(
    detections: ArrayView2<f32>,
    prototypes: &Array2<f32>,
    confidence: f32,
) -> Result<(Vec<u8>, usize)> {
    let channels = detections.shape()[0];
    let num_protos = prototypes.shape()[0];
    if channels < 5 + num_protos {
        anyhow::bail!(
            "Detection output has {} channels, need at least {} for {} mask prototypes",
            channels,
            5 + num_protos,
            num_protos
        );
    }
    let num_classes = channels - 4 - num_protos;
    let mut combined = vec![0u8; prototypes.shape()[1]];
    let mut used = 0;

    for i in 0..detections.shape()[1] {
        let score = detections
            .slice(s![4..4 + num_classes, i])
            .iter()
            .copied()
            .fold(f32::MIN, f32::max);
        if score < confidence {
            continue;
        }
        used += 1;
        let coeffs = detections.slice(s![4 + num_classes..4 + num_classes + num_protos, i]);
        let logits = coeffs.dot(prototypes);
        for (dst, &v) in combined.iter_mut().zip(logits.iter()) {
            if 1.0 / (1.0 + (-v).exp()) > SIGMOID_THRESHOLD {
                *dst = 255;
            }
        }
    }
    Ok((combined, used))
}

impl MaskGenerator for OnnxMaskGenerator {
    fn generate(&self, image: &DynamicImage) -> Result<MaskBuffer> {
        let start = std::time::Instant::now();
        let input = ort::value::Value::from_array(self.preprocess(image))?;

        let (detections, det_shape, prototypes, proto_shape) = {
            let mut session = self.session.lock();
            let outputs = session.run(ort::inputs![self.input_name.as_str() => input])?;
            let (det_shape, det_data) = outputs[self.detections_output.as_str()]
                .try_extract_tensor::<f32>()
                .context("Failed to read detection output")?;
            let (proto_shape, proto_data) = outputs[self.prototypes_output.as_str()]
                .try_extract_tensor::<f32>()
                .context("Failed to read prototype output")?;
            (
                det_data.to_vec(),
                det_shape.iter().map(|&d| d as usize).collect::<Vec<_>>(),
                proto_data.to_vec(),
                proto_shape.iter().map(|&d| d as usize).collect::<Vec<_>>(),
            )
        };

        if det_shape.len() != 3 || proto_shape.len() != 4 {
            anyhow::bail!(
                "Unexpected mask model output shapes {:?} / {:?}",
                det_shape,
                proto_shape
            );
        }
        let (num_protos, mask_h, mask_w) = (proto_shape[1], proto_shape[2], proto_shape[3]);
        let detections = Array2::from_shape_vec((det_shape[1], det_shape[2]), detections)
            .context("Failed to shape detection output")?;
        let prototypes = Array2::from_shape_vec((num_protos, mask_h * mask_w), prototypes)
            .context("Failed to shape prototype output")?;

        let (low_res, used) =
            combine_instances(detections.view(), &prototypes, self.instance_confidence)?;
        debug!(
            "Combined {} of {} instances in {:.2}ms",
            used,
            det_shape[2],
            start.elapsed().as_secs_f64() * 1000.0
        );

        let low_res = GrayImage::from_raw(mask_w as u32, mask_h as u32, low_res)
            .context("Failed to build low resolution mask")?;
        // Combined at prototype resolution, resized once
        let mask = image::imageops::resize(
            &low_res,
            image.width(),
            image.height(),
            image::imageops::FilterType::Nearest,
        );
        Ok(MaskBuffer::contiguous(mask))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_includes_every_confident_instance() {
        // 2 prototypes over a 1x4 mask; 1 class; 3 instances
        let prototypes = Array2::from_shape_vec(
            (2, 4),
            vec![
                10.0, 10.0, -10.0, -10.0, // left half
                -10.0, -10.0, 10.0, 10.0, // right half
            ],
        )
        .unwrap();
        // rows: 4 box, 1 score, 2 coeffs
        let detections = Array2::from_shape_vec(
            (7, 3),
            vec![
                0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, //
                0.0, 0.0, 0.0, //
                0.9, 0.6, 0.1, // scores
                1.0, 0.0, 1.0, // coeff 0
                0.0, 1.0, 1.0, // coeff 1
            ],
        )
        .unwrap();

        let (mask, used) = combine_instances(detections.view(), &prototypes, 0.25).unwrap();
        assert_eq!(used, 2);
        assert_eq!(mask, vec![255, 255, 255, 255]);

        let (mask, used) = combine_instances(detections.view(), &prototypes, 0.7).unwrap();
        assert_eq!(used, 1);
        assert_eq!(mask, vec![255, 255, 0, 0]);
    }

    #[test]
    fn test_too_few_channels_is_an_error() {
        let prototypes = Array2::<f32>::zeros((2, 4));
        // 4 box rows + 2 coefficient rows, no room for a class score
        let detections = Array2::<f32>::ones((6, 3));
        let err = combine_instances(detections.view(), &prototypes, 0.25).unwrap_err();
        assert!(err.to_string().contains("need at least 7"));

        let empty = Array2::<f32>::zeros((0, 0));
        assert!(combine_instances(empty.view(), &prototypes, 0.25).is_err());
    }
}
