use std::env;
use std::path::Path;

fn main() {
    // Models are loaded at runtime; only warn when the defaults are missing
    let mask_path = "models/foreground-seg.onnx";
    let classifier_candidates = [
        "models/ObjectClassifier.onnx",
        "models/ObjectClassifier.onnxpkg",
        "models/ObjectClassifier.ort",
    ];

    println!("cargo:rerun-if-changed={}", mask_path);
    for candidate in &classifier_candidates {
        println!("cargo:rerun-if-changed={}", candidate);
    }

    match std::fs::metadata(mask_path) {
        Ok(meta) => println!(
            "cargo:warning=Foreground mask model: {:.1} MB",
            meta.len() as f64 / 1_048_576.0
        ),
        Err(_) => println!(
            "cargo:warning=Foreground mask model not found at {} (set MASK_MODEL_PATH at runtime)",
            mask_path
        ),
    }

    if !classifier_candidates.iter().any(|p| Path::new(p).exists()) {
        println!(
            "cargo:warning=Object classifier model not found in models/ \
             (set MODELS_DIR or CLASSIFIER_STRATEGY=remote at runtime)"
        );
    }

    // Detect enabled acceleration features
    let mut enabled_features = Vec::new();

    if env::var("CARGO_FEATURE_CUDA").is_ok() {
        enabled_features.push("CUDA");
    }
    if env::var("CARGO_FEATURE_DIRECTML").is_ok() {
        enabled_features.push("DirectML");
    }
    if env::var("CARGO_FEATURE_COREML").is_ok() {
        enabled_features.push("CoreML");
    }

    if enabled_features.is_empty() {
        println!("cargo:warning=Building with CPU-only inference (no GPU acceleration)");
    } else {
        println!("cargo:warning=GPU acceleration enabled: {}", enabled_features.join(", "));
    }

    let target = env::var("TARGET").unwrap_or_default();
    if target.contains("windows-gnu") && enabled_features.contains(&"CUDA") {
        println!("cargo:warning=WARNING: CUDA binaries may not be available for Windows GNU target");
        println!("cargo:warning=Consider using DirectML instead: cargo build --features directml");
    }
}
