// Shared ONNX Runtime session construction for the on-device models
//
// Both the foreground mask model and the local object classifier are loaded
// through here so accelerator selection and thread sizing live in one place.

use anyhow::{Context, Result};
use ort::execution_providers::CPUExecutionProvider;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::Path;
use tracing::{debug, info, warn};

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

#[cfg(all(target_os = "macos", feature = "coreml"))]
use ort::execution_providers::CoreMLExecutionProvider;

#[cfg(all(target_os = "windows", feature = "directml"))]
use ort::execution_providers::DirectMLExecutionProvider;

/// Thread count for CPU inference.
///
/// Windows is capped at 6 threads; beyond that synchronization overhead
/// outweighs the extra cores.
fn optimal_intra_op_threads() -> usize {
    let total_cores = num_cpus::get();

    #[cfg(target_os = "windows")]
    let optimal = std::cmp::min(6, total_cores).max(1);

    #[cfg(not(target_os = "windows"))]
    let optimal = total_cores.max(1);

    debug!("CPU threads: {} total cores, using {} for inference", total_cores, optimal);
    optimal
}

/// Build an ONNX Runtime session, preferring a compiled-in accelerator
///
/// Order: CUDA, CoreML (Apple Neural Engine), DirectML, then CPU. Only
/// providers enabled through Cargo features are attempted.
///
/// # Arguments
/// * `model_bytes` - serialized model (`.onnx` or precompiled `.ort`)
/// * `model_name` - name for logging
///
/// # Returns
/// (backend_name, Session)
pub fn build_session_with_acceleration(
    model_bytes: &[u8],
    model_name: &str,
) -> Result<(String, Session)> {
    if let Ok(forced) = std::env::var("INFERENCE_BACKEND") {
        if forced.trim().eq_ignore_ascii_case("cpu") {
            info!("INFERENCE_BACKEND=cpu, skipping accelerators for {}", model_name);
            return build_cpu_session(model_bytes, model_name).map(|s| ("CPU".to_string(), s));
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([CUDAExecutionProvider::default().build()]))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(optimal_intra_op_threads()))
            .and_then(|b| b.commit_from_memory(model_bytes))
        {
            info!("✓ Using CUDA acceleration for {}", model_name);
            return Ok(("CUDA".to_string(), session));
        }
    }

    #[cfg(all(target_os = "macos", feature = "coreml"))]
    {
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([CoreMLExecutionProvider::default().build()]))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(optimal_intra_op_threads()))
            .and_then(|b| b.commit_from_memory(model_bytes))
        {
            info!("✓ Using CoreML acceleration for {}", model_name);
            return Ok(("CoreML".to_string(), session));
        }
    }

    #[cfg(all(target_os = "windows", feature = "directml"))]
    {
        // DirectML needs sequential execution and no memory pattern
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([DirectMLExecutionProvider::default().build()]))
            .and_then(|b| b.with_parallel_execution(false))
            .and_then(|b| b.with_memory_pattern(false))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level1))
            .and_then(|b| b.with_intra_threads(optimal_intra_op_threads()))
            .and_then(|b| b.commit_from_memory(model_bytes))
        {
            info!("✓ Using DirectML acceleration for {}", model_name);
            return Ok(("DirectML".to_string(), session));
        }
    }

    let session = build_cpu_session(model_bytes, model_name)?;
    warn!("Using CPU-only inference for {} (no accelerator available)", model_name);
    Ok(("CPU".to_string(), session))
}

fn build_cpu_session(model_bytes: &[u8], model_name: &str) -> Result<Session> {
    Session::builder()
        .context(format!("Failed to create ONNX session builder for {}", model_name))?
        .with_execution_providers([CPUExecutionProvider::default().build()])
        .context(format!("Failed to configure CPU execution provider for {}", model_name))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context(format!("Failed to set graph optimization level for {}", model_name))?
        .with_intra_threads(optimal_intra_op_threads())
        .context(format!("Failed to configure intra-op threads for {}", model_name))?
        .commit_from_memory(model_bytes)
        .context(format!(
            "Failed to load {} model ({:.1} MB); the file may be corrupt or built for an incompatible opset",
            model_name,
            model_bytes.len() as f32 / 1_048_576.0
        ))
}

/// Read a model file and build a session for it
pub fn load_session_from_file(path: &Path, model_name: &str) -> Result<(String, Session)> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read {} model at {}", model_name, path.display()))?;
    build_session_with_acceleration(&bytes, model_name)
}

/// Names of a session's inputs and outputs, for shape/branch decisions
pub fn io_names(session: &Session) -> (Vec<String>, Vec<String>) {
    (
        session.inputs.iter().map(|i| i.name.clone()).collect(),
        session.outputs.iter().map(|o| o.name.clone()).collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_count_is_positive() {
        assert!(optimal_intra_op_threads() >= 1);
    }

    #[test]
    fn test_missing_model_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("missing-{}.onnx", uuid::Uuid::new_v4()));
        let err = load_session_from_file(&path, "missing").unwrap_err();
        assert!(err.to_string().contains("Failed to read missing model"));
    }

    #[test]
    fn test_garbage_bytes_fail_to_load() {
        assert!(build_session_with_acceleration(b"not a model", "garbage").is_err());
    }
}
