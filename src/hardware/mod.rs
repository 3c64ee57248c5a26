//! Hardware profiling
//!
//! This module inspects the host (RAM, VRAM, CPU topology, GPU backend),
//! classifies it into a capability tier, and derives a complete set of
//! llama.cpp engine parameters, optionally specialized for one model file.
//!
//! Detection is advisory, not safety-critical: every probe degrades to a
//! conservative default instead of failing, so profiling as a whole cannot
//! return an error.

pub mod estimate;
pub mod gpu;
pub mod params;
pub mod snapshot;
pub mod tier;

pub use estimate::ModelSizeEstimate;
pub use params::{
    calculate_context_length, calculate_gpu_layers, EngineParameters, KvCacheType, ParameterError,
    ParameterOverrides,
};
pub use snapshot::{GpuBackend, HardwareSnapshot};
pub use tier::HardwareTier;

use std::path::Path;

/// Profile the host and derive engine parameters for one specific model.
///
/// This is the main entry point of the profiler: it captures a fresh
/// [`HardwareSnapshot`], estimates the model's size and layer count, computes
/// GPU offload and context length for it, then fills in the tier table.
pub fn profile_for_model(model_path: &Path) -> EngineParameters {
    let snapshot = HardwareSnapshot::capture();
    let estimate = ModelSizeEstimate::for_path(model_path);

    let n_gpu_layers = if snapshot.backend == GpuBackend::Cpu {
        0
    } else {
        calculate_gpu_layers(
            estimate.size_gb,
            snapshot.vram_available_gb,
            estimate.layer_count,
        )
    };

    let n_ctx = calculate_context_length(
        snapshot.vram_available_gb,
        snapshot.ram_available_gb,
        estimate.size_gb,
        n_gpu_layers,
    );

    let tier = HardwareTier::classify(snapshot.ram_total_gb, snapshot.vram_total_gb);

    let params = EngineParameters::derive(
        tier,
        n_gpu_layers,
        n_ctx,
        snapshot.cpu_cores_physical,
        snapshot.cpu_cores_logical,
    );

    tracing::info!(
        tier = %tier,
        backend = %snapshot.backend,
        model = %model_path.display(),
        model_size_gb = estimate.size_gb,
        n_gpu_layers,
        n_ctx,
        n_batch = params.n_batch,
        "Hardware profile derived for model"
    );

    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_for_model_never_panics_on_missing_file() {
        // Unknown model name falls back to the 7B Q4 estimate; the profiler
        // must still hand back usable parameters.
        let params = profile_for_model(Path::new("/nonexistent/mystery-model.gguf"));
        assert!(params.n_ctx >= 4096);
        assert!(params.n_batch >= 128);
        assert!(params.n_threads >= 1);
    }
}
