//! Engine parameter derivation
//!
//! Turns a hardware tier plus model-specific measurements into the complete
//! llama.cpp-facing configuration: context length, batching, threading,
//! memory flags, GPU offload, KV-cache quantization and flash-attention.
//!
//! Derivation is a static table lookup with no error conditions. Values are
//! monotonically non-decreasing in tier along every dimension except KV-cache
//! quantization (enabled from medium up to conserve memory) and mlock
//! (enabled only at high+ where paging risk is lower).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hardware::tier::HardwareTier;

/// Fixed ladder of supported context lengths; estimates snap downward onto it
pub const CONTEXT_LADDER: [u32; 6] = [4096, 8192, 16384, 32768, 65536, 131072];

/// KV-cache quantization mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvCacheType {
    /// Full-precision cache (no quantization)
    F16,
    /// 8-bit quantized cache, trades precision for memory
    Q8_0,
}

/// Complete engine-facing configuration, produced once per model load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineParameters {
    /// Context window size in tokens
    pub n_ctx: u32,
    /// Batch size for prompt processing
    pub n_batch: u32,
    /// Generation thread count
    pub n_threads: i32,
    /// Batch-processing thread count
    pub n_threads_batch: i32,
    /// Memory-map the model file
    pub use_mmap: bool,
    /// Lock model pages in RAM
    pub use_mlock: bool,
    /// GPU layer offload: -1 = all, 0 = none, N = partial
    pub n_gpu_layers: i32,
    /// Keep the KV cache on the accelerator
    pub offload_kqv: bool,
    /// KV-cache quantization mode
    pub kv_cache_type: KvCacheType,
    /// Enable flash-attention
    pub flash_attn: bool,
    /// Default cap on generated tokens per request
    pub max_tokens_default: u32,
}

impl EngineParameters {
    /// Fill in the tier table for the given offload/context/CPU measurements.
    pub fn derive(
        tier: HardwareTier,
        n_gpu_layers: i32,
        n_ctx: u32,
        cpu_physical: usize,
        cpu_logical: usize,
    ) -> Self {
        let phys = cpu_physical as i32;
        let logical = cpu_logical as i32;

        match tier {
            HardwareTier::Low => Self {
                n_ctx,
                n_batch: 128,
                n_threads: (phys / 2).max(1),
                n_threads_batch: (phys / 2).max(1),
                use_mmap: true,
                use_mlock: false,
                n_gpu_layers,
                offload_kqv: false,
                kv_cache_type: KvCacheType::F16,
                flash_attn: false,
                max_tokens_default: 256,
            },
            HardwareTier::Medium => Self {
                n_ctx,
                n_batch: 256,
                n_threads: (phys - 1).max(2),
                n_threads_batch: phys.max(2),
                use_mmap: true,
                use_mlock: false,
                n_gpu_layers,
                offload_kqv: n_gpu_layers != 0,
                kv_cache_type: KvCacheType::Q8_0,
                flash_attn: true,
                max_tokens_default: 512,
            },
            HardwareTier::High => Self {
                n_ctx,
                n_batch: 512,
                n_threads: phys,
                n_threads_batch: logical,
                use_mmap: true,
                use_mlock: true,
                n_gpu_layers,
                offload_kqv: n_gpu_layers != 0,
                kv_cache_type: KvCacheType::Q8_0,
                flash_attn: true,
                max_tokens_default: 1024,
            },
            HardwareTier::Ultra => Self {
                n_ctx,
                n_batch: 1024,
                n_threads: phys,
                n_threads_batch: logical,
                use_mmap: true,
                use_mlock: true,
                n_gpu_layers,
                offload_kqv: n_gpu_layers != 0,
                kv_cache_type: KvCacheType::Q8_0,
                flash_attn: true,
                max_tokens_default: 2048,
            },
        }
    }

    /// Minimal, maximally-conservative variant of `self` for the one-shot
    /// load retry: keeps context, offload, batch and threads but drops
    /// KV-cache quantization, flash-attention and mlock.
    pub fn conservative(&self) -> Self {
        Self {
            use_mlock: false,
            kv_cache_type: KvCacheType::F16,
            flash_attn: false,
            ..self.clone()
        }
    }

    /// Apply caller overrides, validating each pinned value.
    pub fn with_overrides(&self, overrides: &ParameterOverrides) -> Result<Self, ParameterError> {
        overrides.validate()?;

        let mut params = self.clone();
        if let Some(n_ctx) = overrides.n_ctx {
            params.n_ctx = n_ctx;
        }
        if let Some(n_batch) = overrides.n_batch {
            params.n_batch = n_batch;
        }
        if let Some(n_threads) = overrides.n_threads {
            params.n_threads = n_threads;
        }
        if let Some(n_threads_batch) = overrides.n_threads_batch {
            params.n_threads_batch = n_threads_batch;
        }
        if let Some(use_mmap) = overrides.use_mmap {
            params.use_mmap = use_mmap;
        }
        if let Some(use_mlock) = overrides.use_mlock {
            params.use_mlock = use_mlock;
        }
        if let Some(n_gpu_layers) = overrides.n_gpu_layers {
            params.n_gpu_layers = n_gpu_layers;
        }
        if let Some(kv_cache_type) = overrides.kv_cache_type {
            params.kv_cache_type = kv_cache_type;
        }
        if let Some(flash_attn) = overrides.flash_attn {
            params.flash_attn = flash_attn;
        }
        if let Some(max_tokens_default) = overrides.max_tokens_default {
            params.max_tokens_default = max_tokens_default;
        }

        Ok(params)
    }
}

/// Invalid override value
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParameterError {
    #[error("context length must be at least 1")]
    InvalidContextLength,

    #[error("batch size must be at least 1")]
    InvalidBatchSize,

    #[error("thread counts must be at least 1")]
    InvalidThreadCount,

    #[error("gpu layer count must be -1 (all), 0 (none), or a positive layer count")]
    InvalidGpuLayers,

    #[error("default max tokens must be at least 1")]
    InvalidMaxTokens,
}

/// Caller-supplied parameter pins, taking precedence over derived values.
///
/// Every field is optional; unset fields keep the derived value. Values are
/// validated when applied, so a bad override fails at configuration time
/// instead of inside the native constructor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterOverrides {
    pub n_ctx: Option<u32>,
    pub n_batch: Option<u32>,
    pub n_threads: Option<i32>,
    pub n_threads_batch: Option<i32>,
    pub use_mmap: Option<bool>,
    pub use_mlock: Option<bool>,
    pub n_gpu_layers: Option<i32>,
    pub kv_cache_type: Option<KvCacheType>,
    pub flash_attn: Option<bool>,
    pub max_tokens_default: Option<u32>,
}

impl ParameterOverrides {
    fn validate(&self) -> Result<(), ParameterError> {
        if self.n_ctx == Some(0) {
            return Err(ParameterError::InvalidContextLength);
        }
        if self.n_batch == Some(0) {
            return Err(ParameterError::InvalidBatchSize);
        }
        if matches!(self.n_threads, Some(n) if n < 1)
            || matches!(self.n_threads_batch, Some(n) if n < 1)
        {
            return Err(ParameterError::InvalidThreadCount);
        }
        if matches!(self.n_gpu_layers, Some(n) if n < -1) {
            return Err(ParameterError::InvalidGpuLayers);
        }
        if self.max_tokens_default == Some(0) {
            return Err(ParameterError::InvalidMaxTokens);
        }
        Ok(())
    }
}

/// How many model layers fit in VRAM.
///
/// Returns -1 for all layers, 0 for CPU-only, or N for partial offload.
/// Reserves 0.5 GB plus ~10 MB per layer for KV cache and runtime overhead;
/// once any headroom exists at least one layer goes to the GPU to keep the
/// accelerator warmed.
pub fn calculate_gpu_layers(
    model_size_gb: f64,
    vram_available_gb: f64,
    total_layers: u32,
) -> i32 {
    let reserved_gb = 0.5 + (total_layers as f64 * 0.01);
    let usable_vram = vram_available_gb - reserved_gb;

    if usable_vram >= model_size_gb {
        return -1;
    }

    if usable_vram <= 0.5 {
        return 0;
    }

    let ratio = usable_vram / model_size_gb;
    let gpu_layers = (total_layers as f64 * ratio) as i32;

    gpu_layers.max(1)
}

/// Optimal context window for the memory left after loading the model.
///
/// Picks a memory pool by offload mode, converts it at ~8192 tokens per GB,
/// then snaps downward onto [`CONTEXT_LADDER`]. Never returns less than the
/// smallest rung: a working floor is always offered.
pub fn calculate_context_length(
    vram_available_gb: f64,
    ram_available_gb: f64,
    model_size_gb: f64,
    n_gpu_layers: i32,
) -> u32 {
    // 0.5 GB base KV overhead plus 10% of the model size
    let reserved_gb = 0.5 + model_size_gb * 0.1;

    let available_for_ctx = match n_gpu_layers {
        -1 => (vram_available_gb - model_size_gb - reserved_gb).max(0.0),
        0 => (ram_available_gb - model_size_gb - 1.5).max(0.0),
        _ => (vram_available_gb.min(ram_available_gb) - model_size_gb - reserved_gb).max(0.0),
    };

    // ~1 GB of pool per 8K tokens of context for a 7B-class model
    let estimated_ctx = (available_for_ctx * 8192.0) as u32;

    for &ctx in CONTEXT_LADDER.iter().rev() {
        if estimated_ctx >= ctx {
            return ctx;
        }
    }

    CONTEXT_LADDER[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_layers_all_fit() {
        // reserved ~0.82 GB, usable ~9.18 GB >= 4.0 GB
        assert_eq!(calculate_gpu_layers(4.0, 10.0, 32), -1);
    }

    #[test]
    fn test_gpu_layers_none_fit() {
        // usable < 0.5 GB floor
        assert_eq!(calculate_gpu_layers(20.0, 0.3, 32), 0);
    }

    #[test]
    fn test_gpu_layers_partial() {
        // usable = 5.0 - 0.82 = 4.18; floor(32 * 0.418) = 13
        let layers = calculate_gpu_layers(10.0, 5.0, 32);
        assert_eq!(layers, 13);
        assert!((1..=31).contains(&layers));
    }

    #[test]
    fn test_gpu_layers_at_least_one_with_headroom() {
        // barely over the 0.5 GB floor still warms the accelerator
        assert_eq!(calculate_gpu_layers(40.0, 1.5, 32), 1);
    }

    #[test]
    fn test_context_length_always_on_ladder() {
        for vram in [0.0, 0.5, 2.0, 6.0, 12.0, 24.0, 48.0, 96.0] {
            for gpu_layers in [-1, 0, 16] {
                let ctx = calculate_context_length(vram, vram, 4.0, gpu_layers);
                assert!(
                    CONTEXT_LADDER.contains(&ctx),
                    "ctx {ctx} not on ladder (vram={vram}, layers={gpu_layers})"
                );
            }
        }
    }

    #[test]
    fn test_context_length_floor_never_zero() {
        assert_eq!(calculate_context_length(0.0, 0.0, 20.0, -1), 4096);
        assert_eq!(calculate_context_length(0.1, 0.1, 20.0, 0), 4096);
    }

    #[test]
    fn test_context_length_full_gpu_pool() {
        // pool = 24 - 4 - 0.9 = 19.1 GB -> ~156K estimate -> snaps to 131072
        assert_eq!(calculate_context_length(24.0, 8.0, 4.0, -1), 131072);
        // pool = 8 - 4 - 0.9 = 3.1 GB -> ~25K estimate -> snaps to 16384
        assert_eq!(calculate_context_length(8.0, 8.0, 4.0, -1), 16384);
    }

    #[test]
    fn test_derive_monotone_in_tier() {
        let tiers = [
            HardwareTier::Low,
            HardwareTier::Medium,
            HardwareTier::High,
            HardwareTier::Ultra,
        ];

        let params: Vec<EngineParameters> = tiers
            .iter()
            .map(|&t| EngineParameters::derive(t, -1, 8192, 8, 16))
            .collect();

        for pair in params.windows(2) {
            assert!(pair[0].n_batch < pair[1].n_batch);
            assert!(pair[0].max_tokens_default < pair[1].max_tokens_default);
            assert!(pair[0].n_threads <= pair[1].n_threads);
            assert!(pair[0].n_threads_batch <= pair[1].n_threads_batch);
        }
    }

    #[test]
    fn test_derive_kv_quant_enables_at_medium() {
        let low = EngineParameters::derive(HardwareTier::Low, 0, 4096, 4, 8);
        let medium = EngineParameters::derive(HardwareTier::Medium, 0, 4096, 4, 8);
        assert_eq!(low.kv_cache_type, KvCacheType::F16);
        assert_eq!(medium.kv_cache_type, KvCacheType::Q8_0);
    }

    #[test]
    fn test_derive_mlock_only_high_and_up() {
        assert!(!EngineParameters::derive(HardwareTier::Low, 0, 4096, 4, 8).use_mlock);
        assert!(!EngineParameters::derive(HardwareTier::Medium, 0, 4096, 4, 8).use_mlock);
        assert!(EngineParameters::derive(HardwareTier::High, 0, 4096, 4, 8).use_mlock);
        assert!(EngineParameters::derive(HardwareTier::Ultra, 0, 4096, 4, 8).use_mlock);
    }

    #[test]
    fn test_derive_no_kqv_offload_without_gpu_layers() {
        let params = EngineParameters::derive(HardwareTier::High, 0, 8192, 8, 16);
        assert!(!params.offload_kqv);
        let params = EngineParameters::derive(HardwareTier::High, -1, 8192, 8, 16);
        assert!(params.offload_kqv);
    }

    #[test]
    fn test_conservative_drops_risky_features() {
        let params = EngineParameters::derive(HardwareTier::Ultra, -1, 32768, 8, 16);
        let safe = params.conservative();
        assert_eq!(safe.kv_cache_type, KvCacheType::F16);
        assert!(!safe.flash_attn);
        assert!(!safe.use_mlock);
        // context, offload and batch survive
        assert_eq!(safe.n_ctx, params.n_ctx);
        assert_eq!(safe.n_gpu_layers, params.n_gpu_layers);
        assert_eq!(safe.n_batch, params.n_batch);
    }

    #[test]
    fn test_overrides_pin_individual_values() {
        let base = EngineParameters::derive(HardwareTier::Medium, -1, 8192, 4, 8);
        let overrides = ParameterOverrides {
            n_ctx: Some(4096),
            flash_attn: Some(false),
            ..Default::default()
        };

        let pinned = base.with_overrides(&overrides).expect("valid overrides");
        assert_eq!(pinned.n_ctx, 4096);
        assert!(!pinned.flash_attn);
        // untouched fields keep the derived value
        assert_eq!(pinned.n_batch, base.n_batch);
    }

    #[test]
    fn test_overrides_reject_invalid_values() {
        let base = EngineParameters::derive(HardwareTier::Low, 0, 4096, 4, 8);

        let bad_ctx = ParameterOverrides {
            n_ctx: Some(0),
            ..Default::default()
        };
        assert_eq!(
            base.with_overrides(&bad_ctx),
            Err(ParameterError::InvalidContextLength)
        );

        let bad_layers = ParameterOverrides {
            n_gpu_layers: Some(-2),
            ..Default::default()
        };
        assert_eq!(
            base.with_overrides(&bad_layers),
            Err(ParameterError::InvalidGpuLayers)
        );

        let bad_threads = ParameterOverrides {
            n_threads: Some(0),
            ..Default::default()
        };
        assert_eq!(
            base.with_overrides(&bad_threads),
            Err(ParameterError::InvalidThreadCount)
        );
    }
}
