//! Model size estimation
//!
//! Infers a model's approximate size on disk and layer count from its
//! identifier when the file is absent, or reads the size directly when it
//! exists. The filename heuristic is a best-effort hint: downstream
//! arithmetic (context ladder, offload floors) must tolerate it being wrong.

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

/// Parameter-count tokens with their base size in GB, largest first so that
/// "13b" is not shadowed by "3b".
const SIZE_PATTERNS: &[(&str, f64)] = &[
    ("70b", 40.0),
    ("65b", 37.0),
    ("34b", 20.0),
    ("33b", 19.0),
    ("30b", 18.0),
    ("13b", 7.5),
    ("7b", 4.0),
    ("3b", 2.0),
    ("1b", 1.0),
];

/// Layer-count estimates by parameter-count token, largest first.
const LAYER_PATTERNS: &[(&str, u32)] = &[
    ("70b", 80),
    ("65b", 80),
    ("34b", 60),
    ("33b", 60),
    ("30b", 60),
    ("13b", 40),
    ("7b", 32),
    ("3b", 28),
    ("1b", 22),
];

/// Quantization token in a model filename: "q4", "q4_k_m", "q5_0", "q8"...
static QUANT_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"q([458])(?:_[0-9a-z]+)*").expect("valid regex"));

/// Estimated size and depth of a model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelSizeEstimate {
    /// Approximate size on disk in GB
    pub size_gb: f64,
    /// Approximate transformer layer count
    pub layer_count: u32,
}

impl ModelSizeEstimate {
    /// Estimate a model from its path.
    ///
    /// When the file exists the size is exact (layer count stays a name-based
    /// guess); otherwise both come from filename tokens, defaulting to a
    /// 7B Q4 shape (4.0 GB, 32 layers) when nothing matches.
    pub fn for_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let layer_count = estimate_layers(&name);

        if let Ok(metadata) = path.metadata() {
            let size_gb = metadata.len() as f64 / (1024.0 * 1024.0 * 1024.0);
            return Self {
                size_gb,
                layer_count,
            };
        }

        Self {
            size_gb: estimate_size_gb(&name),
            layer_count,
        }
    }
}

/// Size in GB from filename tokens, adjusted for quantization
fn estimate_size_gb(name: &str) -> f64 {
    for (pattern, base_gb) in SIZE_PATTERNS {
        if name.contains(pattern) {
            return base_gb * quantization_factor(name);
        }
    }

    4.0 // default: 7B Q4
}

/// Layer count from filename tokens
fn estimate_layers(name: &str) -> u32 {
    for (pattern, layers) in LAYER_PATTERNS {
        if name.contains(pattern) {
            return *layers;
        }
    }

    32 // default
}

/// Size multiplier for a recognized quantization token (1.0 when none)
fn quantization_factor(name: &str) -> f64 {
    match QUANT_TOKEN
        .captures(name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
    {
        Some("4") => 0.5,
        Some("5") => 0.6,
        Some("8") => 0.8,
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_estimate_from_filename_tokens() {
        let est = ModelSizeEstimate::for_path(Path::new("/missing/mistral-7b-instruct-q4_k_m.gguf"));
        assert!((est.size_gb - 2.0).abs() < f64::EPSILON);
        assert_eq!(est.layer_count, 32);
    }

    #[test]
    fn test_estimate_large_model() {
        let est = ModelSizeEstimate::for_path(Path::new("/missing/llama-2-70b.Q8_0.gguf"));
        assert!((est.size_gb - 32.0).abs() < f64::EPSILON);
        assert_eq!(est.layer_count, 80);
    }

    #[test]
    fn test_13b_not_shadowed_by_3b() {
        let est = ModelSizeEstimate::for_path(Path::new("/missing/vicuna-13b-f16.gguf"));
        assert!((est.size_gb - 7.5).abs() < f64::EPSILON);
        assert_eq!(est.layer_count, 40);
    }

    #[test]
    fn test_unknown_name_falls_back_to_default() {
        let est = ModelSizeEstimate::for_path(Path::new("/missing/mystery-model.gguf"));
        assert!((est.size_gb - 4.0).abs() < f64::EPSILON);
        assert_eq!(est.layer_count, 32);
    }

    #[test]
    fn test_existing_file_uses_actual_size() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&[0u8; 4096]).expect("write");

        let est = ModelSizeEstimate::for_path(file.path());
        let expected = 4096.0 / (1024.0 * 1024.0 * 1024.0);
        assert!((est.size_gb - expected).abs() < 1e-12);
    }

    #[test]
    fn test_quantization_factors() {
        assert_eq!(quantization_factor("model-7b-q4_k_m.gguf"), 0.5);
        assert_eq!(quantization_factor("model-7b-q5_0.gguf"), 0.6);
        assert_eq!(quantization_factor("model-7b-q8.gguf"), 0.8);
        assert_eq!(quantization_factor("model-7b-f16.gguf"), 1.0);
    }
}
