//! Hardware tiers
//!
//! Classifies a host into a discrete capability bucket. The tier selects a
//! parameter profile; the thresholds are fixed and the classification is a
//! pure function of total RAM and VRAM.

use serde::{Deserialize, Serialize};

/// Hardware capability tier, ordered from least to most capable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareTier {
    /// <8 GB RAM, no dedicated GPU
    Low,
    /// 8-16 GB RAM or 4-8 GB VRAM
    Medium,
    /// 16-32 GB RAM or 8-16 GB VRAM
    High,
    /// 32+ GB RAM or 16+ GB VRAM
    Ultra,
}

impl HardwareTier {
    /// Classify a host from total RAM and VRAM in GB.
    ///
    /// Total and deterministic: identical inputs always yield the same tier.
    pub fn classify(ram_total_gb: f64, vram_total_gb: f64) -> Self {
        if vram_total_gb >= 16.0 || ram_total_gb >= 32.0 {
            HardwareTier::Ultra
        } else if vram_total_gb >= 8.0 || ram_total_gb >= 16.0 {
            HardwareTier::High
        } else if vram_total_gb >= 4.0 || ram_total_gb >= 8.0 {
            HardwareTier::Medium
        } else {
            HardwareTier::Low
        }
    }
}

impl std::fmt::Display for HardwareTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HardwareTier::Low => write!(f, "low"),
            HardwareTier::Medium => write!(f, "medium"),
            HardwareTier::High => write!(f, "high"),
            HardwareTier::Ultra => write!(f, "ultra"),
        }
    }
}
