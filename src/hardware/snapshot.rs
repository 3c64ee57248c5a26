//! Hardware snapshot
//!
//! Captures immutable facts about the current host: system memory,
//! accelerator memory, and CPU core counts. A snapshot is a plain value,
//! created fresh on each profiling call and never mutated.

use serde::{Deserialize, Serialize};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::hardware::gpu;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Accelerator backend available on this host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuBackend {
    /// No accelerator, CPU-only inference
    Cpu,
    /// Apple Metal (unified memory)
    Metal,
    /// NVIDIA CUDA
    Cuda,
}

impl std::fmt::Display for GpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuBackend::Cpu => write!(f, "cpu"),
            GpuBackend::Metal => write!(f, "metal"),
            GpuBackend::Cuda => write!(f, "cuda"),
        }
    }
}

/// Immutable facts about the host at profiling time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    /// Total system RAM in GB
    pub ram_total_gb: f64,
    /// RAM available at capture time in GB
    pub ram_available_gb: f64,
    /// Total accelerator memory in GB (0 when backend is CPU)
    pub vram_total_gb: f64,
    /// Accelerator memory available at capture time in GB
    pub vram_available_gb: f64,
    /// Physical CPU core count
    pub cpu_cores_physical: usize,
    /// Logical CPU core count
    pub cpu_cores_logical: usize,
    /// Detected accelerator backend
    pub backend: GpuBackend,
    /// Accelerator name, when the probe reports one
    pub gpu_name: Option<String>,
}

impl HardwareSnapshot {
    /// Capture a fresh snapshot of the host.
    ///
    /// Never fails: any probe that cannot answer degrades to a conservative
    /// fixed fallback (8 GB RAM total / 4 GB available, CPU backend).
    pub fn capture() -> Self {
        let (ram_total_gb, ram_available_gb, cpu_cores_physical) = probe_system();
        let cpu_cores_logical = logical_cores();
        let vram = gpu::probe_vram();

        let snapshot = Self {
            ram_total_gb,
            ram_available_gb,
            vram_total_gb: vram.total_gb,
            vram_available_gb: vram.available_gb,
            cpu_cores_physical,
            cpu_cores_logical,
            backend: vram.backend,
            gpu_name: vram.gpu_name,
        };

        tracing::debug!(
            ram_total_gb = snapshot.ram_total_gb,
            vram_total_gb = snapshot.vram_total_gb,
            backend = %snapshot.backend,
            cpu_physical = snapshot.cpu_cores_physical,
            cpu_logical = snapshot.cpu_cores_logical,
            "Captured hardware snapshot"
        );

        snapshot
    }
}

/// Probe RAM and physical core count via sysinfo.
///
/// Returns (ram_total_gb, ram_available_gb, physical_cores).
fn probe_system() -> (f64, f64, usize) {
    let sys = System::new_with_specifics(
        RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
    );

    let total = sys.total_memory() as f64 / BYTES_PER_GB;
    let available = sys.available_memory() as f64 / BYTES_PER_GB;

    // Conservative fallback when the platform reports nothing
    let (total, available) = if total <= 0.0 {
        (8.0, 4.0)
    } else if available <= 0.0 {
        (total, total * 0.5)
    } else {
        (total, available)
    };

    let physical = sys
        .physical_core_count()
        .unwrap_or_else(|| logical_cores().div_ceil(2))
        .max(1);

    (total, available, physical)
}

fn logical_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_reports_sane_values() {
        let snapshot = HardwareSnapshot::capture();
        assert!(snapshot.ram_total_gb > 0.0);
        assert!(snapshot.ram_available_gb > 0.0);
        assert!(snapshot.ram_available_gb <= snapshot.ram_total_gb + f64::EPSILON);
        assert!(snapshot.cpu_cores_physical >= 1);
        assert!(snapshot.cpu_cores_logical >= 1);
    }

    #[test]
    fn test_cpu_backend_has_no_vram() {
        let snapshot = HardwareSnapshot::capture();
        if snapshot.backend == GpuBackend::Cpu {
            assert_eq!(snapshot.vram_total_gb, 0.0);
            assert_eq!(snapshot.vram_available_gb, 0.0);
        }
    }

    #[test]
    fn test_snapshot_serde_roundtrip() {
        let snapshot = HardwareSnapshot::capture();
        let json = serde_json::to_string(&snapshot).expect("serialize");
        let back: HardwareSnapshot = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(snapshot.backend, back.backend);
        assert_eq!(snapshot.cpu_cores_physical, back.cpu_cores_physical);
    }
}
