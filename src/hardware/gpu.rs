//! GPU detection
//!
//! Best-effort probe for accelerator memory and backend. Platform-dependent:
//! Apple Silicon reports unified memory through a sysctl heuristic, NVIDIA
//! GPUs are queried through nvidia-smi. Any failure degrades to a CPU-only
//! result rather than propagating an error.

#[cfg(any(target_os = "windows", target_os = "linux", target_os = "macos"))]
use std::process::Command;

use crate::hardware::snapshot::GpuBackend;

/// Result of the accelerator probe
#[derive(Debug, Clone)]
pub struct VramProbe {
    pub total_gb: f64,
    pub available_gb: f64,
    pub backend: GpuBackend,
    pub gpu_name: Option<String>,
}

impl VramProbe {
    fn cpu_only() -> Self {
        Self {
            total_gb: 0.0,
            available_gb: 0.0,
            backend: GpuBackend::Cpu,
            gpu_name: None,
        }
    }
}

/// Probe accelerator memory (best effort)
pub fn probe_vram() -> VramProbe {
    #[cfg(target_os = "macos")]
    {
        return probe_metal();
    }

    #[cfg(any(target_os = "windows", target_os = "linux"))]
    {
        return probe_cuda();
    }

    #[allow(unreachable_code)]
    VramProbe::cpu_only()
}

// =============================================================================
// macOS Metal detection
// =============================================================================

/// Unified-memory heuristic for Apple Silicon: the GPU can address ~75% of
/// system RAM, and we assume half of RAM is actually free for it.
#[cfg(target_os = "macos")]
fn probe_metal() -> VramProbe {
    let Some(total_ram_gb) = macos_total_ram_gb() else {
        return VramProbe::cpu_only();
    };

    let gpu_name = macos_chip_name().unwrap_or_else(|| "Apple Silicon".to_string());

    VramProbe {
        total_gb: total_ram_gb * 0.75,
        available_gb: total_ram_gb * 0.5,
        backend: GpuBackend::Metal,
        gpu_name: Some(gpu_name),
    }
}

/// Get total system RAM on macOS via sysctl hw.memsize
#[cfg(target_os = "macos")]
fn macos_total_ram_gb() -> Option<f64> {
    let output = Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let bytes_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let bytes = bytes_str.parse::<u64>().ok()?;
    Some(bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

/// Chip name via sysctl machdep.cpu.brand_string ("Apple M2 Pro")
#[cfg(target_os = "macos")]
fn macos_chip_name() -> Option<String> {
    let output = Command::new("sysctl")
        .args(["-n", "machdep.cpu.brand_string"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

// =============================================================================
// NVIDIA CUDA detection (Windows / Linux)
// =============================================================================

#[cfg(any(target_os = "windows", target_os = "linux"))]
fn probe_cuda() -> VramProbe {
    let Ok(output) = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.total,memory.free,name",
            "--format=csv,noheader,nounits",
        ])
        .output()
    else {
        return VramProbe::cpu_only();
    };

    if !output.status.success() {
        return VramProbe::cpu_only();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_nvidia_smi(&stdout).unwrap_or_else(VramProbe::cpu_only)
}

/// Parse the first line of nvidia-smi CSV output (first GPU only)
#[cfg(any(target_os = "windows", target_os = "linux", test))]
fn parse_nvidia_smi(stdout: &str) -> Option<VramProbe> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
    if parts.len() < 2 {
        return None;
    }

    let total_mb = parts[0].parse::<u64>().ok()?;
    let free_mb = parts[1].parse::<u64>().ok()?;
    let gpu_name = parts.get(2).map(|s| s.to_string());

    Some(VramProbe {
        total_gb: total_mb as f64 / 1024.0,
        available_gb: free_mb as f64 / 1024.0,
        backend: GpuBackend::Cuda,
        gpu_name,
    })
}
