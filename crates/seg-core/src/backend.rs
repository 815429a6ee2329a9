//! Compute device selection.
//!
//! The device is an explicit configuration value. `Auto` is resolved once at
//! startup by probing for a discrete GPU; the binary then picks the matching
//! Burn backend.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::Error;

/// Requested compute device
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    /// CPU backend
    Cpu,
    /// GPU backend with adapter index
    Gpu(usize),
    /// GPU when one is detected, CPU otherwise
    #[default]
    Auto,
}

impl Device {
    /// Resolves `Auto` against the host and downgrades unavailable GPUs.
    ///
    /// `gpu_supported` is whether the binary was built with a GPU backend.
    pub fn resolve(self, gpu_supported: bool) -> Device {
        let gpu_usable = gpu_supported && is_gpu_available();

        match self {
            Device::Cpu => Device::Cpu,
            Device::Gpu(id) if gpu_usable => Device::Gpu(id),
            Device::Gpu(id) => {
                warn!("GPU:{} requested but not available, falling back to CPU", id);
                Device::Cpu
            }
            Device::Auto if gpu_usable => {
                info!("Discrete GPU detected, using GPU:0");
                Device::Gpu(0)
            }
            Device::Auto => Device::Cpu,
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Gpu(_))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(0) => write!(f, "gpu"),
            Device::Gpu(id) => write!(f, "gpu:{}", id),
            Device::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "cpu" => Ok(Device::Cpu),
            "gpu" | "cuda" => Ok(Device::Gpu(0)),
            "auto" => Ok(Device::Auto),
            other => other
                .strip_prefix("gpu:")
                .and_then(|id| id.parse().ok())
                .map(Device::Gpu)
                .ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "unknown device '{s}' (expected cpu, gpu, gpu:<id> or auto)"
                    ))
                }),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

/// Check if any discrete GPU is present
pub fn is_gpu_available() -> bool {
    has_nvidia_gpu() || has_amd_gpu()
}

fn has_nvidia_gpu() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/proc/driver/nvidia/version").exists()
            || std::path::Path::new("/dev/nvidia0").exists()
    }

    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("nvidia-smi.exe")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        false
    }
}

fn has_amd_gpu() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new("/sys/module/amdgpu").exists()
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}
