//! Device model shared by the buffer pool, kernel registry, and pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Device class a kernel executes on and a buffer block resides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// Host CPU.
    Cpu,
    /// A CUDA-class accelerator.
    Gpu,
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::Cpu => write!(f, "cpu"),
            DeviceType::Gpu => write!(f, "gpu"),
        }
    }
}

/// One concrete device: a device class plus an ordinal within that class.
///
/// A worker pipeline is bound to exactly one handle for the lifetime of a
/// work entry; kernels never migrate devices mid-item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Device class.
    pub device_type: DeviceType,
    /// Ordinal within the class (always 0 for CPU).
    pub device_id: u32,
}

impl DeviceHandle {
    /// The host CPU handle.
    #[must_use]
    pub fn cpu() -> Self {
        Self {
            device_type: DeviceType::Cpu,
            device_id: 0,
        }
    }

    /// A GPU handle by ordinal.
    #[must_use]
    pub fn gpu(device_id: u32) -> Self {
        Self {
            device_type: DeviceType::Gpu,
            device_id,
        }
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device_type {
            DeviceType::Cpu => write!(f, "cpu"),
            DeviceType::Gpu => write!(f, "gpu:{}", self.device_id),
        }
    }
}
