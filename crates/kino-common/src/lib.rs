//! Shared configuration, error types, IDs, and observability primitives for
//! Kino crates.
//!
//! Architecture role:
//! - defines the device model and memory-pool/engine configuration passed
//!   across layers
//! - provides the common [`KinoError`] / [`Result`] contracts
//! - hosts the process-wide metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`device`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod config;
pub mod device;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::{EngineConfig, MemoryPoolConfig, PoolSectionConfig};
pub use device::{DeviceHandle, DeviceType};
pub use error::{KinoError, Result};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};
