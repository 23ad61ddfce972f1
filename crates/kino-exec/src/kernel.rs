//! The capability-described kernel interface.
//!
//! An op names a computation; a kernel is one device-specific,
//! batch-capable implementation of it. Kernels are registered against the
//! op catalog with an explicit capability record, resolved once per job at
//! decomposition time, and instantiated once per work entry so device
//! binding and internal state live exactly as long as one item.

use std::sync::Arc;

use kino_common::{DeviceHandle, Result};
use kino_mem::BufferPool;

use crate::batch::{ColumnBatch, KernelInput};

/// Capabilities a kernel declares at registration.
#[derive(Debug, Clone, Copy)]
pub struct KernelCapabilities {
    /// Whether the kernel accepts more than one row per invocation.
    pub batched: bool,
    /// Largest batch the kernel accepts.
    pub max_batch: usize,
    /// Supported stencil offset range `(min, max)`, or `None` when the
    /// kernel consumes no neighbor context.
    pub stencil: Option<(i64, i64)>,
    /// Whether the kernel wants warmup rows to prime internal state.
    pub warmup: bool,
    /// Device handles the kernel requires (1 for every current kernel).
    pub num_devices: u32,
}

impl Default for KernelCapabilities {
    fn default() -> Self {
        Self {
            batched: false,
            max_batch: 1,
            stencil: None,
            warmup: false,
            num_devices: 1,
        }
    }
}

/// Construction-time kernel configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Device handle the instance is bound to for its whole lifetime.
    pub device: DeviceHandle,
    /// Opaque kernel arguments from the op declaration.
    pub args: Vec<u8>,
}

/// Per-invocation execution context.
pub struct KernelContext<'a> {
    /// Pool to allocate output blocks from.
    pub pool: &'a BufferPool,
    /// Device the invocation runs on; same as the config device.
    pub device: DeviceHandle,
}

/// One device-specific computation unit.
///
/// `execute` consumes a window of input rows (center rows plus declared
/// stencil/warmup context) and must return one output batch per declared
/// output column, each holding exactly the center row count. Context rows
/// exist to seed state or satisfy stencils; they never appear in output.
pub trait Kernel: Send {
    /// Process one batch.
    fn execute(&mut self, ctx: &KernelContext<'_>, input: &KernelInput<'_>)
        -> Result<Vec<ColumnBatch>>;

    /// Clear internal state between work entries.
    fn reset(&mut self) {}
}

/// Factory producing kernel instances bound to a device.
pub type KernelFactory = Arc<dyn Fn(&KernelConfig) -> Result<Box<dyn Kernel>> + Send + Sync>;
