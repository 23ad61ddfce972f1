use serde::{Deserialize, Serialize};

/// Pool behavior for one device class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolSectionConfig {
    /// Whether blocks are pooled and reused for this device class.
    ///
    /// When false, acquire/release degrade to direct allocate/free.
    pub use_pool: bool,
    /// Byte budget for the device class; acquisition blocks once exceeded.
    pub free_space: u64,
}

impl Default for PoolSectionConfig {
    fn default() -> Self {
        Self {
            use_pool: true,
            free_space: 2 * 1024 * 1024 * 1024,
        }
    }
}

/// Memory pool configuration supplied at worker startup.
///
/// Not changeable mid-job.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemoryPoolConfig {
    /// Allocate CPU blocks from pinned memory (for faster device transfer).
    pub pinned_cpu: bool,
    /// CPU pool section.
    pub cpu: PoolSectionConfig,
    /// GPU pool section, shared budget per GPU ordinal.
    pub gpu: PoolSectionConfig,
}

/// Engine-level sizing defaults shared by master and workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Rows per IO item: the unit of assignment and retry.
    pub io_item_size: u64,
    /// Rows per work item: the unit of batching inside the pipeline.
    pub work_item_size: u64,
    /// Depth of the bounded queues between pipeline stages.
    pub pipeline_queue_depth: usize,
    /// Pipeline instances per worker process (one per usable device).
    pub pipeline_instances: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            io_item_size: 1000,
            work_item_size: 250,
            pipeline_queue_depth: 2,
            pipeline_instances: 1,
        }
    }
}
