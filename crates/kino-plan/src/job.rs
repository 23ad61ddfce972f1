//! Job submission schema.
//!
//! A job is immutable once accepted by the master: the ordered task list,
//! the op graph shared by all tasks, and the global sizing parameters are
//! fixed at submission and referenced (never copied per item) for the rest
//! of the run.

use kino_common::{DeviceType, EngineConfig};
use serde::{Deserialize, Serialize};

use crate::sampler::SamplerArgs;
use kino_storage::CompressionSpec;

/// One named unit of work submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job name; duplicate submissions are rejected.
    pub name: String,
    /// Ordered tasks, one output table each.
    pub tasks: Vec<Task>,
    /// Op graph shared by all tasks, topologically ordered by construction
    /// (inputs may only reference earlier ops).
    pub ops: Vec<Op>,
    /// Rows per IO item (unit of assignment/retry).
    #[serde(default = "default_io_item_size")]
    pub io_item_size: u64,
    /// Rows per work item (unit of batching inside the pipeline).
    #[serde(default = "default_work_item_size")]
    pub work_item_size: u64,
}

fn default_io_item_size() -> u64 {
    EngineConfig::default().io_item_size
}

fn default_work_item_size() -> u64 {
    EngineConfig::default().work_item_size
}

/// One output table to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Name of the table this task creates.
    pub output_table_name: String,
    /// Source samples; all must resolve to the same output row count.
    pub samples: Vec<TableSample>,
    /// Per-output-column compression, matched to the final op's output
    /// columns by position; missing entries default to `none`.
    #[serde(default)]
    pub output_compression: Vec<CompressionSpec>,
}

/// Rows selected from one source table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSample {
    /// Source table name.
    pub table_name: String,
    /// Columns read from the source, in op-input order.
    pub column_names: Vec<String>,
    /// Sampling function and its arguments.
    ///
    /// On the wire this is a function name plus opaque args; here the pair
    /// is a tagged enum, which serde serializes the same way.
    pub sampler: SamplerArgs,
}

/// Reference to one op input: columns of an earlier op's output, or raw
/// table columns when `op_index` is `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpInput {
    /// Producing op index, or `None` for the task's table columns.
    #[serde(default)]
    pub op_index: Option<usize>,
    /// Column names selected from the producer.
    pub columns: Vec<String>,
}

/// One node of the operator graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Op {
    /// Op name, resolved through the catalog registry.
    pub name: String,
    /// Ordered typed inputs.
    pub inputs: Vec<OpInput>,
    /// Device class the kernel must run on.
    pub device: DeviceType,
    /// Opaque kernel arguments.
    #[serde(default)]
    pub kernel_args: Vec<u8>,
    /// Relative frame offsets this op needs around each row.
    #[serde(default)]
    pub stencil: Vec<i64>,
    /// Preferred batch size; clamped to the kernel's declared maximum.
    #[serde(default = "default_batch")]
    pub batch: usize,
    /// Rows consumed only to prime kernel state, never output.
    #[serde(default)]
    pub warmup: u64,
}

fn default_batch() -> usize {
    8
}
