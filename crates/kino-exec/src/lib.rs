//! Kernel catalog, batched column data, and the three-stage worker
//! pipeline.
//!
//! Responsibilities:
//! - [`kernel`]/[`registry`] define the capability-described kernel
//!   interface and the op catalog it is registered in;
//! - [`graph`] validates an op graph against the registry and fixes its
//!   execution order at decomposition time;
//! - [`batch`] holds pool-backed batched column data with explicit
//!   warmup/trailing row tagging;
//! - [`load`]/[`evaluate`]/[`save`] are the pipeline stages;
//! - [`pipeline`] chains them into a bounded producer/consumer assembly
//!   line on dedicated threads;
//! - [`kernels`] carries the representative histogram kernel.

pub mod batch;
pub mod codec;
pub mod decoder;
pub mod evaluate;
pub mod graph;
pub mod kernel;
pub mod kernels;
pub mod load;
pub mod pipeline;
pub mod registry;
pub mod save;

pub use batch::{ColumnBatch, ColumnBatchBuilder, ColumnView, KernelInput};
pub use decoder::{RawFrameDecoder, VideoDecoder};
pub use evaluate::EvaluateStage;
pub use graph::{validate_graph, GraphPlan, InputSource, PlannedOp};
pub use kernel::{Kernel, KernelCapabilities, KernelConfig, KernelContext, KernelFactory};
pub use load::LoadStage;
pub use pipeline::{ItemCompletion, ItemOutcome, PipelineConfig, WorkUnit, WorkerPipeline};
pub use registry::{OpInfo, OpRegistry, RegisteredKernel};
pub use save::SaveStage;
