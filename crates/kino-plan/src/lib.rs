//! Job model, row sampling, decode planning, and job decomposition.
//!
//! Responsibilities:
//! - [`job`] defines the submission schema (tasks, table samples, op graph);
//! - [`sampler`] resolves sampling arguments into concrete row sets;
//! - [`decode`] turns requested video rows into minimal keyframe-aligned
//!   decode plans;
//! - [`decompose`] partitions tasks into IO items and builds per-item work
//!   entries with stencil/warmup context folded in.
//!
//! Everything here is deterministic: replaying the same job against the
//! same table metadata yields identical items and samples, which is what
//! makes master-side retry idempotent.

pub mod decode;
pub mod decompose;
pub mod job;
pub mod sampler;

pub use decode::{DecodeArgs, DecodePlanner};
pub use decompose::{partition_items, GraphContext, IOItem, TaskPlan, WorkEntry};
pub use job::{Job, Op, OpInput, TableSample, Task};
pub use sampler::{resolve, GatherSample, LoadSample, RowSet, SamplerArgs};
