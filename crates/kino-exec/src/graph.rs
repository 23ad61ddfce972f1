//! Op-graph validation.
//!
//! Runs once per task at job decomposition: resolves every op against the
//! registry, checks arity/ordering/column references, and fixes the
//! execution order and batch sizes the evaluate stage will use. Nothing
//! here is recomputed per item.

use kino_common::{DeviceType, KinoError, Result};
use kino_plan::{GraphContext, Op};

use crate::registry::{OpRegistry, RegisteredKernel};

/// Where one op input reads from.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// Raw table columns, by index into the task's fetched columns.
    Table {
        /// Column indices in fetch order.
        columns: Vec<usize>,
    },
    /// An earlier op's output columns.
    Op {
        /// Producing op index.
        op: usize,
        /// Column indices into the producer's output schema.
        columns: Vec<usize>,
    },
}

/// One validated op with its resolved kernel.
#[derive(Debug)]
pub struct PlannedOp {
    /// Op name.
    pub name: String,
    /// Declared device class.
    pub device: DeviceType,
    /// Resolved kernel registration.
    pub kernel: RegisteredKernel,
    /// Resolved inputs.
    pub inputs: Vec<InputSource>,
    /// Output column names.
    pub output_columns: Vec<String>,
    /// Effective batch size, clamped to kernel capabilities.
    pub batch: usize,
    /// Leading context rows this op's stencil needs.
    pub stencil_before: u64,
    /// Trailing context rows this op's stencil needs.
    pub stencil_after: u64,
    /// Warmup rows this op wants at item start.
    pub warmup: u64,
    /// Opaque kernel arguments.
    pub kernel_args: Vec<u8>,
}

/// A task's validated op graph, fixed at decomposition time.
#[derive(Debug)]
pub struct GraphPlan {
    /// Ops in execution (topological) order.
    pub ops: Vec<PlannedOp>,
    /// The task's fetched table column names, in fetch order.
    pub table_columns: Vec<String>,
    /// Folded stencil/warmup requirements for the sampler.
    pub context: GraphContext,
}

impl GraphPlan {
    /// Output column names of the final op.
    #[must_use]
    pub fn output_columns(&self) -> &[String] {
        &self.ops.last().expect("validated graph is non-empty").output_columns
    }
}

fn resolve_columns(requested: &[String], available: &[String], what: &str) -> Result<Vec<usize>> {
    requested
        .iter()
        .map(|name| {
            available.iter().position(|c| c == name).ok_or_else(|| {
                KinoError::Graph(format!("unknown column '{name}' in {what}"))
            })
        })
        .collect()
}

/// Validate `ops` against the registry and the task's table columns.
///
/// Ops must be topologically ordered already (inputs may only reference
/// earlier ops); device/kernel availability failures surface here, before
/// any work is dispatched.
pub fn validate_graph(
    registry: &OpRegistry,
    ops: &[Op],
    table_columns: &[String],
) -> Result<GraphPlan> {
    if ops.is_empty() {
        return Err(KinoError::Graph("op graph is empty".to_string()));
    }
    let mut planned: Vec<PlannedOp> = Vec::with_capacity(ops.len());
    for (index, op) in ops.iter().enumerate() {
        let info = registry.op_info(&op.name)?;
        let kernel = registry.resolve(&op.name, op.device)?;
        if op.inputs.len() != info.input_arity {
            return Err(KinoError::Graph(format!(
                "op '{}' declares {} inputs, expected {}",
                op.name,
                op.inputs.len(),
                info.input_arity
            )));
        }

        let mut inputs = Vec::with_capacity(op.inputs.len());
        for input in &op.inputs {
            let source = match input.op_index {
                None => InputSource::Table {
                    columns: resolve_columns(&input.columns, table_columns, "table input")?,
                },
                Some(producer) => {
                    if producer >= index {
                        return Err(KinoError::Graph(format!(
                            "op '{}' at index {index} references op {producer}; \
                             inputs must reference earlier ops",
                            op.name
                        )));
                    }
                    InputSource::Op {
                        op: producer,
                        columns: resolve_columns(
                            &input.columns,
                            &planned[producer].output_columns,
                            &format!("output of op '{}'", planned[producer].name),
                        )?,
                    }
                }
            };
            inputs.push(source);
        }

        let caps = kernel.capabilities;
        let mut stencil_before = 0u64;
        let mut stencil_after = 0u64;
        for &offset in &op.stencil {
            if offset != 0 {
                let (min, max) = caps.stencil.ok_or_else(|| {
                    KinoError::Graph(format!(
                        "op '{}' declares a stencil but its kernel supports none",
                        op.name
                    ))
                })?;
                if offset < min || offset > max {
                    return Err(KinoError::Graph(format!(
                        "op '{}' stencil offset {offset} outside supported range [{min}, {max}]",
                        op.name
                    )));
                }
            }
            if offset < 0 {
                stencil_before = stencil_before.max(offset.unsigned_abs());
            } else {
                stencil_after = stencil_after.max(offset as u64);
            }
        }

        let batch = if caps.batched {
            op.batch.clamp(1, caps.max_batch.max(1))
        } else {
            1
        };

        planned.push(PlannedOp {
            name: op.name.clone(),
            device: op.device,
            kernel,
            inputs,
            output_columns: info.output_columns,
            batch,
            stencil_before,
            stencil_after,
            warmup: op.warmup,
            kernel_args: op.kernel_args.clone(),
        });
    }

    Ok(GraphPlan {
        ops: planned,
        table_columns: table_columns.to_vec(),
        context: GraphContext::from_ops(ops),
    })
}
