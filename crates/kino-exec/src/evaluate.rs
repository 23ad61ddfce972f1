//! Evaluate stage: run the op graph over a work entry's batches.
//!
//! Ops execute in the topological order fixed at decomposition. For each
//! op the stage instantiates its kernel once (device-bound for the whole
//! work entry), groups center rows into batches no larger than the
//! kernel's declared maximum, and supplies stencil/warmup windows by
//! reading extra rows from the still-buffered context. Warmup and trailing
//! rows never appear in an op's output: kernels receive them as window
//! context and emit center rows only.

use std::sync::Arc;
use std::time::Instant;

use kino_common::{global_metrics, DeviceHandle, DeviceType, KinoError, Result};
use kino_mem::BufferPool;
use kino_plan::WorkEntry;
use tracing::trace;

use crate::batch::{ColumnBatch, ColumnView, KernelInput};
use crate::graph::{GraphPlan, InputSource, PlannedOp};
use crate::kernel::{KernelConfig, KernelContext};

/// Second stage of the worker pipeline.
pub struct EvaluateStage {
    pool: BufferPool,
    /// Device handle bound to this pipeline instance; GPU ops run here.
    device: DeviceHandle,
}

impl EvaluateStage {
    /// Build an evaluate stage bound to one device handle.
    pub fn new(pool: BufferPool, device: DeviceHandle) -> Self {
        Self { pool, device }
    }

    /// Execute the graph; returns the final op's output columns, holding
    /// exactly the entry's item rows.
    pub fn evaluate(
        &self,
        plan: &Arc<GraphPlan>,
        entry: &WorkEntry,
        table_columns: Vec<ColumnBatch>,
    ) -> Result<Vec<ColumnBatch>> {
        let started = Instant::now();
        let item_rows = (entry.item.end_row - entry.item.start_row) as usize;
        let mut op_outputs: Vec<Vec<ColumnBatch>> = Vec::with_capacity(plan.ops.len());
        for planned in &plan.ops {
            let outputs =
                self.run_op(planned, item_rows, &table_columns, &op_outputs)?;
            op_outputs.push(outputs);
        }
        global_metrics().observe_stage("evaluate", started.elapsed().as_secs_f64());
        Ok(op_outputs.pop().expect("validated graph is non-empty"))
    }

    fn op_device(&self, planned: &PlannedOp) -> Result<DeviceHandle> {
        match planned.device {
            DeviceType::Cpu => Ok(DeviceHandle::cpu()),
            DeviceType::Gpu => {
                if self.device.device_type == DeviceType::Gpu {
                    Ok(self.device)
                } else {
                    Err(KinoError::InvalidConfig(format!(
                        "op '{}' needs a GPU but this pipeline is bound to {}",
                        planned.name, self.device
                    )))
                }
            }
        }
    }

    fn run_op(
        &self,
        planned: &PlannedOp,
        item_rows: usize,
        table_columns: &[ColumnBatch],
        op_outputs: &[Vec<ColumnBatch>],
    ) -> Result<Vec<ColumnBatch>> {
        let device = self.op_device(planned)?;
        let mut kernel = (planned.kernel.factory)(&KernelConfig {
            device,
            args: planned.kernel_args.clone(),
        })?;
        kernel.reset();
        let ctx = KernelContext {
            pool: &self.pool,
            device,
        };

        // Resolve this op's input columns once; views are cut per batch.
        let mut inputs: Vec<&ColumnBatch> = Vec::new();
        for source in &planned.inputs {
            match source {
                InputSource::Table { columns } => {
                    for &index in columns {
                        inputs.push(&table_columns[index]);
                    }
                }
                InputSource::Op { op, columns } => {
                    for &index in columns {
                        inputs.push(&op_outputs[*op][index]);
                    }
                }
            }
        }
        for column in &inputs {
            if column.output_rows() != item_rows {
                return Err(KinoError::Kernel(format!(
                    "op '{}' input holds {} output rows, expected {item_rows}",
                    planned.name,
                    column.output_rows()
                )));
            }
        }

        let mut per_batch: Vec<Vec<ColumnBatch>> = Vec::new();
        let mut start = 0usize;
        while start < item_rows {
            let len = planned.batch.min(item_rows - start);
            let end = start + len;

            // Window context is limited by what every input column still
            // buffers; op-fed inputs carry no extra context, so their
            // windows clamp at the item edges.
            let before_needed =
                planned.stencil_before + if start == 0 { planned.warmup } else { 0 };
            let after_needed = planned.stencil_after;
            let before = inputs
                .iter()
                .map(|c| c.warmup_rows() + start)
                .min()
                .unwrap_or(0)
                .min(before_needed as usize);
            let after = inputs
                .iter()
                .map(|c| c.trailing_rows() + (item_rows - end))
                .min()
                .unwrap_or(0)
                .min(after_needed as usize);

            let columns: Vec<ColumnView<'_>> = inputs
                .iter()
                .map(|c| c.view(c.warmup_rows() + start - before, len + before + after))
                .collect();
            let input = KernelInput {
                columns,
                before,
                after,
            };
            let outputs = kernel.execute(&ctx, &input)?;
            if outputs.len() != planned.output_columns.len() {
                return Err(KinoError::Kernel(format!(
                    "op '{}' produced {} columns, declared {}",
                    planned.name,
                    outputs.len(),
                    planned.output_columns.len()
                )));
            }
            for output in &outputs {
                if output.rows() != len {
                    return Err(KinoError::Kernel(format!(
                        "op '{}' produced {} rows for a {len}-row batch",
                        planned.name,
                        output.rows()
                    )));
                }
            }
            trace!(op = %planned.name, start, len, before, after, "batch evaluated");
            per_batch.push(outputs);
            start = end;
        }

        self.coalesce(planned, per_batch)
    }

    // One batch per output column spanning the whole item, so downstream
    // ops can cut stencil windows across batch boundaries.
    fn coalesce(
        &self,
        planned: &PlannedOp,
        per_batch: Vec<Vec<ColumnBatch>>,
    ) -> Result<Vec<ColumnBatch>> {
        if per_batch.len() == 1 {
            return Ok(per_batch.into_iter().next().expect("single batch"));
        }
        let columns = planned.output_columns.len();
        let mut coalesced = Vec::with_capacity(columns);
        for column in 0..columns {
            let refs: Vec<&[u8]> = per_batch
                .iter()
                .flat_map(|batch| batch[column].view(0, batch[column].rows()).iter())
                .collect();
            coalesced.push(ColumnBatch::from_elements(
                &self.pool,
                per_batch[0][column].device(),
                &refs,
                0,
                0,
            )?);
        }
        Ok(coalesced)
    }
}
