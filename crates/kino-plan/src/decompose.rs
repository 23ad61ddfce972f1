//! Job decomposition: task row counts, IO item partitioning, and per-item
//! work entry construction.
//!
//! Decomposition runs once, at submission. Everything derived here is a
//! pure function of the job spec and table metadata, so a re-dispatched
//! item reproduces byte-identical samples; the master relies on this for
//! idempotent retry.

use kino_common::{ItemId, JobId, KinoError, Result, TableId};
use kino_storage::MetadataCache;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::job::{Op, Task};
use crate::sampler::{resolve, LoadSample, RowSet};

/// A half-open row range of one output table: the unit of work assignment
/// and of at-most-once completion accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IOItem {
    /// Output table the range belongs to.
    pub table_id: TableId,
    /// Item ordinal within the table.
    pub item_id: ItemId,
    /// First output row (inclusive).
    pub start_row: u64,
    /// End of the range (exclusive).
    pub end_row: u64,
}

/// One unit of work dispatched to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkEntry {
    /// Owning job.
    pub job_id: JobId,
    /// Task ordinal within the job.
    pub task_index: usize,
    /// Output table row range this entry produces.
    pub item: IOItem,
    /// Concrete rows to fetch, one sample per source table.
    pub samples: Vec<LoadSample>,
    /// Batching boundaries within the item, in rows.
    pub work_item_sizes: Vec<u64>,
}

/// Row-context requirements folded from the whole op graph.
///
/// The sampler is invoked with the union of all downstream stencil offsets
/// and warmup widths, so a kernel requesting frames `[-2, +1]` around row
/// `r` causes rows `r-2..r` to be fetched as leading context even when not
/// directly requested, plus one trailing row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphContext {
    /// Largest declared kernel warmup across ops.
    pub warmup: u64,
    /// Rows of leading context required by the widest negative stencil.
    pub stencil_before: u64,
    /// Rows of trailing context required by the widest positive stencil.
    pub stencil_after: u64,
}

impl GraphContext {
    /// Fold stencil and warmup requirements across all ops.
    #[must_use]
    pub fn from_ops(ops: &[Op]) -> Self {
        let mut ctx = GraphContext::default();
        for op in ops {
            ctx.warmup = ctx.warmup.max(op.warmup);
            for &offset in &op.stencil {
                if offset < 0 {
                    ctx.stencil_before = ctx.stencil_before.max(offset.unsigned_abs());
                } else {
                    ctx.stencil_after = ctx.stencil_after.max(offset as u64);
                }
            }
        }
        ctx
    }

    fn leading(&self) -> u64 {
        self.warmup.max(self.stencil_before)
    }
}

/// One resolved table sample of a task, with per-chunk output offsets.
#[derive(Debug, Clone)]
pub struct ResolvedSample {
    /// Source table.
    pub table_id: TableId,
    /// Source row count, for clamping context windows.
    pub table_row_count: u64,
    /// Columns to fetch.
    pub column_ids: Vec<kino_common::ColumnId>,
    /// Resolved chunks in sampling order.
    pub chunks: Vec<RowSet>,
    /// Output-row index at which each chunk begins.
    pub chunk_starts: Vec<u64>,
    /// All requested rows, chunks concatenated.
    pub requested: Vec<u64>,
}

/// Decomposed task: fixed row count, IO items, and resolved samples.
#[derive(Debug, Clone)]
pub struct TaskPlan {
    /// Task ordinal within the job.
    pub task_index: usize,
    /// Output table produced by the task.
    pub output_table: TableId,
    /// Total output rows, fixed at decomposition time.
    pub row_count: u64,
    /// Disjoint covering item ranges.
    pub items: Vec<IOItem>,
    /// One resolved sample per task table sample.
    pub samples: Vec<ResolvedSample>,
}

/// Partition `[0, row_count)` into `ceil(row_count / io_item_size)`
/// disjoint covering items.
pub fn partition_items(
    output_table: TableId,
    row_count: u64,
    io_item_size: u64,
) -> Result<Vec<IOItem>> {
    if io_item_size == 0 {
        return Err(KinoError::InvalidConfig(
            "io_item_size must be >= 1".to_string(),
        ));
    }
    let mut items = Vec::with_capacity(row_count.div_ceil(io_item_size) as usize);
    let mut start = 0u64;
    let mut item_id = 0u64;
    while start < row_count {
        let end = (start + io_item_size).min(row_count);
        items.push(IOItem {
            table_id: output_table,
            item_id: ItemId(item_id),
            start_row: start,
            end_row: end,
        });
        start = end;
        item_id += 1;
    }
    Ok(items)
}

/// Resolve a task's samples and partition its output rows into IO items.
pub fn decompose_task(
    cache: &MetadataCache,
    task_index: usize,
    task: &Task,
    output_table: TableId,
    io_item_size: u64,
) -> Result<TaskPlan> {
    if task.samples.is_empty() {
        return Err(KinoError::EmptySample(format!(
            "task '{}' has no table samples",
            task.output_table_name
        )));
    }
    let mut samples = Vec::with_capacity(task.samples.len());
    let mut row_count: Option<u64> = None;
    for table_sample in &task.samples {
        let descriptor = cache.table_by_name(&table_sample.table_name)?.ok_or_else(|| {
            KinoError::InvalidConfig(format!("unknown table '{}'", table_sample.table_name))
        })?;
        let column_ids = table_sample
            .column_names
            .iter()
            .map(|name| descriptor.column(name).map(|c| c.id))
            .collect::<Result<Vec<_>>>()?;
        let chunks = resolve(&table_sample.sampler, descriptor.row_count)?;
        let mut chunk_starts = Vec::with_capacity(chunks.len());
        let mut requested = Vec::new();
        for chunk in &chunks {
            chunk_starts.push(requested.len() as u64);
            requested.extend_from_slice(&chunk.rows);
        }
        let sample_rows = requested.len() as u64;
        match row_count {
            None => row_count = Some(sample_rows),
            Some(expected) if expected != sample_rows => {
                return Err(KinoError::SampleCountMismatch(format!(
                    "table '{}' resolved to {sample_rows} rows, expected {expected}",
                    table_sample.table_name
                )));
            }
            Some(_) => {}
        }
        samples.push(ResolvedSample {
            table_id: descriptor.id,
            table_row_count: descriptor.row_count,
            column_ids,
            chunks,
            chunk_starts,
            requested,
        });
    }
    let row_count = row_count.unwrap_or(0);
    if row_count == 0 {
        return Err(KinoError::EmptySample(format!(
            "task '{}' resolved to zero output rows",
            task.output_table_name
        )));
    }
    let items = partition_items(output_table, row_count, io_item_size)?;
    debug!(
        task = task_index,
        rows = row_count,
        items = items.len(),
        "decomposed task"
    );
    Ok(TaskPlan {
        task_index,
        output_table,
        row_count,
        items,
        samples,
    })
}

/// Build the work entry for one IO item of a decomposed task.
///
/// Leading context is the wider of the sample's own warmup window and the
/// graph's folded warmup/stencil requirement; trailing context comes from
/// positive stencil offsets. Both clamp at the source table's edges. When
/// the item begins exactly at a chunk boundary the chunk's explicit warmup
/// rows are used (Gather may list non-contiguous ones), extended with
/// contiguous rows if the graph demands more.
pub fn work_entry(
    plan: &TaskPlan,
    job_id: JobId,
    item_index: usize,
    graph: &GraphContext,
    work_item_size: u64,
) -> Result<WorkEntry> {
    let item = *plan.items.get(item_index).ok_or_else(|| {
        KinoError::InvalidConfig(format!(
            "item index {item_index} out of range for task {}",
            plan.task_index
        ))
    })?;
    if work_item_size == 0 {
        return Err(KinoError::InvalidConfig(
            "work_item_size must be >= 1".to_string(),
        ));
    }

    let mut samples = Vec::with_capacity(plan.samples.len());
    for sample in &plan.samples {
        let requested = &sample.requested[item.start_row as usize..item.end_row as usize];
        let first = requested[0];
        let last = *requested.last().expect("non-empty item range");

        let mut warmup = derive_warmup(sample, item.start_row, first, graph);
        warmup.retain(|&row| row < first);
        warmup.sort_unstable();
        warmup.dedup();

        let trailing_end = (last + 1 + graph.stencil_after).min(sample.table_row_count);
        let trailing: Vec<u64> = (last + 1..trailing_end).collect();

        let warmup_size = warmup.len() as u64;
        let mut rows = warmup;
        rows.extend_from_slice(requested);
        rows.extend_from_slice(&trailing);
        samples.push(LoadSample {
            table_id: sample.table_id,
            column_ids: sample.column_ids.clone(),
            warmup_size,
            rows,
        });
    }

    let item_rows = item.end_row - item.start_row;
    let mut work_item_sizes = Vec::with_capacity(item_rows.div_ceil(work_item_size) as usize);
    let mut remaining = item_rows;
    while remaining > 0 {
        let size = remaining.min(work_item_size);
        work_item_sizes.push(size);
        remaining -= size;
    }

    Ok(WorkEntry {
        job_id,
        task_index: plan.task_index,
        item,
        samples,
        work_item_sizes,
    })
}

fn derive_warmup(
    sample: &ResolvedSample,
    output_start: u64,
    first_row: u64,
    graph: &GraphContext,
) -> Vec<u64> {
    let graph_width = graph.leading();
    let chunk_index = match sample.chunk_starts.binary_search(&output_start) {
        Ok(i) => i,
        Err(i) => i.saturating_sub(1),
    };
    let chunk = &sample.chunks[chunk_index];
    let at_chunk_start = sample.chunk_starts[chunk_index] == output_start;
    if at_chunk_start {
        // Chunk-aligned items reuse the resolved warmup rows and extend
        // them only when the graph needs a wider contiguous window.
        let mut warmup = chunk.warmup.clone();
        warmup.extend(first_row.saturating_sub(graph_width)..first_row);
        warmup
    } else {
        let width = chunk.nominal_warmup.max(graph_width);
        (first_row.saturating_sub(width)..first_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{TableSample, Task};
    use crate::sampler::SamplerArgs;
    use kino_common::{ColumnId, DeviceType};
    use kino_storage::{
        Column, ColumnType, CompressionSpec, MemoryStorage, Storage, TableDescriptor,
    };
    use std::sync::Arc;

    fn cache_with_table(name: &str, rows: u64) -> MetadataCache {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .put_table(&TableDescriptor {
                id: TableId(1),
                name: name.to_string(),
                columns: vec![Column {
                    id: ColumnId(0),
                    name: "frame".to_string(),
                    column_type: ColumnType::Bytes,
                    compression: CompressionSpec::default(),
                }],
                row_count: rows,
                job_name: None,
                committed: true,
            })
            .expect("put table");
        MetadataCache::new(storage)
    }

    fn all_task(table: &str) -> Task {
        Task {
            output_table_name: "out".to_string(),
            samples: vec![TableSample {
                table_name: table.to_string(),
                column_names: vec!["frame".to_string()],
                sampler: SamplerArgs::All {
                    sample_size: 0,
                    warmup_size: 0,
                },
            }],
            output_compression: Vec::new(),
        }
    }

    #[test]
    fn partitioning_is_disjoint_and_covering() {
        let items = partition_items(TableId(9), 100, 25).expect("partition");
        assert_eq!(items.len(), 4);
        let expected = [(0, 25), (25, 50), (50, 75), (75, 100)];
        for (item, (start, end)) in items.iter().zip(expected) {
            assert_eq!((item.start_row, item.end_row), (start, end));
        }
        // Pairwise disjoint, union exact.
        for pair in items.windows(2) {
            assert_eq!(pair[0].end_row, pair[1].start_row);
        }
    }

    #[test]
    fn partitioning_rounds_up() {
        let items = partition_items(TableId(9), 10, 4).expect("partition");
        assert_eq!(items.len(), 3);
        assert_eq!(items[2].start_row, 8);
        assert_eq!(items[2].end_row, 10);
    }

    #[test]
    fn stencil_widens_item_fetch() {
        let cache = cache_with_table("clips", 20);
        let task = Task {
            output_table_name: "out".to_string(),
            samples: vec![TableSample {
                table_name: "clips".to_string(),
                column_names: vec!["frame".to_string()],
                sampler: SamplerArgs::StridedRange {
                    stride: 1,
                    warmup_starts: vec![10],
                    starts: vec![10],
                    ends: vec![14],
                },
            }],
            output_compression: Vec::new(),
        };
        let plan = decompose_task(&cache, 0, &task, TableId(2), 4).expect("decompose");
        let graph = GraphContext::from_ops(&[Op {
            name: "flow".to_string(),
            inputs: vec![],
            device: DeviceType::Cpu,
            kernel_args: Vec::new(),
            stencil: vec![-1, 0, 1],
            batch: 4,
            warmup: 0,
        }]);
        assert_eq!(graph.stencil_before, 1);
        assert_eq!(graph.stencil_after, 1);

        // Source rows [10, 14) must widen their fetch to [9, 15).
        let entry = work_entry(&plan, JobId(0), 0, &graph, 4).expect("entry");
        assert_eq!(entry.samples[0].warmup_size, 1);
        assert_eq!(entry.samples[0].rows, vec![9, 10, 11, 12, 13, 14]);
    }

    #[test]
    fn context_clamps_at_table_edges() {
        let cache = cache_with_table("clips", 12);
        let plan =
            decompose_task(&cache, 0, &all_task("clips"), TableId(2), 4).expect("decompose");
        let graph = GraphContext {
            warmup: 3,
            stencil_before: 1,
            stencil_after: 2,
        };
        let first = work_entry(&plan, JobId(0), 0, &graph, 4).expect("entry");
        // No rows exist before 0; trailing context present.
        assert_eq!(first.samples[0].warmup_size, 0);
        assert_eq!(first.samples[0].rows, vec![0, 1, 2, 3, 4, 5]);

        let last = work_entry(&plan, JobId(0), 2, &graph, 4).expect("entry");
        // Warmup takes the wider of graph warmup and stencil; trailing
        // clamps at the final row.
        assert_eq!(last.samples[0].warmup_size, 3);
        assert_eq!(last.samples[0].rows, vec![5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn work_item_sizes_cover_item() {
        let cache = cache_with_table("clips", 100);
        let plan =
            decompose_task(&cache, 0, &all_task("clips"), TableId(2), 25).expect("decompose");
        let entry =
            work_entry(&plan, JobId(0), 1, &GraphContext::default(), 10).expect("entry");
        assert_eq!(entry.work_item_sizes, vec![10, 10, 5]);
        assert_eq!(
            entry.work_item_sizes.iter().sum::<u64>(),
            entry.item.end_row - entry.item.start_row
        );
    }

    #[test]
    fn mismatched_sample_counts_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        for (id, name, rows) in [(1u64, "a", 10u64), (2, "b", 20)] {
            storage
                .put_table(&TableDescriptor {
                    id: TableId(id),
                    name: name.to_string(),
                    columns: vec![Column {
                        id: ColumnId(0),
                        name: "frame".to_string(),
                        column_type: ColumnType::Bytes,
                        compression: CompressionSpec::default(),
                    }],
                    row_count: rows,
                    job_name: None,
                    committed: true,
                })
                .expect("put table");
        }
        let cache = MetadataCache::new(storage);
        let task = Task {
            output_table_name: "out".to_string(),
            samples: ["a", "b"]
                .iter()
                .map(|name| TableSample {
                    table_name: (*name).to_string(),
                    column_names: vec!["frame".to_string()],
                    sampler: SamplerArgs::All {
                        sample_size: 0,
                        warmup_size: 0,
                    },
                })
                .collect(),
            output_compression: Vec::new(),
        };
        let err = decompose_task(&cache, 0, &task, TableId(3), 5).unwrap_err();
        assert!(matches!(err, KinoError::SampleCountMismatch(_)));
    }

    #[test]
    fn reprocessing_reproduces_identical_entries() {
        let cache = cache_with_table("clips", 50);
        let plan =
            decompose_task(&cache, 0, &all_task("clips"), TableId(2), 7).expect("decompose");
        let graph = GraphContext {
            warmup: 2,
            stencil_before: 0,
            stencil_after: 1,
        };
        for item_index in 0..plan.items.len() {
            let a = work_entry(&plan, JobId(3), item_index, &graph, 5).expect("entry");
            let b = work_entry(&plan, JobId(3), item_index, &graph, 5).expect("entry");
            assert_eq!(a.samples, b.samples);
            assert_eq!(a.work_item_sizes, b.work_item_sizes);
        }
    }
}
