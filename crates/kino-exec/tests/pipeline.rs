//! End-to-end pipeline tests: load → evaluate → save over in-memory
//! storage with the reference raw-frame decoder.

use std::sync::Arc;
use std::time::Duration;

use kino_common::{
    ColumnId, DeviceHandle, DeviceType, JobId, KinoError, MemoryPoolConfig, Result, TableId,
};
use kino_exec::kernels::register_builtins;
use kino_exec::{
    validate_graph, ColumnBatch, ColumnBatchBuilder, EvaluateStage, ItemOutcome, Kernel,
    KernelCapabilities, KernelConfig, KernelContext, KernelInput, LoadStage, OpRegistry,
    PipelineConfig, RawFrameDecoder, SaveStage, WorkUnit, WorkerPipeline,
};
use kino_mem::BufferPool;
use kino_exec::GraphPlan;
use kino_plan::decompose::{decompose_task, work_entry};
use kino_plan::{DecodePlanner, Op, OpInput, SamplerArgs, TableSample, Task};
use kino_storage::{
    Column, ColumnType, CompressionSpec, MemoryStorage, MetadataCache, Storage, TableDescriptor,
    VideoIndexEntry,
};

fn frame(width: u32, height: u32, value: u8) -> Vec<u8> {
    vec![value; (width * height * 3) as usize]
}

fn put_video_table(
    storage: &Arc<MemoryStorage>,
    id: u64,
    name: &str,
    frames: u64,
    keyframe_interval: u64,
) -> TableId {
    let (width, height) = (2u32, 1u32);
    let frame_size = (width * height * 3) as u64;
    let table_id = TableId(id);
    storage
        .put_table(&TableDescriptor {
            id: table_id,
            name: name.to_string(),
            columns: vec![Column {
                id: ColumnId(0),
                name: "frame".to_string(),
                column_type: ColumnType::Video,
                compression: CompressionSpec::default(),
            }],
            row_count: frames,
            job_name: None,
            committed: true,
        })
        .expect("put table");
    let keyframe_positions: Vec<u64> = (0..frames).step_by(keyframe_interval as usize).collect();
    let keyframe_byte_offsets: Vec<u64> =
        keyframe_positions.iter().map(|k| k * frame_size).collect();
    storage
        .put_video_index(
            table_id,
            ColumnId(0),
            &VideoIndexEntry {
                encoded_video_id: id,
                frame_count: frames,
                width,
                height,
                keyframe_positions,
                keyframe_byte_offsets,
                encoded_size: frames * frame_size,
            },
        )
        .expect("put index");
    let stream: Vec<u8> = (0..frames)
        .flat_map(|f| frame(width, height, f as u8))
        .collect();
    storage.put_encoded_video(id, &stream).expect("put video");
    table_id
}

fn put_bytes_table(storage: &Arc<MemoryStorage>, id: u64, name: &str, rows: u64) -> TableId {
    let table_id = TableId(id);
    storage
        .put_table(&TableDescriptor {
            id: table_id,
            name: name.to_string(),
            columns: vec![Column {
                id: ColumnId(0),
                name: "value".to_string(),
                column_type: ColumnType::Bytes,
                compression: CompressionSpec::default(),
            }],
            row_count: rows,
            job_name: None,
            committed: true,
        })
        .expect("put table");
    let elements: Vec<Vec<u8>> = (0..rows).map(|i| vec![i as u8]).collect();
    storage
        .write_rows(table_id, ColumnId(0), 0, &elements)
        .expect("write rows");
    table_id
}

fn output_table(
    storage: &Arc<MemoryStorage>,
    id: u64,
    name: &str,
    plan: &GraphPlan,
    row_count: u64,
    codec: &str,
) -> TableId {
    let table_id = TableId(id);
    storage
        .put_table(&TableDescriptor {
            id: table_id,
            name: name.to_string(),
            columns: plan
                .output_columns()
                .iter()
                .enumerate()
                .map(|(i, column)| Column {
                    id: ColumnId(i as u32),
                    name: column.clone(),
                    column_type: ColumnType::Bytes,
                    compression: CompressionSpec {
                        codec: codec.to_string(),
                        options: Default::default(),
                    },
                })
                .collect(),
            row_count,
            job_name: Some("test-job".to_string()),
            committed: false,
        })
        .expect("put output table");
    table_id
}

fn spawn_pipeline(cache: &Arc<MetadataCache>, pool: &BufferPool) -> WorkerPipeline {
    let load = LoadStage::new(
        Arc::clone(cache),
        Arc::new(RawFrameDecoder),
        DecodePlanner::default(),
        pool.clone(),
    );
    let evaluate = EvaluateStage::new(pool.clone(), DeviceHandle::cpu());
    let save = SaveStage::new(Arc::clone(cache));
    WorkerPipeline::spawn(PipelineConfig::default(), load, evaluate, save)
}

/// Sums the first byte of each row in a `[-1, 0, 1]` window, clamped at
/// the table's global edges.
struct WindowSumKernel;

impl Kernel for WindowSumKernel {
    fn execute(
        &mut self,
        ctx: &KernelContext<'_>,
        input: &KernelInput<'_>,
    ) -> Result<Vec<ColumnBatch>> {
        let column = &input.columns[0];
        let count = input.center_rows();
        let mut builder = ColumnBatchBuilder::new(ctx.pool, ctx.device, count, count as u64)?;
        for i in 0..count {
            let center = input.before + i;
            let mut sum = column.element(center)[0] as u64;
            if center > 0 {
                sum += column.element(center - 1)[0] as u64;
            }
            if center + 1 < column.rows() {
                sum += column.element(center + 1)[0] as u64;
            }
            builder.push(&[sum as u8])?;
        }
        Ok(vec![builder.finish()])
    }
}

struct FailingKernel;

impl Kernel for FailingKernel {
    fn execute(
        &mut self,
        _ctx: &KernelContext<'_>,
        _input: &KernelInput<'_>,
    ) -> Result<Vec<ColumnBatch>> {
        Err(KinoError::Kernel("synthetic kernel failure".to_string()))
    }
}

fn window_registry() -> OpRegistry {
    let registry = OpRegistry::new();
    registry.register_op("window_sum", 1, vec!["sum".to_string()]);
    registry
        .register_kernel(
            "window_sum",
            DeviceType::Cpu,
            KernelCapabilities {
                batched: true,
                max_batch: 4,
                stencil: Some((-1, 1)),
                warmup: true,
                num_devices: 1,
            },
            Arc::new(|_config: &KernelConfig| Ok(Box::new(WindowSumKernel) as Box<dyn Kernel>)),
        )
        .expect("register");
    registry
}

fn run_entries(
    pipeline: &WorkerPipeline,
    plan: &Arc<GraphPlan>,
    entries: Vec<kino_plan::WorkEntry>,
) -> Vec<ItemOutcome> {
    let expected = entries.len();
    for entry in entries {
        pipeline
            .submit(WorkUnit {
                entry,
                plan: Arc::clone(plan),
            })
            .expect("submit");
    }
    (0..expected)
        .map(|_| {
            pipeline
                .completions()
                .recv_timeout(Duration::from_secs(10))
                .expect("completion")
                .outcome
        })
        .collect()
}

#[test]
fn histogram_job_over_video_runs_end_to_end() {
    let storage = Arc::new(MemoryStorage::new());
    put_video_table(&storage, 1, "clips", 20, 5);
    let cache = Arc::new(MetadataCache::new(storage.clone() as Arc<dyn Storage>));
    let pool = BufferPool::new(MemoryPoolConfig::default());

    let registry = OpRegistry::new();
    register_builtins(&registry);
    let ops = vec![Op {
        name: "histogram".to_string(),
        inputs: vec![OpInput {
            op_index: None,
            columns: vec!["frame".to_string()],
        }],
        device: DeviceType::Cpu,
        kernel_args: Vec::new(),
        stencil: Vec::new(),
        batch: 8,
        warmup: 0,
    }];
    let plan = Arc::new(validate_graph(&registry, &ops, &["frame".to_string()]).expect("graph"));

    let task = Task {
        output_table_name: "hists".to_string(),
        samples: vec![TableSample {
            table_name: "clips".to_string(),
            column_names: vec!["frame".to_string()],
            sampler: SamplerArgs::All {
                sample_size: 0,
                warmup_size: 0,
            },
        }],
        output_compression: Vec::new(),
    };
    let out_table = output_table(&storage, 50, "hists", &plan, 20, "zstd");
    let task_plan = decompose_task(&cache, 0, &task, out_table, 6).expect("decompose");
    assert_eq!(task_plan.items.len(), 4);

    let entries: Vec<_> = (0..task_plan.items.len())
        .map(|i| work_entry(&task_plan, JobId(0), i, &plan.context, 3).expect("entry"))
        .collect();

    let pipeline = spawn_pipeline(&cache, &pool);
    let outcomes = run_entries(&pipeline, &plan, entries);
    assert!(outcomes.iter().all(|o| *o == ItemOutcome::Completed));
    pipeline.shutdown();

    let rows: Vec<u64> = (0..20).collect();
    let stored = storage
        .read_rows(out_table, ColumnId(0), &rows)
        .expect("read output");
    for (row, element) in stored.iter().enumerate() {
        let unpacked = zstd::stream::decode_all(element.as_slice()).expect("zstd");
        assert_eq!(unpacked.len(), 16 * 3 * 4);
        let bins: Vec<u32> = unpacked
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        // Every pixel of frame `row` holds value `row`, so each channel
        // puts both pixels in one bin.
        let expected_bin = (row * 16) / 256;
        for channel in 0..3 {
            assert_eq!(bins[channel * 16 + expected_bin], 2, "row {row}");
            assert_eq!(bins[channel * 16..(channel + 1) * 16].iter().sum::<u32>(), 2);
        }
    }
}

#[test]
fn stencil_windows_cross_item_boundaries_and_warmup_is_stripped() {
    let storage = Arc::new(MemoryStorage::new());
    put_bytes_table(&storage, 2, "vals", 12);
    let cache = Arc::new(MetadataCache::new(storage.clone() as Arc<dyn Storage>));
    let pool = BufferPool::new(MemoryPoolConfig::default());

    let registry = window_registry();
    let ops = vec![Op {
        name: "window_sum".to_string(),
        inputs: vec![OpInput {
            op_index: None,
            columns: vec!["value".to_string()],
        }],
        device: DeviceType::Cpu,
        kernel_args: Vec::new(),
        stencil: vec![-1, 0, 1],
        batch: 4,
        warmup: 2,
    }];
    let plan = Arc::new(validate_graph(&registry, &ops, &["value".to_string()]).expect("graph"));

    let task = Task {
        output_table_name: "sums".to_string(),
        samples: vec![TableSample {
            table_name: "vals".to_string(),
            column_names: vec!["value".to_string()],
            sampler: SamplerArgs::All {
                sample_size: 0,
                warmup_size: 0,
            },
        }],
        output_compression: Vec::new(),
    };
    let out_table = output_table(&storage, 51, "sums", &plan, 12, "none");
    let task_plan = decompose_task(&cache, 0, &task, out_table, 4).expect("decompose");

    let entries: Vec<_> = (0..task_plan.items.len())
        .map(|i| work_entry(&task_plan, JobId(1), i, &plan.context, 4).expect("entry"))
        .collect();

    let pipeline = spawn_pipeline(&cache, &pool);
    let outcomes = run_entries(&pipeline, &plan, entries);
    assert!(outcomes.iter().all(|o| *o == ItemOutcome::Completed));
    pipeline.shutdown();

    let rows: Vec<u64> = (0..12).collect();
    let stored = storage
        .read_rows(out_table, ColumnId(0), &rows)
        .expect("read output");
    // Exactly the task's 12 output rows were written: warmup/context rows
    // never reach the saved table.
    assert_eq!(stored.len(), 12);
    for (row, element) in stored.iter().enumerate() {
        let row = row as u64;
        let expected: u64 = if row == 0 {
            1
        } else if row == 11 {
            21
        } else {
            (row - 1) + row + (row + 1)
        };
        assert_eq!(element, &vec![expected as u8], "row {row}");
    }
}

#[test]
fn kernel_failure_aborts_item_without_completion_credit() {
    let storage = Arc::new(MemoryStorage::new());
    put_bytes_table(&storage, 3, "vals", 8);
    let cache = Arc::new(MetadataCache::new(storage.clone() as Arc<dyn Storage>));
    let pool = BufferPool::new(MemoryPoolConfig::default());

    let registry = OpRegistry::new();
    registry.register_op("explode", 1, vec!["out".to_string()]);
    registry
        .register_kernel(
            "explode",
            DeviceType::Cpu,
            KernelCapabilities {
                batched: true,
                max_batch: 8,
                stencil: None,
                warmup: false,
                num_devices: 1,
            },
            Arc::new(|_config: &KernelConfig| Ok(Box::new(FailingKernel) as Box<dyn Kernel>)),
        )
        .expect("register");
    let ops = vec![Op {
        name: "explode".to_string(),
        inputs: vec![OpInput {
            op_index: None,
            columns: vec!["value".to_string()],
        }],
        device: DeviceType::Cpu,
        kernel_args: Vec::new(),
        stencil: Vec::new(),
        batch: 8,
        warmup: 0,
    }];
    let plan = Arc::new(validate_graph(&registry, &ops, &["value".to_string()]).expect("graph"));

    let task = Task {
        output_table_name: "boom".to_string(),
        samples: vec![TableSample {
            table_name: "vals".to_string(),
            column_names: vec!["value".to_string()],
            sampler: SamplerArgs::All {
                sample_size: 0,
                warmup_size: 0,
            },
        }],
        output_compression: Vec::new(),
    };
    let out_table = output_table(&storage, 52, "boom", &plan, 8, "none");
    let task_plan = decompose_task(&cache, 0, &task, out_table, 8).expect("decompose");
    let entries =
        vec![work_entry(&task_plan, JobId(2), 0, &plan.context, 8).expect("entry")];

    let pipeline = spawn_pipeline(&cache, &pool);
    let outcomes = run_entries(&pipeline, &plan, entries);
    pipeline.shutdown();

    match &outcomes[0] {
        ItemOutcome::Failed { message, fatal } => {
            assert!(message.contains("synthetic kernel failure"));
            // Kernel faults stay retryable: transient and deterministic
            // failures are indistinguishable from outside the kernel.
            assert!(!fatal);
        }
        other => panic!("expected failure, got {other:?}"),
    }
    // Nothing was persisted for the failed item.
    assert!(storage.read_rows(out_table, ColumnId(0), &[0]).is_err());
}
