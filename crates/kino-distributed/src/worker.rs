//! Worker runtime and control-plane seam.
//!
//! Responsibilities:
//! - pull work entries from the master (`get_work`) sized to local
//!   pipeline capacity;
//! - fetch and cache each job's spec, validating its op graph once per
//!   task against the local registry;
//! - feed entries to the bounded pipeline instances (one per device) and
//!   report completions back;
//! - heartbeat so the master's liveness sweep keeps assigned items honest.
//!
//! The transport behind [`MasterControlPlane`] is an external collaborator;
//! [`InProcessControlPlane`] is the in-tree implementation used by tests
//! and embedded runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use kino_common::{DeviceHandle, EngineConfig, JobId, KinoError, MemoryPoolConfig, Result};
use kino_exec::{
    validate_graph, EvaluateStage, GraphPlan, ItemCompletion, LoadStage, OpRegistry,
    PipelineConfig, SaveStage, VideoDecoder, WorkUnit, WorkerPipeline,
};
use kino_mem::BufferPool;
use kino_plan::{DecodePlanner, Job, WorkEntry};
use kino_storage::MetadataCache;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::master::Master;

/// Control-plane contract used by the worker runtime.
#[async_trait]
pub trait MasterControlPlane: Send + Sync {
    /// Pull up to `capacity` work entries for `worker_id`.
    async fn get_work(&self, worker_id: &str, capacity: u32) -> Result<Vec<WorkEntry>>;
    /// Fetch the immutable spec of an accepted job.
    async fn job_spec(&self, job_id: JobId) -> Result<Arc<Job>>;
    /// Report one item completion.
    async fn report_item(&self, worker_id: &str, completion: ItemCompletion) -> Result<()>;
    /// Send a periodic liveness heartbeat.
    async fn heartbeat(&self, worker_id: &str, running_items: u32) -> Result<()>;
}

/// In-process control-plane adapter backed by a shared master.
#[derive(Clone)]
pub struct InProcessControlPlane {
    master: Arc<Mutex<Master>>,
}

impl InProcessControlPlane {
    /// Create an adapter over shared master state.
    pub fn new(master: Arc<Mutex<Master>>) -> Self {
        Self { master }
    }

    /// Access the shared master.
    #[must_use]
    pub fn master(&self) -> Arc<Mutex<Master>> {
        Arc::clone(&self.master)
    }
}

#[async_trait]
impl MasterControlPlane for InProcessControlPlane {
    async fn get_work(&self, worker_id: &str, capacity: u32) -> Result<Vec<WorkEntry>> {
        self.master.lock().await.get_work(worker_id, capacity)
    }

    async fn job_spec(&self, job_id: JobId) -> Result<Arc<Job>> {
        self.master.lock().await.job_spec(job_id)
    }

    async fn report_item(&self, worker_id: &str, completion: ItemCompletion) -> Result<()> {
        self.master.lock().await.report_item(worker_id, &completion)
    }

    async fn heartbeat(&self, worker_id: &str, running_items: u32) -> Result<()> {
        self.master.lock().await.heartbeat(worker_id, running_items)
    }
}

/// Worker resource/configuration controls.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable worker id used in scheduling and heartbeats.
    pub worker_id: String,
    /// Devices this worker may use; pipelines bind to one handle each.
    pub devices: Vec<DeviceHandle>,
    /// Pipeline instances spawned per device.
    pub pipelines_per_device: usize,
    /// Depth of each pipeline's inter-stage queues.
    pub queue_depth: usize,
    /// Memory pool configuration, fixed for the process lifetime.
    pub memory_pool: MemoryPoolConfig,
    /// Decode-planner tuning shared by all pipelines.
    pub planner: DecodePlanner,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            worker_id: "worker-1".to_string(),
            devices: vec![DeviceHandle::cpu()],
            pipelines_per_device: engine.pipeline_instances,
            queue_depth: engine.pipeline_queue_depth,
            memory_pool: MemoryPoolConfig::default(),
            planner: DecodePlanner::default(),
        }
    }
}

/// Worker runtime: polls the control plane and drives pipeline instances.
pub struct Worker<C>
where
    C: MasterControlPlane + 'static,
{
    config: WorkerConfig,
    control_plane: Arc<C>,
    registry: Arc<OpRegistry>,
    pipelines: Vec<Arc<WorkerPipeline>>,
    // Per-(job, task) graph plans, validated once and shared by items.
    plans: StdMutex<HashMap<(JobId, usize), Arc<GraphPlan>>>,
    specs: StdMutex<HashMap<JobId, Arc<Job>>>,
    in_flight: AtomicU32,
    next_pipeline: AtomicUsize,
}

impl<C> Worker<C>
where
    C: MasterControlPlane + 'static,
{
    /// Build a worker and spawn its pipeline instances.
    pub fn new(
        config: WorkerConfig,
        control_plane: Arc<C>,
        registry: Arc<OpRegistry>,
        cache: Arc<MetadataCache>,
        decoder: Arc<dyn VideoDecoder>,
    ) -> Self {
        let pool = BufferPool::new(config.memory_pool);
        let instances = config.pipelines_per_device.max(1);
        let devices = if config.devices.is_empty() {
            vec![DeviceHandle::cpu()]
        } else {
            config.devices.clone()
        };
        let pipelines = devices
            .iter()
            .flat_map(|&device| std::iter::repeat(device).take(instances))
            .map(|device| {
                let load = LoadStage::new(
                    Arc::clone(&cache),
                    Arc::clone(&decoder),
                    config.planner,
                    pool.clone(),
                );
                let evaluate = EvaluateStage::new(pool.clone(), device);
                let save = SaveStage::new(Arc::clone(&cache));
                Arc::new(WorkerPipeline::spawn(
                    PipelineConfig {
                        queue_depth: config.queue_depth,
                    },
                    load,
                    evaluate,
                    save,
                ))
            })
            .collect::<Vec<_>>();
        info!(
            worker = %config.worker_id,
            pipelines = pipelines.len(),
            "worker started"
        );
        Self {
            config,
            control_plane,
            registry,
            pipelines,
            plans: StdMutex::new(HashMap::new()),
            specs: StdMutex::new(HashMap::new()),
            in_flight: AtomicU32::new(0),
            next_pipeline: AtomicUsize::new(0),
        }
    }

    fn slots(&self) -> u32 {
        // Each pipeline holds one item per stage plus its queues.
        (self.pipelines.len() * (self.config.queue_depth * 2 + 3)) as u32
    }

    /// Items accepted but not yet reported.
    #[must_use]
    pub fn running_items(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Perform one poll cycle:
    /// - drain and report finished items
    /// - heartbeat
    /// - pull new assignments up to free capacity and feed the pipelines
    pub async fn poll_once(&self) -> Result<usize> {
        self.drain_completions().await?;
        let running = self.running_items();
        self.control_plane
            .heartbeat(&self.config.worker_id, running)
            .await?;
        let capacity = self.slots().saturating_sub(running);
        if capacity == 0 {
            return Ok(0);
        }
        let entries = self
            .control_plane
            .get_work(&self.config.worker_id, capacity)
            .await?;
        let count = entries.len();
        for entry in entries {
            let plan = self.plan_for(entry.job_id, entry.task_index).await?;
            debug!(
                worker = %self.config.worker_id,
                job = %entry.job_id,
                item = %entry.item.item_id,
                "worker picked item"
            );
            let index =
                self.next_pipeline.fetch_add(1, Ordering::Relaxed) % self.pipelines.len();
            let pipeline = Arc::clone(&self.pipelines[index]);
            // The entry queue is bounded; park the blocking send off the
            // async runtime.
            tokio::task::spawn_blocking(move || pipeline.submit(WorkUnit { entry, plan }))
                .await
                .map_err(|e| KinoError::InvalidConfig(format!("pipeline feed task: {e}")))??;
            self.in_flight.fetch_add(1, Ordering::AcqRel);
        }
        self.drain_completions().await?;
        Ok(count)
    }

    async fn drain_completions(&self) -> Result<()> {
        for pipeline in &self.pipelines {
            while let Ok(completion) = pipeline.completions().try_recv() {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                self.control_plane
                    .report_item(&self.config.worker_id, completion)
                    .await?;
            }
        }
        Ok(())
    }

    async fn plan_for(&self, job_id: JobId, task_index: usize) -> Result<Arc<GraphPlan>> {
        if let Some(plan) = self
            .plans
            .lock()
            .expect("plan cache lock poisoned")
            .get(&(job_id, task_index))
        {
            return Ok(Arc::clone(plan));
        }
        let spec = {
            let cached = self
                .specs
                .lock()
                .expect("spec cache lock poisoned")
                .get(&job_id)
                .cloned();
            match cached {
                Some(spec) => spec,
                None => {
                    let spec = self.control_plane.job_spec(job_id).await?;
                    self.specs
                        .lock()
                        .expect("spec cache lock poisoned")
                        .insert(job_id, Arc::clone(&spec));
                    spec
                }
            }
        };
        let task = spec.tasks.get(task_index).ok_or_else(|| {
            KinoError::InvalidConfig(format!("job {job_id} has no task {task_index}"))
        })?;
        let table_columns: Vec<String> = task
            .samples
            .iter()
            .flat_map(|s| s.column_names.iter().cloned())
            .collect();
        let plan = Arc::new(validate_graph(&self.registry, &spec.ops, &table_columns)?);
        self.plans
            .lock()
            .expect("plan cache lock poisoned")
            .insert((job_id, task_index), Arc::clone(&plan));
        Ok(plan)
    }
}
