//! Master state machine and scheduling logic.
//!
//! Responsibilities:
//! - accept submitted jobs, validate their op graphs against the registry,
//!   and decompose every task into IO items before anything is dispatched;
//! - serve pull-based work assignment to registered workers;
//! - track per-item `Pending → Assigned → Completed` transitions and
//!   per-job `Decomposing → Running → Done | Failed` transitions;
//! - requeue items owned by workers that miss their liveness deadline;
//! - enforce the per-item retry budget and declare terminal job states.
//!
//! Retry semantics: an item is never partially credited; a worker that
//! vanishes mid-item returns the whole item to `Pending`, and because
//! decomposition is deterministic the re-dispatched entry is identical.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use kino_common::{global_metrics, JobId, KinoError, Result};
use kino_exec::{validate_graph, ItemCompletion, ItemOutcome, OpRegistry};
use kino_plan::decompose::{decompose_task, work_entry};
use kino_plan::{GraphContext, Job, TaskPlan, WorkEntry};
use kino_storage::{Column, ColumnType, CompressionSpec, MetadataCache, TableDescriptor};
use tracing::{debug, info, warn};

/// Master behavior/configuration knobs.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Max assigned items a worker may own at once.
    pub max_items_per_worker: u32,
    /// Max attempts before an item's job is considered terminally failed.
    pub max_item_attempts: u32,
    /// Base retry backoff in milliseconds.
    pub retry_backoff_base_ms: u64,
    /// Liveness timeout after which a worker's assigned items are requeued.
    /// `0` disables liveness tracking.
    pub worker_liveness_timeout_ms: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            max_items_per_worker: 8,
            max_item_attempts: 3,
            retry_backoff_base_ms: 250,
            worker_liveness_timeout_ms: 15_000,
        }
    }
}

/// Job lifecycle states tracked by the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Graph validation and item partitioning in progress.
    Decomposing,
    /// Items are being assigned and completed.
    Running,
    /// Every item across every task completed.
    Done,
    /// An item exhausted its retry budget or hit a fatal error.
    Failed,
    /// Canceled by the submitter; outstanding items abandoned.
    Canceled,
}

/// IO item lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Waiting for an idle worker.
    Pending,
    /// Owned by exactly one worker.
    Assigned,
    /// Output range fully written and acknowledged.
    Completed,
}

/// Public job status snapshot.
#[derive(Debug, Clone)]
pub struct JobStatus {
    /// Job name.
    pub name: String,
    /// Current state.
    pub state: JobState,
    /// Items across all tasks.
    pub total_items: u64,
    /// Items waiting for assignment.
    pub pending_items: u64,
    /// Items currently owned by workers.
    pub assigned_items: u64,
    /// Items completed.
    pub completed_items: u64,
    /// Human-readable status message.
    pub message: String,
    /// Submission timestamp in unix milliseconds.
    pub submitted_at_ms: u64,
    /// Finish timestamp in unix milliseconds, or 0 if unfinished.
    pub finished_at_ms: u64,
}

#[derive(Debug)]
struct ItemRuntime {
    state: ItemState,
    assigned_worker: Option<String>,
    attempts: u32,
    ready_at_ms: u64,
    message: String,
}

struct TaskRuntime {
    plan: TaskPlan,
    items: Vec<ItemRuntime>,
}

struct JobRuntime {
    name: String,
    state: JobState,
    spec: Arc<Job>,
    graph_context: GraphContext,
    tasks: Vec<TaskRuntime>,
    submitted_at_ms: u64,
    finished_at_ms: u64,
    message: String,
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerHeartbeat {
    last_seen_ms: u64,
}

fn now_ms() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .map_err(|_| KinoError::InvalidConfig("system clock before unix epoch".to_string()))
}

/// In-memory master runtime for job/item orchestration.
pub struct Master {
    config: MasterConfig,
    registry: Arc<OpRegistry>,
    cache: Arc<MetadataCache>,
    jobs: BTreeMap<JobId, JobRuntime>,
    names: HashMap<String, JobId>,
    next_job_id: u64,
    worker_heartbeats: HashMap<String, WorkerHeartbeat>,
}

impl Master {
    /// Build a master over a registry and metadata cache.
    pub fn new(config: MasterConfig, registry: Arc<OpRegistry>, cache: Arc<MetadataCache>) -> Self {
        Self {
            config,
            registry,
            cache,
            jobs: BTreeMap::new(),
            names: HashMap::new(),
            next_job_id: 0,
            worker_heartbeats: HashMap::new(),
        }
    }

    /// Liveness probe used by submitters before queueing work.
    pub fn ping(&self) {}

    /// Accept a job: validate, decompose, and create output tables.
    ///
    /// All decomposition errors surface here; a job that starts running
    /// has already passed graph and sampling validation. `overwrite`
    /// deletes pre-existing output tables instead of rejecting the job.
    pub fn submit_job(&mut self, spec: Job, overwrite: bool) -> Result<JobId> {
        if self.names.contains_key(&spec.name) {
            return Err(KinoError::InvalidConfig(format!(
                "job '{}' already exists",
                spec.name
            )));
        }
        if spec.tasks.is_empty() {
            return Err(KinoError::InvalidConfig(format!(
                "job '{}' has no tasks",
                spec.name
            )));
        }
        let submitted_at_ms = now_ms()?;
        info!(job = %spec.name, tasks = spec.tasks.len(), "job submitted, decomposing");

        let graph_context = GraphContext::from_ops(&spec.ops);
        let storage = Arc::clone(self.cache.storage());
        let mut tasks = Vec::with_capacity(spec.tasks.len());
        for (task_index, task) in spec.tasks.iter().enumerate() {
            let table_columns: Vec<String> = task
                .samples
                .iter()
                .flat_map(|s| s.column_names.iter().cloned())
                .collect();
            let graph = validate_graph(&self.registry, &spec.ops, &table_columns)?;

            if let Some(existing) = self.cache.table_by_name(&task.output_table_name)? {
                if !overwrite {
                    return Err(KinoError::InvalidConfig(format!(
                        "job would overwrite existing table '{}'",
                        task.output_table_name
                    )));
                }
                storage.delete_table(existing.id)?;
                self.cache.invalidate_table(existing.id);
            }

            let output_table = storage.allocate_table_id()?;
            let plan = decompose_task(&self.cache, task_index, task, output_table, spec.io_item_size)?;
            let columns = graph
                .output_columns()
                .iter()
                .enumerate()
                .map(|(i, name)| Column {
                    id: kino_common::ColumnId(i as u32),
                    name: name.clone(),
                    column_type: ColumnType::Bytes,
                    compression: task
                        .output_compression
                        .get(i)
                        .cloned()
                        .unwrap_or_else(CompressionSpec::default),
                })
                .collect();
            storage.put_table(&TableDescriptor {
                id: output_table,
                name: task.output_table_name.clone(),
                columns,
                row_count: plan.row_count,
                job_name: Some(spec.name.clone()),
                committed: false,
            })?;
            self.cache.invalidate_table(output_table);

            let items = plan
                .items
                .iter()
                .map(|_| ItemRuntime {
                    state: ItemState::Pending,
                    assigned_worker: None,
                    attempts: 0,
                    ready_at_ms: 0,
                    message: String::new(),
                })
                .collect();
            tasks.push(TaskRuntime { plan, items });
        }

        let job_id = JobId(self.next_job_id);
        self.next_job_id += 1;
        let name = spec.name.clone();
        self.jobs.insert(
            job_id,
            JobRuntime {
                name: name.clone(),
                state: JobState::Running,
                spec: Arc::new(spec),
                graph_context,
                tasks,
                submitted_at_ms,
                finished_at_ms: 0,
                message: String::new(),
            },
        );
        self.names.insert(name.clone(), job_id);
        self.update_item_gauges(job_id);
        info!(job = %name, id = %job_id, "job running");
        Ok(job_id)
    }

    /// Immutable spec of an accepted job (workers fetch it once per job).
    pub fn job_spec(&self, job_id: JobId) -> Result<Arc<Job>> {
        self.jobs
            .get(&job_id)
            .map(|job| Arc::clone(&job.spec))
            .ok_or_else(|| KinoError::InvalidConfig(format!("unknown job id {job_id}")))
    }

    /// Worker pull-scheduling API: return up to `capacity` pending items.
    ///
    /// Idle workers request work, so load balances across heterogeneous
    /// node speeds without the master modeling them.
    pub fn get_work(&mut self, worker_id: &str, capacity: u32) -> Result<Vec<WorkEntry>> {
        let now = now_ms()?;
        self.requeue_stale_workers(now);
        self.touch_worker(worker_id, now);

        let owned = self.assigned_to_worker(worker_id);
        let mut remaining = capacity.min(self.config.max_items_per_worker.saturating_sub(owned));
        let mut out = Vec::new();
        if remaining == 0 {
            return Ok(out);
        }

        let mut touched_jobs = Vec::new();
        for (job_id, job) in self.jobs.iter_mut() {
            if job.state != JobState::Running {
                continue;
            }
            for task in job.tasks.iter_mut() {
                for (item_index, item) in task.items.iter_mut().enumerate() {
                    if remaining == 0 {
                        break;
                    }
                    if item.state != ItemState::Pending || item.ready_at_ms > now {
                        continue;
                    }
                    let entry = work_entry(
                        &task.plan,
                        *job_id,
                        item_index,
                        &job.graph_context,
                        job.spec.work_item_size,
                    )?;
                    item.state = ItemState::Assigned;
                    item.assigned_worker = Some(worker_id.to_string());
                    debug!(
                        worker = %worker_id,
                        job = %job.name,
                        item = item_index,
                        attempt = item.attempts,
                        "assigned item"
                    );
                    out.push(entry);
                    remaining -= 1;
                }
            }
            touched_jobs.push(*job_id);
        }
        for job_id in touched_jobs {
            self.update_item_gauges(job_id);
        }
        Ok(out)
    }

    /// Record one item completion report from a worker.
    ///
    /// Stale reports (wrong owner, already-requeued item, canceled or
    /// finished job) are ignored rather than failed: the master is the
    /// single authority on item state.
    pub fn report_item(&mut self, worker_id: &str, completion: &ItemCompletion) -> Result<()> {
        let now = now_ms()?;
        self.touch_worker(worker_id, now);
        let config = self.config.clone();
        let Some(job) = self.jobs.get_mut(&completion.job_id) else {
            return Err(KinoError::InvalidConfig(format!(
                "unknown job id {}",
                completion.job_id
            )));
        };
        if job.state != JobState::Running {
            debug!(job = %job.name, "ignoring report for non-running job");
            return Ok(());
        }
        let task = job
            .tasks
            .get_mut(completion.task_index)
            .ok_or_else(|| KinoError::InvalidConfig("task index out of range".to_string()))?;
        let item_index = completion.item_id.0 as usize;
        let item = task
            .items
            .get_mut(item_index)
            .ok_or_else(|| KinoError::InvalidConfig("item id out of range".to_string()))?;
        if item.state != ItemState::Assigned
            || item.assigned_worker.as_deref() != Some(worker_id)
        {
            debug!(
                worker = %worker_id,
                item = item_index,
                "ignoring stale item report"
            );
            return Ok(());
        }

        match &completion.outcome {
            ItemOutcome::Completed => {
                item.state = ItemState::Completed;
                item.assigned_worker = None;
                item.message = "completed".to_string();
                Self::finish_job_if_done(&self.cache, job, now)?;
            }
            ItemOutcome::Failed { message, fatal } => {
                item.attempts += 1;
                item.assigned_worker = None;
                item.message = message.clone();
                let attempts = item.attempts;
                if *fatal || attempts >= config.max_item_attempts {
                    job.state = JobState::Failed;
                    job.finished_at_ms = now;
                    job.message = format!(
                        "task {} item {item_index} failed after {attempts} attempts: {message}",
                        completion.task_index
                    );
                    warn!(job = %job.name, message = %job.message, "job failed");
                } else {
                    item.state = ItemState::Pending;
                    item.ready_at_ms = now
                        .saturating_add(backoff_ms(config.retry_backoff_base_ms, attempts));
                    global_metrics().inc_scheduler_retries(&job.name);
                    debug!(
                        job = %job.name,
                        item = item_index,
                        attempt = attempts,
                        "item requeued after failure"
                    );
                }
            }
        }
        self.update_item_gauges(completion.job_id);
        Ok(())
    }

    /// Record a worker heartbeat and run the liveness sweep.
    pub fn heartbeat(&mut self, worker_id: &str, _running_items: u32) -> Result<()> {
        let now = now_ms()?;
        self.touch_worker(worker_id, now);
        self.requeue_stale_workers(now);
        Ok(())
    }

    /// Cancel a job: pending items are dropped, assigned items abandoned.
    pub fn cancel_job(&mut self, name: &str, reason: &str) -> Result<JobState> {
        let now = now_ms()?;
        let job_id = self.job_id_by_name(name)?;
        let job = self.jobs.get_mut(&job_id).expect("job id from names map");
        if matches!(job.state, JobState::Running | JobState::Decomposing) {
            job.state = JobState::Canceled;
            job.finished_at_ms = now;
            job.message = format!("canceled: {reason}");
            info!(job = %name, reason = %reason, "job canceled");
        }
        self.update_item_gauges(job_id);
        Ok(self.jobs[&job_id].state)
    }

    /// Status snapshot for one job.
    pub fn job_status(&self, name: &str) -> Result<JobStatus> {
        let job_id = self.job_id_by_name(name)?;
        let job = &self.jobs[&job_id];
        let (mut pending, mut assigned, mut completed, mut total) = (0u64, 0u64, 0u64, 0u64);
        for task in &job.tasks {
            for item in &task.items {
                total += 1;
                match item.state {
                    ItemState::Pending => pending += 1,
                    ItemState::Assigned => assigned += 1,
                    ItemState::Completed => completed += 1,
                }
            }
        }
        Ok(JobStatus {
            name: job.name.clone(),
            state: job.state,
            total_items: total,
            pending_items: pending,
            assigned_items: assigned,
            completed_items: completed,
            message: job.message.clone(),
            submitted_at_ms: job.submitted_at_ms,
            finished_at_ms: job.finished_at_ms,
        })
    }

    fn job_id_by_name(&self, name: &str) -> Result<JobId> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| KinoError::InvalidConfig(format!("unknown job '{name}'")))
    }

    fn touch_worker(&mut self, worker_id: &str, now: u64) {
        self.worker_heartbeats
            .entry(worker_id.to_string())
            .and_modify(|hb| hb.last_seen_ms = now)
            .or_insert(WorkerHeartbeat { last_seen_ms: now });
    }

    fn assigned_to_worker(&self, worker_id: &str) -> u32 {
        self.jobs
            .values()
            .flat_map(|job| job.tasks.iter())
            .flat_map(|task| task.items.iter())
            .filter(|item| {
                item.state == ItemState::Assigned
                    && item.assigned_worker.as_deref() == Some(worker_id)
            })
            .count() as u32
    }

    fn requeue_stale_workers(&mut self, now: u64) {
        if self.config.worker_liveness_timeout_ms == 0 {
            return;
        }
        let stale: Vec<String> = self
            .worker_heartbeats
            .iter()
            .filter(|(_, hb)| {
                now.saturating_sub(hb.last_seen_ms) > self.config.worker_liveness_timeout_ms
            })
            .map(|(worker, _)| worker.clone())
            .collect();
        for worker in stale {
            warn!(worker = %worker, "worker missed liveness deadline, requeueing its items");
            self.worker_heartbeats.remove(&worker);
            self.requeue_worker_items(&worker, now);
        }
    }

    fn requeue_worker_items(&mut self, worker_id: &str, now: u64) {
        let config = self.config.clone();
        let mut touched = Vec::new();
        for (job_id, job) in self.jobs.iter_mut() {
            if job.state != JobState::Running {
                continue;
            }
            for (task_index, task) in job.tasks.iter_mut().enumerate() {
                for (item_index, item) in task.items.iter_mut().enumerate() {
                    if item.state != ItemState::Assigned
                        || item.assigned_worker.as_deref() != Some(worker_id)
                    {
                        continue;
                    }
                    item.attempts += 1;
                    item.assigned_worker = None;
                    item.message = "worker lost heartbeat".to_string();
                    if item.attempts >= config.max_item_attempts {
                        job.state = JobState::Failed;
                        job.finished_at_ms = now;
                        job.message = format!(
                            "task {task_index} item {item_index} exhausted retries \
                             after worker timeout"
                        );
                    } else {
                        item.state = ItemState::Pending;
                        item.ready_at_ms = now.saturating_add(backoff_ms(
                            config.retry_backoff_base_ms,
                            item.attempts,
                        ));
                        global_metrics().inc_scheduler_retries(&job.name);
                    }
                }
            }
            touched.push(*job_id);
        }
        for job_id in touched {
            self.update_item_gauges(job_id);
        }
    }

    fn finish_job_if_done(cache: &MetadataCache, job: &mut JobRuntime, now: u64) -> Result<()> {
        let done = job
            .tasks
            .iter()
            .all(|task| task.items.iter().all(|item| item.state == ItemState::Completed));
        if !done {
            return Ok(());
        }
        for task in &job.tasks {
            cache.storage().commit_table(task.plan.output_table)?;
            cache.invalidate_table(task.plan.output_table);
        }
        job.state = JobState::Done;
        job.finished_at_ms = now;
        job.message = "done".to_string();
        info!(job = %job.name, "job done");
        Ok(())
    }

    fn update_item_gauges(&self, job_id: JobId) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        let (mut pending, mut assigned, mut completed) = (0u64, 0u64, 0u64);
        for task in &job.tasks {
            for item in &task.items {
                match item.state {
                    ItemState::Pending => pending += 1,
                    ItemState::Assigned => assigned += 1,
                    ItemState::Completed => completed += 1,
                }
            }
        }
        global_metrics().set_scheduler_items(&job.name, pending, assigned, completed);
    }
}

fn backoff_ms(base: u64, attempt: u32) -> u64 {
    base.saturating_mul(1_u64 << attempt.saturating_sub(1).min(10))
}

/// Accessors used by tests to reach into item bookkeeping.
#[cfg(test)]
impl Master {
    pub(crate) fn item_state(&self, job: JobId, task: usize, item: usize) -> ItemState {
        self.jobs[&job].tasks[task].items[item].state
    }

    pub(crate) fn output_table(&self, job: JobId, task: usize) -> kino_common::TableId {
        self.jobs[&job].tasks[task].plan.output_table
    }
}
