//! Embedded master + workers in one process.
//!
//! The same wiring the distributed deployment uses, minus the wire
//! transport: workers talk to the master through [`InProcessControlPlane`].
//! Single-node runs and tests submit jobs here and drive the workers'
//! poll loops until the job reaches a terminal state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kino_common::{JobId, KinoError, Result};
use kino_exec::{OpRegistry, VideoDecoder};
use kino_plan::Job;
use kino_storage::{MetadataCache, Storage};
use tokio::sync::Mutex;

use crate::master::{JobState, JobStatus, Master, MasterConfig};
use crate::worker::{InProcessControlPlane, Worker, WorkerConfig};

/// One master plus N workers over the in-process control plane.
pub struct LocalCluster {
    master: Arc<Mutex<Master>>,
    workers: Vec<Worker<InProcessControlPlane>>,
}

impl LocalCluster {
    /// Wire up a cluster over shared storage, registry, and decoder.
    pub fn new(
        master_config: MasterConfig,
        worker_configs: Vec<WorkerConfig>,
        registry: Arc<OpRegistry>,
        storage: Arc<dyn Storage>,
        decoder: Arc<dyn VideoDecoder>,
    ) -> Self {
        let cache = Arc::new(MetadataCache::new(storage));
        let master = Arc::new(Mutex::new(Master::new(
            master_config,
            Arc::clone(&registry),
            Arc::clone(&cache),
        )));
        let control_plane = Arc::new(InProcessControlPlane::new(Arc::clone(&master)));
        let workers = worker_configs
            .into_iter()
            .map(|config| {
                Worker::new(
                    config,
                    Arc::clone(&control_plane),
                    Arc::clone(&registry),
                    Arc::clone(&cache),
                    Arc::clone(&decoder),
                )
            })
            .collect();
        Self { master, workers }
    }

    /// Shared master handle.
    #[must_use]
    pub fn master(&self) -> Arc<Mutex<Master>> {
        Arc::clone(&self.master)
    }

    /// Submit a job without waiting for it.
    pub async fn submit(&self, job: Job, overwrite: bool) -> Result<JobId> {
        self.master.lock().await.submit_job(job, overwrite)
    }

    /// Drive the workers until `name` reaches a terminal state.
    pub async fn wait(&self, name: &str, timeout: Duration) -> Result<JobStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            for worker in &self.workers {
                worker.poll_once().await?;
            }
            let status = self.master.lock().await.job_status(name)?;
            match status.state {
                JobState::Done | JobState::Failed | JobState::Canceled => return Ok(status),
                JobState::Decomposing | JobState::Running => {}
            }
            if Instant::now() >= deadline {
                return Err(KinoError::InvalidConfig(format!(
                    "job '{name}' did not finish within {timeout:?}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Submit a job and drive it to a terminal state.
    pub async fn run_job(&self, job: Job, overwrite: bool, timeout: Duration) -> Result<JobStatus> {
        let name = job.name.clone();
        self.submit(job, overwrite).await?;
        self.wait(&name, timeout).await
    }
}
