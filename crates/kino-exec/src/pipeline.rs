//! Three-stage bounded assembly line per worker pipeline instance.
//!
//! Load, evaluate, and save run on dedicated threads chained by bounded
//! channels, so load/decode for item *i+1* overlaps compute for item *i*
//! and persistence for item *i-1*. A full queue stalls the upstream stage;
//! together with the buffer pool's budget blocking this bounds total
//! in-flight memory per worker.
//!
//! Failures ride the same channels: a stage error turns the unit into a
//! failure completion that flows straight through to the completion queue,
//! so the whole work entry fails as one (no partial-item success) without
//! corrupting buffers of other in-flight entries.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use kino_common::{ItemId, JobId, KinoError, Result, TableId};
use kino_plan::WorkEntry;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::batch::ColumnBatch;
use crate::evaluate::EvaluateStage;
use crate::graph::GraphPlan;
use crate::load::LoadStage;
use crate::save::SaveStage;

/// Terminal state of one processed IO item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemOutcome {
    /// Every output column of the item's range was written.
    Completed,
    /// Processing aborted; no completion credit.
    Failed {
        /// Human-readable failure cause.
        message: String,
        /// Whether retry is pointless (for example an impossible buffer
        /// budget); the master fails the job without burning the budget.
        fatal: bool,
    },
}

/// Completion report for one IO item, sent to the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemCompletion {
    /// Owning job.
    pub job_id: JobId,
    /// Task ordinal within the job.
    pub task_index: usize,
    /// Output table of the item.
    pub table_id: TableId,
    /// Item ordinal within the table.
    pub item_id: ItemId,
    /// How processing ended.
    pub outcome: ItemOutcome,
}

/// One unit of pipeline input: a work entry plus its task's fixed graph
/// plan.
pub struct WorkUnit {
    /// The dispatched entry.
    pub entry: WorkEntry,
    /// Validated op graph shared by all items of the task.
    pub plan: Arc<GraphPlan>,
}

/// Pipeline sizing.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Depth of each inter-stage queue.
    pub queue_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { queue_depth: 2 }
    }
}

enum Evaluated {
    Ready {
        unit: WorkUnit,
        outputs: Vec<ColumnBatch>,
    },
    Failed {
        unit: WorkUnit,
        error: KinoError,
    },
}

enum Loaded {
    Ready {
        unit: WorkUnit,
        columns: Vec<ColumnBatch>,
    },
    Failed {
        unit: WorkUnit,
        error: KinoError,
    },
}

fn failure(entry: &WorkEntry, error: &KinoError) -> ItemCompletion {
    ItemCompletion {
        job_id: entry.job_id,
        task_index: entry.task_index,
        table_id: entry.item.table_id,
        item_id: entry.item.item_id,
        outcome: ItemOutcome::Failed {
            message: error.to_string(),
            fatal: !error.retryable(),
        },
    }
}

/// Handle to one running three-stage pipeline.
pub struct WorkerPipeline {
    entry_tx: Option<Sender<WorkUnit>>,
    completion_rx: Option<Receiver<ItemCompletion>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPipeline {
    /// Spawn the three stage threads.
    pub fn spawn(
        config: PipelineConfig,
        load: LoadStage,
        evaluate: EvaluateStage,
        save: SaveStage,
    ) -> Self {
        let depth = config.queue_depth.max(1);
        let (entry_tx, entry_rx) = bounded::<WorkUnit>(depth);
        let (loaded_tx, loaded_rx) = bounded::<Loaded>(depth);
        let (evaluated_tx, evaluated_rx) = bounded::<Evaluated>(depth);
        let (completion_tx, completion_rx) = bounded::<ItemCompletion>(depth * 3);

        let load_handle = std::thread::spawn(move || {
            for unit in entry_rx {
                let message = match load.load(&unit.entry) {
                    Ok(columns) => Loaded::Ready { unit, columns },
                    Err(error) => Loaded::Failed { unit, error },
                };
                if loaded_tx.send(message).is_err() {
                    break;
                }
            }
        });

        let eval_handle = std::thread::spawn(move || {
            for message in loaded_rx {
                let out = match message {
                    Loaded::Ready { unit, columns } => {
                        match evaluate.evaluate(&unit.plan, &unit.entry, columns) {
                            Ok(outputs) => Evaluated::Ready { unit, outputs },
                            Err(error) => Evaluated::Failed { unit, error },
                        }
                    }
                    Loaded::Failed { unit, error } => Evaluated::Failed { unit, error },
                };
                if evaluated_tx.send(out).is_err() {
                    break;
                }
            }
        });

        let save_handle = std::thread::spawn(move || {
            for message in evaluated_rx {
                let completion = match message {
                    Evaluated::Ready { unit, outputs } => {
                        match save.save(&unit.entry, outputs) {
                            Ok(()) => {
                                info!(
                                    job = %unit.entry.job_id,
                                    item = %unit.entry.item.item_id,
                                    "item completed"
                                );
                                ItemCompletion {
                                    job_id: unit.entry.job_id,
                                    task_index: unit.entry.task_index,
                                    table_id: unit.entry.item.table_id,
                                    item_id: unit.entry.item.item_id,
                                    outcome: ItemOutcome::Completed,
                                }
                            }
                            Err(error) => {
                                error!(
                                    job = %unit.entry.job_id,
                                    item = %unit.entry.item.item_id,
                                    error = %error,
                                    "save failed"
                                );
                                failure(&unit.entry, &error)
                            }
                        }
                    }
                    Evaluated::Failed { unit, error } => {
                        error!(
                            job = %unit.entry.job_id,
                            item = %unit.entry.item.item_id,
                            error = %error,
                            "item failed"
                        );
                        failure(&unit.entry, &error)
                    }
                };
                if completion_tx.send(completion).is_err() {
                    break;
                }
            }
        });

        Self {
            entry_tx: Some(entry_tx),
            completion_rx: Some(completion_rx),
            handles: vec![load_handle, eval_handle, save_handle],
        }
    }

    /// Submit one unit; blocks while the load queue is full.
    pub fn submit(&self, unit: WorkUnit) -> Result<()> {
        let tx = self
            .entry_tx
            .as_ref()
            .ok_or_else(|| KinoError::InvalidConfig("pipeline is shut down".to_string()))?;
        tx.send(unit)
            .map_err(|_| KinoError::InvalidConfig("pipeline stage exited".to_string()))
    }

    /// Completion reports in save order.
    #[must_use]
    pub fn completions(&self) -> &Receiver<ItemCompletion> {
        self.completion_rx
            .as_ref()
            .expect("completion channel lives as long as the pipeline")
    }

    /// Stop accepting work and join the stage threads; completions not
    /// yet read are discarded.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for WorkerPipeline {
    fn drop(&mut self) {
        self.entry_tx.take();
        // Dropping the receiver first lets a save thread blocked on a full
        // completion queue observe disconnection instead of deadlocking
        // the join below.
        self.completion_rx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
