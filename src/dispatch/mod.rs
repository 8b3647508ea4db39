//! Job dispatcher: turns bus messages into task graphs on the resource pool
//! and drives each run's status from QUEUED to a terminal state.
//!
//! Message handling never waits on a job. Each accepted message gets its
//! own tracker task that leases a worker, marks the run RUNNING, launches
//! the graph and then polls it at a fixed interval until it finishes.

use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::bus::BusMessage;
use crate::cluster::{ExecutionOutcome, ResourcePool, TaskState};
use crate::db::{MetadataStore, RunStatus};
use crate::error::{DispatchError, Result};
use crate::types::RunId;

pub mod graph;
pub mod payload;
pub mod template;

#[cfg(test)]
mod integration_tests;

pub use graph::{GraphContext, TaskGraph, TaskNode, RUN_ID_ENV};
pub use payload::{JobConfig, JobPayload};
pub use template::{Bindings, TemplateEngine};

pub struct Dispatcher {
    store: MetadataStore,
    pool: Arc<ResourcePool>,
    ctx: Arc<GraphContext>,
    poll_interval: Duration,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        store: MetadataStore,
        pool: Arc<ResourcePool>,
        ctx: Arc<GraphContext>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            ctx,
            poll_interval,
            tracker: TaskTracker::new(),
        }
    }

    /// Accept one bus message.
    ///
    /// Returns the run id of a dispatched job, `None` for control traffic,
    /// or `MalformedJob` for a payload that should be dropped.
    pub fn handle_message(&self, msg: BusMessage) -> Result<Option<RunId>> {
        if !msg.kind.carries_payload() {
            debug!(channel = %msg.channel, kind = ?msg.kind, "Ignoring control message");
            return Ok(None);
        }
        debug!(channel = %msg.channel, bytes = msg.data.len(), "Received job message");

        let payload = JobPayload::parse(&msg.data)?;
        let run_id = payload.job_config.run_id.clone();
        let graph = TaskGraph::for_job(payload);

        let job = JobTracker {
            store: self.store.clone(),
            pool: self.pool.clone(),
            ctx: self.ctx.clone(),
            poll_interval: self.poll_interval,
        };
        self.tracker.spawn(job.run(graph));

        Ok(Some(run_id))
    }

    /// Consume `messages` until the stream ends or `shutdown` fires.
    pub async fn run(&self, mut messages: BoxStream<'static, BusMessage>, shutdown: CancellationToken) {
        info!(address = %self.pool.address(), "Dispatcher listening");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Dispatcher stopping");
                    break;
                }
                next = messages.next() => {
                    let Some(msg) = next else {
                        warn!("Subscription closed, dispatcher stopping");
                        break;
                    };
                    match self.handle_message(msg) {
                        Ok(Some(run_id)) => debug!(run_id = %run_id, "Job dispatched"),
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "Dropping job message"),
                    }
                }
            }
        }
    }

    /// Number of jobs whose tracker has not finished yet.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting new trackers and wait for running ones.
    ///
    /// Returns `false` if some were still running after `timeout`.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok()
    }
}

/// Completion tracking for one job.
struct JobTracker {
    store: MetadataStore,
    pool: Arc<ResourcePool>,
    ctx: Arc<GraphContext>,
    poll_interval: Duration,
}

impl JobTracker {
    async fn run(self, graph: TaskGraph) {
        let run_id = graph.run_id().clone();

        let lease = match self.pool.lease().await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Job never started, run stays QUEUED");
                return;
            }
        };

        if let Err(e) = self.store.update_run_status(&run_id, RunStatus::Running).await {
            error!(run_id = %run_id, error = %e, "Cannot mark run RUNNING, job dropped");
            return;
        }
        info!(run_id = %run_id, address = %self.pool.address(), "Run started");

        let handle = self.pool.launch(lease, graph, self.ctx.clone());

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let state = loop {
            ticker.tick().await;
            let state = handle.state();
            if state.is_finished() {
                break state;
            }
        };

        match state {
            TaskState::Succeeded(outcome) => {
                let elapsed = (outcome.finished_at - outcome.started_at).num_milliseconds();
                info!(run_id = %run_id, elapsed_ms = elapsed, "Job finished successfully");
                log_script_output(&run_id, &outcome);
                match self.store.update_run_status(&run_id, RunStatus::Completed).await {
                    Ok(_) => {}
                    Err(DispatchError::InvalidTransition {
                        from: RunStatus::Completed,
                        ..
                    }) => debug!(run_id = %run_id, "Run already reported its results"),
                    Err(e) => warn!(run_id = %run_id, error = %e, "Cannot mark run COMPLETED"),
                }
            }
            TaskState::Failed(reason) => {
                error!(run_id = %run_id, reason = %reason, "Job failed");
                if let Err(e) = self.store.update_run_status(&run_id, RunStatus::Failed).await {
                    warn!(run_id = %run_id, error = %e, "Cannot mark run FAILED");
                }
            }
            other => warn!(run_id = %run_id, state = ?other, "Tracker stopped on a non-terminal state"),
        }
    }
}

fn log_script_output(run_id: &RunId, outcome: &ExecutionOutcome) {
    debug!(
        run_id = %run_id,
        stdout = %outcome.stdout.trim_end(),
        stderr = %outcome.stderr.trim_end(),
        "Script output"
    );
}
