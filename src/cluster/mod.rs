//! Elastic worker pool in front of an external scheduler.
//!
//! The pool is acquired once at daemon startup and shared by every job.
//! Concurrency is capped at `max_workers` leases; a job holds one lease from
//! the moment it starts executing until its task graph finishes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ClusterSettings;
use crate::dispatch::graph::{GraphContext, TaskGraph};
use crate::error::{DispatchError, Result};
use crate::types::RunId;

pub mod launcher;

pub use launcher::{ExecutionOutcome, LocalLauncher, ScriptJob, SlurmLauncher, WorkerLauncher};

/// Observable state of a launched task graph.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded(ExecutionOutcome),
    Failed(String),
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_))
    }
}

/// Handle to one task graph running on the pool.
pub struct TaskHandle {
    run_id: RunId,
    state: watch::Receiver<TaskState>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Snapshot of the task state. Never blocks.
    pub fn state(&self) -> TaskState {
        let finished = self.join.is_finished();
        let state = self.state.borrow().clone();
        if finished && !state.is_finished() {
            return TaskState::Failed("task ended without reporting a result".to_string());
        }
        state
    }
}

/// Claim on one worker slot. Released on drop.
pub struct WorkerLease {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ResourcePool {
    spec: ClusterSettings,
    address: String,
    launcher: Arc<dyn WorkerLauncher>,
    slots: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl ResourcePool {
    /// Acquire a pool from the external scheduler.
    ///
    /// Fails with `ResourceAcquisition` if the scheduler cannot serve the
    /// spec. There is no degraded mode.
    pub async fn acquire(spec: ClusterSettings, launcher: Arc<dyn WorkerLauncher>) -> Result<Self> {
        if spec.max_workers == 0 {
            return Err(DispatchError::ResourceAcquisition(
                "max_workers must be at least 1".to_string(),
            ));
        }

        let address = launcher.provision(&spec).await.map_err(|e| match e {
            DispatchError::ResourceAcquisition(_) => e,
            other => DispatchError::ResourceAcquisition(other.to_string()),
        })?;

        info!(
            address = %address,
            partition = %spec.partition,
            cores_per_job = spec.cores_per_job,
            memory_per_job = %spec.memory_per_job,
            exclusive = spec.exclusive,
            max_workers = spec.max_workers,
            "Resource pool acquired"
        );

        Ok(Self {
            slots: Arc::new(Semaphore::new(spec.max_workers)),
            spec,
            address,
            launcher,
            active: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Stable endpoint of the pool.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait for a free worker slot.
    pub async fn lease(&self) -> Result<WorkerLease> {
        if self.is_closed() {
            return Err(DispatchError::PoolClosed);
        }

        let permit = tokio::select! {
            permit = self.slots.clone().acquire_owned() => {
                permit.map_err(|_| DispatchError::PoolClosed)?
            }
            _ = self.shutdown.cancelled() => return Err(DispatchError::PoolClosed),
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(WorkerLease {
            _permit: permit,
            active: self.active.clone(),
        })
    }

    /// Start `graph` on the worker held by `lease` and return immediately.
    pub fn launch(&self, lease: WorkerLease, graph: TaskGraph, ctx: Arc<GraphContext>) -> TaskHandle {
        let run_id = graph.run_id().clone();
        let (tx, rx) = watch::channel(TaskState::Pending);
        let launcher = self.launcher.clone();
        let spec = self.spec.clone();
        let shutdown = self.shutdown.clone();

        let join = tokio::spawn(async move {
            let _lease = lease;
            let _ = tx.send(TaskState::Running);

            let state = tokio::select! {
                res = graph.execute(&ctx, launcher.as_ref(), &spec) => match res {
                    Ok(outcome) if outcome.success() => TaskState::Succeeded(outcome),
                    Ok(outcome) => TaskState::Failed(outcome.failure_reason()),
                    Err(e) => TaskState::Failed(e.to_string()),
                },
                _ = shutdown.cancelled() => {
                    TaskState::Failed("resource pool closed while the task was running".to_string())
                }
            };
            let _ = tx.send(state);
        });

        debug!(run_id = %run_id, "Task graph launched");
        TaskHandle {
            run_id,
            state: rx,
            join,
        }
    }

    /// Release every resource held by the pool.
    ///
    /// Running tasks are cancelled. Only the first call does anything.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            warn!(address = %self.address, "Resource pool already closed");
            return Ok(());
        }

        self.shutdown.cancel();
        self.slots.close();
        self.launcher.release(&self.spec).await?;
        info!(address = %self.address, "Resource pool released");
        Ok(())
    }
}

impl Drop for ResourcePool {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!(address = %self.address, "Resource pool dropped without close(), cluster allocations may leak");
        }
    }
}
