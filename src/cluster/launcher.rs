//! Adapters to whatever actually runs a worker process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ClusterSettings;
use crate::error::{DispatchError, Result};
use crate::types::RunId;

/// A rendered script body ready to hand to an interpreter.
#[derive(Debug, Clone)]
pub struct ScriptJob {
    pub run_id: RunId,
    pub body: String,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// One-line reason for a failed outcome, suitable for a log line.
    pub fn failure_reason(&self) -> String {
        let code = match self.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        };
        match self.stderr.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(last) => format!("{}: {}", code, last.trim()),
            None => code,
        }
    }
}

/// Starts, runs on, and releases workers of an external scheduler.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Verify the scheduler can serve `spec` and return the pool endpoint.
    async fn provision(&self, spec: &ClusterSettings) -> Result<String>;

    /// Run one script on a worker and wait for it to exit.
    async fn run(&self, spec: &ClusterSettings, job: &ScriptJob) -> Result<ExecutionOutcome>;

    /// Give back anything still held for `spec`.
    async fn release(&self, spec: &ClusterSettings) -> Result<()>;
}

/// Spawn `program`, feed `job.body` on stdin, and collect its output.
pub(crate) async fn run_process(program: &str, args: &[String], job: &ScriptJob) -> Result<ExecutionOutcome> {
    let started_at = Utc::now();

    let mut child = Command::new(program)
        .args(args)
        .envs(job.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| DispatchError::Execution(format!("failed to start {}: {}", program, e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        let body = job.body.clone().into_bytes();
        let run_id = job.run_id.clone();
        tokio::spawn(async move {
            // A script may exit before reading all of stdin.
            if let Err(e) = stdin.write_all(&body).await {
                debug!(run_id = %run_id, error = %e, "Interpreter closed stdin early");
            }
        });
    }

    let output = child.wait_with_output().await?;

    Ok(ExecutionOutcome {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        started_at,
        finished_at: Utc::now(),
    })
}

fn split_interpreter(spec: &ClusterSettings) -> Result<(&str, &[String])> {
    match spec.interpreter.split_first() {
        Some((program, args)) => Ok((program.as_str(), args)),
        None => Err(DispatchError::Config(
            "cluster.interpreter must name a program".to_string(),
        )),
    }
}

/// Runs scripts as child processes of the daemon.
#[derive(Debug, Default)]
pub struct LocalLauncher;

#[async_trait]
impl WorkerLauncher for LocalLauncher {
    async fn provision(&self, spec: &ClusterSettings) -> Result<String> {
        split_interpreter(spec).map_err(|e| DispatchError::ResourceAcquisition(e.to_string()))?;
        Ok(format!("local://{}", spec.worker_name))
    }

    async fn run(&self, spec: &ClusterSettings, job: &ScriptJob) -> Result<ExecutionOutcome> {
        let (program, args) = split_interpreter(spec)?;
        run_process(program, args, job).await
    }

    async fn release(&self, _spec: &ClusterSettings) -> Result<()> {
        Ok(())
    }
}

/// Runs each script as a one-task SLURM step through `srun`.
///
/// Allocations exist only while a script runs, so an idle pool holds no
/// nodes. `exclusive` is forwarded to the scheduler as-is.
#[derive(Debug, Default)]
pub struct SlurmLauncher;

impl SlurmLauncher {
    fn srun_args(spec: &ClusterSettings, run_id: &RunId) -> Vec<String> {
        let mut args = vec![
            format!("--partition={}", spec.partition),
            format!("--cpus-per-task={}", spec.cores_per_job),
            format!("--mem={}", spec.memory_per_job),
            format!("--job-name={}", spec.worker_name),
            format!("--comment=run:{}", run_id),
            "--ntasks=1".to_string(),
        ];
        if spec.exclusive {
            args.push("--exclusive".to_string());
        }
        args.extend(spec.interpreter.iter().cloned());
        args
    }
}

#[async_trait]
impl WorkerLauncher for SlurmLauncher {
    async fn provision(&self, spec: &ClusterSettings) -> Result<String> {
        split_interpreter(spec).map_err(|e| DispatchError::ResourceAcquisition(e.to_string()))?;

        let output = Command::new("sinfo")
            .arg("--noheader")
            .arg(format!("--partition={}", spec.partition))
            .arg("--format=%a")
            .output()
            .await
            .map_err(|e| DispatchError::ResourceAcquisition(format!("sinfo unavailable: {}", e)))?;

        if !output.status.success() {
            return Err(DispatchError::ResourceAcquisition(format!(
                "sinfo failed for partition {}: {}",
                spec.partition,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.lines().any(|state| state.trim() == "up") {
            return Err(DispatchError::ResourceAcquisition(format!(
                "partition {} is not available",
                spec.partition
            )));
        }

        info!(partition = %spec.partition, max_workers = spec.max_workers, "SLURM partition is up");
        Ok(format!("slurm://{}/{}", spec.partition, spec.worker_name))
    }

    async fn run(&self, spec: &ClusterSettings, job: &ScriptJob) -> Result<ExecutionOutcome> {
        let args = Self::srun_args(spec, &job.run_id);
        run_process("srun", &args, job).await
    }

    async fn release(&self, spec: &ClusterSettings) -> Result<()> {
        let status = Command::new("scancel")
            .arg(format!("--name={}", spec.worker_name))
            .arg(format!("--partition={}", spec.partition))
            .status()
            .await?;
        if !status.success() {
            warn!(worker = %spec.worker_name, "scancel reported a failure");
        }
        Ok(())
    }
}
