//! The per-job task graph: fetch the script, render it, run it.
//!
//! Steps run strictly in order and each consumes the artifact of the one
//! before. Running the rendered body is an explicit capability of the
//! graph; it executes whatever the submitter uploaded.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::payload::{JobConfig, JobPayload};
use super::template::{Bindings, TemplateEngine};
use crate::blob::{checksum, BlobStore};
use crate::cluster::{ExecutionOutcome, ScriptJob, WorkerLauncher};
use crate::config::ClusterSettings;
use crate::db::MetadataStore;
use crate::error::{DispatchError, Result};
use crate::types::{RunId, ScriptId};

/// Environment variable through which a running script learns its run id.
pub const RUN_ID_ENV: &str = "TRAIN_DISPATCH_RUN_ID";

/// Collaborators shared by every task graph.
pub struct GraphContext {
    pub store: MetadataStore,
    pub blobs: Arc<dyn BlobStore>,
    pub templates: TemplateEngine,
    /// Extra environment passed to every script.
    pub env: Vec<(String, String)>,
}

impl GraphContext {
    pub fn new(store: MetadataStore, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            blobs,
            templates: TemplateEngine::new(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub enum TaskNode {
    FetchScript { script_key: ScriptId },
    RenderTemplate { job: JobConfig, model_config: Value },
    RunScript,
}

impl TaskNode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FetchScript { .. } => "fetch-script",
            Self::RenderTemplate { .. } => "render-template",
            Self::RunScript => "run-script",
        }
    }
}

/// Output of a step, input of the next.
enum Artifact {
    Empty,
    Source(String),
    Rendered(String),
    Finished(ExecutionOutcome),
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Empty => "nothing",
            Self::Source(_) => "a script source",
            Self::Rendered(_) => "a rendered script",
            Self::Finished(_) => "a finished execution",
        })
    }
}

#[derive(Debug, Clone)]
pub struct TaskGraph {
    run_id: RunId,
    nodes: Vec<TaskNode>,
}

impl TaskGraph {
    pub fn for_job(payload: JobPayload) -> Self {
        let JobPayload {
            job_config,
            model_config,
        } = payload;

        Self {
            run_id: job_config.run_id.clone(),
            nodes: vec![
                TaskNode::FetchScript {
                    script_key: job_config.script_key.clone(),
                },
                TaskNode::RenderTemplate {
                    job: job_config,
                    model_config,
                },
                TaskNode::RunScript,
            ],
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    /// Run every step in order on a worker from `launcher`.
    pub async fn execute(
        &self,
        ctx: &GraphContext,
        launcher: &dyn WorkerLauncher,
        spec: &ClusterSettings,
    ) -> Result<ExecutionOutcome> {
        let mut artifact = Artifact::Empty;
        for node in &self.nodes {
            debug!(run_id = %self.run_id, step = node.name(), "Running task graph step");
            artifact = self.step(node, artifact, ctx, launcher, spec).await?;
        }

        match artifact {
            Artifact::Finished(outcome) => Ok(outcome),
            other => Err(DispatchError::Execution(format!(
                "task graph ended with {} instead of an execution",
                other
            ))),
        }
    }

    async fn step(
        &self,
        node: &TaskNode,
        input: Artifact,
        ctx: &GraphContext,
        launcher: &dyn WorkerLauncher,
        spec: &ClusterSettings,
    ) -> Result<Artifact> {
        match (node, input) {
            (TaskNode::FetchScript { script_key }, Artifact::Empty) => {
                fetch_script(ctx, script_key).await.map(Artifact::Source)
            }
            (TaskNode::RenderTemplate { job, model_config }, Artifact::Source(source)) => {
                let bindings = Bindings::for_job(job, model_config)?;
                ctx.templates.render(&source, &bindings).map(Artifact::Rendered)
            }
            (TaskNode::RunScript, Artifact::Rendered(body)) => {
                let mut env = ctx.env.clone();
                env.push((RUN_ID_ENV.to_string(), self.run_id.to_string()));
                let job = ScriptJob {
                    run_id: self.run_id.clone(),
                    body,
                    env,
                };
                launcher.run(spec, &job).await.map(Artifact::Finished)
            }
            (node, input) => Err(DispatchError::Execution(format!(
                "step {} cannot take {}",
                node.name(),
                input
            ))),
        }
    }
}

async fn fetch_script(ctx: &GraphContext, script_key: &ScriptId) -> Result<String> {
    let record = ctx.store.resolve_script(script_key).await?;

    let body = ctx.blobs.get(&record.script_path).await?;

    if let Some(expected) = &record.checksum {
        let actual = checksum(&body);
        if &actual != expected {
            return Err(DispatchError::Execution(format!(
                "checksum mismatch for script {}: expected {}, got {}",
                script_key, expected, actual
            )));
        }
    }

    String::from_utf8(body)
        .map_err(|_| DispatchError::Execution(format!("script {} is not valid UTF-8", script_key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::ObjectBlobStore;
    use crate::cluster::LocalLauncher;
    use crate::db::{create_connection, ensure_schema, DatabaseConfig};
    use crate::types::BlobKey;
    use serde_json::json;

    async fn setup_context() -> GraphContext {
        let db = create_connection(DatabaseConfig {
            url: "memory".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        ensure_schema(&db).await.unwrap();
        GraphContext::new(MetadataStore::new(db), Arc::new(ObjectBlobStore::in_memory("test")))
    }

    async fn upload(ctx: &GraphContext, body: &str, recorded_checksum: Option<String>) -> ScriptId {
        let id = ScriptId::generate();
        let key = BlobKey::for_script(&id, "job.sh");
        ctx.blobs.put(&key, body.as_bytes().to_vec()).await.unwrap();
        ctx.store.add_script(&id, &key, "job.sh", recorded_checksum).await.unwrap();
        id
    }

    fn payload(script_key: &ScriptId, params: Value) -> JobPayload {
        JobPayload {
            job_config: JobConfig {
                run_id: RunId::new("r1"),
                script_key: script_key.clone(),
                params: params.as_object().cloned().unwrap_or_default(),
            },
            model_config: json!({}),
        }
    }

    fn sh() -> ClusterSettings {
        ClusterSettings {
            interpreter: vec!["sh".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_graph_has_three_ordered_steps() {
        let graph = TaskGraph::for_job(payload(&ScriptId::new("s"), json!({})));
        let names: Vec<_> = graph.nodes().iter().map(TaskNode::name).collect();
        assert_eq!(names, ["fetch-script", "render-template", "run-script"]);
        assert_eq!(graph.run_id(), &RunId::new("r1"));
    }

    #[tokio::test]
    async fn test_execute_renders_and_runs() {
        let ctx = setup_context().await;
        let body = "echo \"greeting={{ greeting }} run=$TRAIN_DISPATCH_RUN_ID\"";
        let id = upload(&ctx, body, Some(checksum(body.as_bytes()))).await;

        let graph = TaskGraph::for_job(payload(&id, json!({"greeting": "hi"})));
        let outcome = graph.execute(&ctx, &LocalLauncher, &sh()).await.unwrap();

        assert!(outcome.success());
        assert_eq!(outcome.stdout.trim(), "greeting=hi run=r1");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails() {
        let ctx = setup_context().await;
        let id = upload(&ctx, "echo hi", Some(checksum(b"something else"))).await;

        let graph = TaskGraph::for_job(payload(&id, json!({})));
        let err = graph.execute(&ctx, &LocalLauncher, &sh()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Execution(ref m) if m.contains("checksum")));
    }

    #[tokio::test]
    async fn test_unknown_script_is_not_found() {
        let ctx = setup_context().await;
        let graph = TaskGraph::for_job(payload(&ScriptId::new("missing"), json!({})));
        let err = graph.execute(&ctx, &LocalLauncher, &sh()).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
