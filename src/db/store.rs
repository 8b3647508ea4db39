//! Metadata store for runs and scripts.
//!
//! This is the only writer of run records. The submitter, the dispatcher
//! and executed scripts (through result reporting) all go through it. Every
//! status change is a single conditional UPDATE, so concurrent trackers can
//! share one store without ever moving a run backwards.

use crate::db::schema::{RunRecord, RunResult, RunStatus, ScriptRecord};
use crate::db::Db;
use crate::error::{DispatchError, Result, ValidationError};
use crate::types::{BlobKey, RunId, ScriptId};

/// Shared handle to the metadata database. Cheap to clone.
#[derive(Clone)]
pub struct MetadataStore {
    db: Db,
}

impl MetadataStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Register a freshly submitted run in QUEUED state.
    pub async fn create_queued_run(&self, run_id: &RunId, script_key: &ScriptId) -> Result<RunRecord> {
        let mut res = self
            .db
            .query(
                r#"
                CREATE type::thing('run', $run_id) CONTENT {
                    run_id: $run_id,
                    script_key: $script_key,
                    status: 'QUEUED'
                }
                "#,
            )
            .bind(("run_id", run_id.to_string()))
            .bind(("script_key", script_key.to_string()))
            .await?;

        let created: Option<RunRecord> = res.take(0)?;
        created.ok_or_else(|| DispatchError::Execution(format!("failed to create run {}", run_id)))
    }

    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM type::thing('run', $run_id)")
            .bind(("run_id", run_id.to_string()))
            .await?;

        let run: Option<RunRecord> = res.take(0)?;
        Ok(run)
    }

    pub async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM run ORDER BY created_at ASC")
            .await?;

        let runs: Vec<RunRecord> = res.take(0)?;
        Ok(runs)
    }

    /// Delete a run, returning the record as it was.
    pub async fn delete_run(&self, run_id: &RunId) -> Result<RunRecord> {
        let mut res = self
            .db
            .query("DELETE type::thing('run', $run_id) RETURN BEFORE")
            .bind(("run_id", run_id.to_string()))
            .await?;

        let deleted: Option<RunRecord> = res.take(0)?;
        deleted.ok_or_else(|| DispatchError::not_found("run", run_id.as_str()))
    }

    /// Write a full run record.
    ///
    /// Creates the run if it does not exist; a new run must be QUEUED and
    /// name a registered script. For an existing run the status must be
    /// unchanged or a forward transition.
    pub async fn upsert_run(&self, record: &RunRecord) -> Result<RunRecord> {
        let existing = self.get_run(&record.run_id).await?;

        let statement = match &existing {
            None => {
                if record.status != RunStatus::Queued {
                    return Err(DispatchError::InvalidTransition {
                        run_id: record.run_id.clone(),
                        from: RunStatus::Queued,
                        to: record.status,
                    });
                }
                if let Some(script_key) = &record.script_key {
                    if self.get_script(script_key).await?.is_none() {
                        return Err(ValidationError::UnknownScript(script_key.clone()).into());
                    }
                }
                r#"
                CREATE type::thing('run', $run_id) SET
                    run_id = $run_id,
                    script_key = $script_key,
                    status = $status,
                    train_config = $train_config,
                    model_config = $model_config,
                    train_score = $train_score,
                    validation_score = $validation_score,
                    weights_path = $weights_path,
                    tags = $tags
                "#
            }
            Some(current) => {
                if current.status != record.status && !current.status.can_transition_to(record.status) {
                    return Err(DispatchError::InvalidTransition {
                        run_id: record.run_id.clone(),
                        from: current.status,
                        to: record.status,
                    });
                }
                r#"
                UPDATE type::thing('run', $run_id) SET
                    script_key = $script_key,
                    status = $status,
                    train_config = $train_config,
                    model_config = $model_config,
                    train_score = $train_score,
                    validation_score = $validation_score,
                    weights_path = $weights_path,
                    tags = $tags
                WHERE status INSIDE $allowed
                RETURN AFTER
                "#
            }
        };

        let mut allowed: Vec<&'static str> = record
            .status
            .predecessors()
            .iter()
            .map(RunStatus::as_str)
            .collect();
        allowed.push(record.status.as_str());

        let mut res = self
            .db
            .query(statement)
            .bind(("run_id", record.run_id.to_string()))
            .bind(("script_key", record.script_key.as_ref().map(ToString::to_string)))
            .bind(("status", record.status.as_str()))
            .bind(("train_config", record.train_config.clone()))
            .bind(("model_config", record.model_config.clone()))
            .bind(("train_score", record.train_score))
            .bind(("validation_score", record.validation_score))
            .bind(("weights_path", record.weights_path.as_ref().map(ToString::to_string)))
            .bind(("tags", record.tags.clone()))
            .bind(("allowed", allowed))
            .await?;

        let written: Option<RunRecord> = res.take(0)?;
        match written {
            Some(run) => Ok(run),
            None => Err(self.rejected(&record.run_id, record.status).await),
        }
    }

    /// Move a run to `status` without touching any other field.
    ///
    /// Fails with `NotFound` if the run does not exist and with
    /// `InvalidTransition` if the run is not in a valid predecessor state.
    pub async fn update_run_status(&self, run_id: &RunId, status: RunStatus) -> Result<RunRecord> {
        let from: Vec<&'static str> = status.predecessors().iter().map(RunStatus::as_str).collect();
        if from.is_empty() {
            return Err(self.rejected(run_id, status).await);
        }

        let mut res = self
            .db
            .query(
                r#"
                UPDATE type::thing('run', $run_id)
                SET status = $status
                WHERE status INSIDE $from
                RETURN AFTER
                "#,
            )
            .bind(("run_id", run_id.to_string()))
            .bind(("status", status.as_str()))
            .bind(("from", from))
            .await?;

        let updated: Option<RunRecord> = res.take(0)?;
        match updated {
            Some(run) => Ok(run),
            None => Err(self.rejected(run_id, status).await),
        }
    }

    /// Record the results an executed script reports for its own run and
    /// mark it COMPLETED. Only a RUNNING run accepts results.
    pub async fn report_result(&self, run_id: &RunId, result: &RunResult) -> Result<RunRecord> {
        let train_config = result.train_config.as_ref().map(serde_json::to_string).transpose()?;
        let model_config = result.model_config.as_ref().map(serde_json::to_string).transpose()?;

        let mut res = self
            .db
            .query(
                r#"
                UPDATE type::thing('run', $run_id) SET
                    status = 'COMPLETED',
                    train_score = $train_score,
                    validation_score = $validation_score,
                    weights_path = $weights_path,
                    train_config = $train_config,
                    model_config = $model_config,
                    tags = $tags
                WHERE status = 'RUNNING'
                RETURN AFTER
                "#,
            )
            .bind(("run_id", run_id.to_string()))
            .bind(("train_score", result.train_score))
            .bind(("validation_score", result.validation_score))
            .bind(("weights_path", result.weights_path.as_ref().map(ToString::to_string)))
            .bind(("train_config", train_config))
            .bind(("model_config", model_config))
            .bind(("tags", result.tags.join()))
            .await?;

        let updated: Option<RunRecord> = res.take(0)?;
        match updated {
            Some(run) => Ok(run),
            None => Err(self.rejected(run_id, RunStatus::Completed).await),
        }
    }

    /// Explain why a conditional write matched nothing.
    async fn rejected(&self, run_id: &RunId, to: RunStatus) -> DispatchError {
        match self.get_run(run_id).await {
            Ok(Some(current)) => DispatchError::InvalidTransition {
                run_id: run_id.clone(),
                from: current.status,
                to,
            },
            Ok(None) => DispatchError::not_found("run", run_id.as_str()),
            Err(e) => e,
        }
    }

    // ------------------------------------------------------------------
    // Scripts
    // ------------------------------------------------------------------

    pub async fn add_script(
        &self,
        script_id: &ScriptId,
        script_path: &BlobKey,
        file_name: &str,
        checksum: Option<String>,
    ) -> Result<ScriptRecord> {
        let mut res = self
            .db
            .query(
                r#"
                CREATE type::thing('script', $script_id) CONTENT {
                    script_id: $script_id,
                    script_path: $script_path,
                    file_name: $file_name,
                    checksum: $checksum
                }
                "#,
            )
            .bind(("script_id", script_id.to_string()))
            .bind(("script_path", script_path.to_string()))
            .bind(("file_name", file_name.to_string()))
            .bind(("checksum", checksum))
            .await?;

        let created: Option<ScriptRecord> = res.take(0)?;
        created.ok_or_else(|| DispatchError::Execution(format!("failed to create script {}", script_id)))
    }

    pub async fn get_script(&self, script_id: &ScriptId) -> Result<Option<ScriptRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM type::thing('script', $script_id)")
            .bind(("script_id", script_id.to_string()))
            .await?;

        let script: Option<ScriptRecord> = res.take(0)?;
        Ok(script)
    }

    pub async fn list_scripts(&self) -> Result<Vec<ScriptRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM script ORDER BY created_at ASC")
            .await?;

        let scripts: Vec<ScriptRecord> = res.take(0)?;
        Ok(scripts)
    }

    /// Like [`get_script`](Self::get_script), but a missing script is `NotFound`.
    pub async fn resolve_script(&self, script_id: &ScriptId) -> Result<ScriptRecord> {
        self.get_script(script_id)
            .await?
            .ok_or_else(|| DispatchError::not_found("script", script_id.as_str()))
    }
}
