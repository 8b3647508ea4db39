//! Job submission: upload the script, register a QUEUED run, publish.
//!
//! Everything that can be checked locally is checked before the first
//! write. After that each step either succeeds or aborts the submission
//! with whatever was already written left in place.

use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::blob::{checksum, BlobStore};
use crate::bus::MessageBus;
use crate::db::MetadataStore;
use crate::dispatch::template::RESERVED_BINDINGS;
use crate::dispatch::{JobConfig, JobPayload};
use crate::error::{Result, ValidationError};
use crate::types::{BlobKey, RunId, ScriptId};

/// Keys the submitter fills in itself.
const SUBMITTER_KEYS: [&str; 2] = ["run_id", "script_key"];

/// Where the script of a submission comes from.
#[derive(Debug, Clone)]
pub enum ScriptSource {
    /// A new script body, uploaded under a fresh script id.
    Upload { file_name: String, body: Vec<u8> },
    /// A script uploaded by an earlier submission.
    Stored(ScriptId),
}

/// A fully loaded submission, ready for [`Submitter::submit`].
#[derive(Debug, Clone)]
pub struct Submission {
    pub script: ScriptSource,
    pub job_config: Value,
    pub model_config: Value,
}

impl Submission {
    /// Load a submission from CLI arguments.
    ///
    /// A script path that does not exist locally is tried as the id of an
    /// already uploaded script.
    pub async fn from_paths(
        script: &Path,
        job_config: &Path,
        model_config: &Path,
        store: &MetadataStore,
    ) -> Result<Self> {
        let script = if script.is_file() {
            let file_name = script
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| ValidationError::MissingScript(script.display().to_string()))?;
            ScriptSource::Upload {
                file_name,
                body: tokio::fs::read(script).await?,
            }
        } else {
            let id = ScriptId::new(script.to_string_lossy());
            if store.get_script(&id).await?.is_none() {
                return Err(ValidationError::MissingScript(script.display().to_string()).into());
            }
            ScriptSource::Stored(id)
        };

        if !job_config.is_file() {
            return Err(ValidationError::MissingJobConfig(job_config.display().to_string()).into());
        }
        if !model_config.is_file() {
            return Err(ValidationError::MissingModelConfig(model_config.display().to_string()).into());
        }

        let job_config: Value = serde_json::from_slice(&tokio::fs::read(job_config).await?)
            .map_err(|e| ValidationError::InvalidJobConfig(e.to_string()))?;
        let model_config: Value = serde_json::from_slice(&tokio::fs::read(model_config).await?)
            .map_err(|e| ValidationError::InvalidModelConfig(e.to_string()))?;

        Ok(Self {
            script,
            job_config,
            model_config,
        })
    }
}

/// Turn a user job config into the `params` of a job.
///
/// Accepts `{"params": {...}}` or a flat object of parameters.
pub fn normalize_job_config(job_config: Value) -> std::result::Result<Map<String, Value>, ValidationError> {
    let Value::Object(mut obj) = job_config else {
        return Err(ValidationError::InvalidJobConfig(
            "job config must be a JSON object".to_string(),
        ));
    };

    for key in SUBMITTER_KEYS {
        if obj.contains_key(key) {
            return Err(ValidationError::ReservedParameter(key.to_string()));
        }
    }

    let params = match obj.remove("params") {
        None => obj,
        Some(Value::Object(params)) => {
            if let Some(extra) = obj.keys().next() {
                return Err(ValidationError::InvalidJobConfig(format!(
                    "unexpected key `{}` next to `params`",
                    extra
                )));
            }
            params
        }
        Some(_) => {
            return Err(ValidationError::InvalidJobConfig(
                "`params` must be a JSON object".to_string(),
            ));
        }
    };

    for key in RESERVED_BINDINGS {
        if params.contains_key(key) {
            return Err(ValidationError::ReservedParameter(key.to_string()));
        }
    }

    Ok(params)
}

pub struct Submitter {
    store: MetadataStore,
    blobs: Arc<dyn BlobStore>,
    bus: Arc<dyn MessageBus>,
    channel: String,
}

impl Submitter {
    pub fn new(
        store: MetadataStore,
        blobs: Arc<dyn BlobStore>,
        bus: Arc<dyn MessageBus>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            store,
            blobs,
            bus,
            channel: channel.into(),
        }
    }

    /// Submit a job and return its fresh run id.
    pub async fn submit(&self, script: ScriptSource, job_config: Value, model_config: Value) -> Result<RunId> {
        let params = normalize_job_config(job_config)?;

        let script_key = match script {
            ScriptSource::Stored(id) => {
                if self.store.get_script(&id).await?.is_none() {
                    return Err(ValidationError::UnknownScript(id).into());
                }
                id
            }
            ScriptSource::Upload { file_name, body } => {
                let id = ScriptId::generate();
                let key = BlobKey::for_script(&id, &file_name);
                let sum = checksum(&body);
                self.blobs.put(&key, body).await?;
                self.store.add_script(&id, &key, &file_name, Some(sum)).await?;
                info!(script_id = %id, key = %key, "Script uploaded");
                id
            }
        };

        let run_id = RunId::generate();
        self.store.create_queued_run(&run_id, &script_key).await?;

        let payload = JobPayload {
            job_config: JobConfig {
                run_id: run_id.clone(),
                script_key,
                params,
            },
            model_config,
        };
        self.bus.publish(&self.channel, &payload.to_json()?).await?;
        info!(run_id = %run_id, channel = %self.channel, "Job submitted");

        Ok(run_id)
    }

    /// Submit a job loaded with [`Submission::from_paths`].
    pub async fn submit_loaded(&self, submission: Submission) -> Result<RunId> {
        self.submit(submission.script, submission.job_config, submission.model_config)
            .await
    }
}
