use thiserror::Error;

use crate::db::RunStatus;
use crate::types::{RunId, ScriptId};

/// A local precondition of a submission did not hold. The submission is
/// aborted before anything is written.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("script not found locally or in the metadata store: {0}")]
    MissingScript(String),

    #[error("job config not found: {0}")]
    MissingJobConfig(String),

    #[error("model config not found: {0}")]
    MissingModelConfig(String),

    #[error("invalid job config: {0}")]
    InvalidJobConfig(String),

    #[error("invalid model config: {0}")]
    InvalidModelConfig(String),

    #[error("job parameter `{0}` is reserved and cannot be supplied")]
    ReservedParameter(String),

    #[error("invalid tag {0:?}: tags must be non-empty and must not contain ','")]
    InvalidTag(String),

    #[error("script {0} is not registered")]
    UnknownScript(ScriptId),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("malformed job payload: {0}")]
    MalformedJob(String),

    #[error("could not acquire cluster resources: {0}")]
    ResourceAcquisition(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("resource pool is closed")]
    PoolClosed,

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("database error: {0}")]
    Database(#[from] surrealdb::Error),

    #[error("blob store error: {0}")]
    Blob(#[from] object_store::Error),

    #[error("message bus error: {0}")]
    Bus(#[from] redis::RedisError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DispatchError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
