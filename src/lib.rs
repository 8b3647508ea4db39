//! Training job dispatch: submit scripts, run them on a cluster worker pool,
//! and track each run from QUEUED to COMPLETED or FAILED.

pub mod blob;
pub mod bus;
pub mod cluster;
pub mod config;
pub mod daemon;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod report;
pub mod shutdown;
pub mod submit;
pub mod types;

pub use blob::{BlobStore, ObjectBlobStore};
pub use bus::{BusMessage, MemoryBus, MessageBus, MessageKind, RedisBus};
pub use cluster::{LocalLauncher, ResourcePool, SlurmLauncher, WorkerLauncher};
pub use config::{ClusterBackend, Settings};
pub use daemon::Daemon;
pub use db::{DatabaseConfig, MetadataStore, RunRecord, RunResult, RunStatus, ScriptRecord};
pub use dispatch::{Dispatcher, JobPayload};
pub use error::{DispatchError, Result, ValidationError};
pub use report::ResultReporter;
pub use submit::{ScriptSource, Submission, Submitter};
pub use types::{BlobKey, RunId, ScriptId, Tags};

use std::sync::Arc;

use config::{BlobSettings, BusSettings, ClusterSettings};

/// Connect to the metadata database and make sure its schema exists.
pub async fn connect_store(config: &DatabaseConfig) -> Result<MetadataStore> {
    let db = db::create_connection(config.clone()).await?;
    db::ensure_schema(&db).await?;
    Ok(MetadataStore::new(db))
}

pub fn build_blob_store(settings: &BlobSettings) -> Result<Arc<dyn BlobStore>> {
    Ok(Arc::new(ObjectBlobStore::from_settings(settings)?))
}

pub fn build_bus(settings: &BusSettings) -> Result<Arc<dyn MessageBus>> {
    if settings.is_memory() {
        return Ok(Arc::new(MemoryBus::new()));
    }
    Ok(Arc::new(RedisBus::new(settings)?))
}

pub fn build_launcher(settings: &ClusterSettings) -> Arc<dyn WorkerLauncher> {
    match settings.backend {
        ClusterBackend::Local => Arc::new(LocalLauncher),
        ClusterBackend::Slurm => Arc::new(SlurmLauncher),
    }
}
