//! Result reporting for executed scripts.
//!
//! A script learns its run id from `TRAIN_DISPATCH_RUN_ID` and reports its
//! own scores and weights. Reporting is what moves a run to COMPLETED with
//! results; the dispatcher only records that the process exited cleanly.

use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::blob::BlobStore;
use crate::db::{MetadataStore, RunRecord, RunResult};
use crate::error::{DispatchError, Result};
use crate::types::{BlobKey, RunId};

pub struct ResultReporter {
    store: MetadataStore,
    blobs: Arc<dyn BlobStore>,
}

impl ResultReporter {
    pub fn new(store: MetadataStore, blobs: Arc<dyn BlobStore>) -> Self {
        Self { store, blobs }
    }

    /// Upload a local weights file for `run_id` and return its key.
    pub async fn upload_weights(&self, run_id: &RunId, path: &Path) -> Result<BlobKey> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| DispatchError::not_found("weights file", path.display().to_string()))?;
        if !path.is_file() {
            return Err(DispatchError::not_found("weights file", path.display().to_string()));
        }

        let key = BlobKey::for_weights(run_id, &file_name);
        self.blobs.put_file(&key, path).await?;
        Ok(key)
    }

    /// Fetch the weights a run reported, together with its record.
    pub async fn download_weights(&self, run_id: &RunId) -> Result<(RunRecord, Vec<u8>)> {
        let record = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| DispatchError::not_found("run", run_id.as_str()))?;
        let key = record
            .weights_path
            .clone()
            .ok_or_else(|| DispatchError::not_found("weights of run", run_id.as_str()))?;

        let body = self.blobs.get(&key).await?;
        Ok((record, body))
    }

    /// Record `result` for a RUNNING run and mark it COMPLETED.
    pub async fn report(&self, run_id: &RunId, result: RunResult) -> Result<RunRecord> {
        let record = self.store.report_result(run_id, &result).await?;
        info!(
            run_id = %run_id,
            train_score = ?record.train_score,
            validation_score = ?record.validation_score,
            "Run results recorded"
        );
        Ok(record)
    }
}
