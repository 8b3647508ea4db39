//! Wire format of a job published on the bus:
//!
//! ```json
//! {"job_config": {"run_id": "...", "script_key": "...", "params": {}}, "model_config": {}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DispatchError, Result};
use crate::types::{RunId, ScriptId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub run_id: RunId,
    pub script_key: ScriptId,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_config: JobConfig,
    pub model_config: Value,
}

impl JobPayload {
    /// Decode a bus message body.
    ///
    /// Any failure is `MalformedJob`: such a payload can never become valid,
    /// so callers drop it instead of retrying.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(data)
            .map_err(|e| DispatchError::MalformedJob(format!("not valid JSON: {}", e)))?;

        let Value::Object(mut obj) = value else {
            return Err(DispatchError::MalformedJob(
                "payload is not a JSON object".to_string(),
            ));
        };

        let job_config = obj
            .remove("job_config")
            .ok_or_else(|| DispatchError::MalformedJob("missing `job_config`".to_string()))?;
        let model_config = obj
            .remove("model_config")
            .ok_or_else(|| DispatchError::MalformedJob("missing `model_config`".to_string()))?;

        let job_config: JobConfig = serde_json::from_value(job_config)
            .map_err(|e| DispatchError::MalformedJob(format!("invalid `job_config`: {}", e)))?;

        Ok(Self {
            job_config,
            model_config,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
