use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::db::DatabaseConfig;
use crate::error::{DispatchError, Result};

const CONFIG_ENV: &str = "TRAIN_DISPATCH_CONFIG";
const CONFIG_DIR: &str = "train-dispatch";
const CONFIG_FILE: &str = "config.yaml";

/// Everything a daemon or CLI invocation needs to reach its collaborators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bus: BusSettings,
    pub metadata: DatabaseConfig,
    pub cluster: ClusterSettings,
    pub blob: BlobSettings,
    pub dispatcher: DispatcherSettings,
}

/// Publish/subscribe transport. `host: memory` selects the in-process bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    pub channel: String,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            password: None,
            channel: "train-jobs".to_string(),
        }
    }
}

impl BusSettings {
    pub fn is_memory(&self) -> bool {
        self.host == "memory"
    }

    /// Connection URL for the redis client.
    pub fn redis_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(&format!("redis://{}:{}/{}", self.host, self.port, self.db))
            .map_err(|e| DispatchError::Config(format!("invalid bus address: {}", e)))?;

        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            url.set_password(Some(password))
                .map_err(|_| DispatchError::Config("bus password cannot be set on url".to_string()))?;
        }

        Ok(url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterBackend {
    /// Workers are child processes of the daemon.
    Local,
    /// Workers are SLURM allocations made through `srun`.
    Slurm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub backend: ClusterBackend,
    pub partition: String,
    pub cores_per_job: u32,
    pub memory_per_job: String,
    pub worker_name: String,
    pub exclusive: bool,
    pub max_workers: usize,
    /// Command that runs a script body read from stdin.
    pub interpreter: Vec<String>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            backend: ClusterBackend::Local,
            partition: "debug".to_string(),
            cores_per_job: 1,
            memory_per_job: "1G".to_string(),
            worker_name: "train-worker".to_string(),
            exclusive: false,
            max_workers: 1,
            interpreter: vec!["python3".to_string(), "-".to_string()],
        }
    }
}

/// Object storage for scripts and weights.
///
/// `endpoint` is `memory`, `file:///some/dir`, or an S3-compatible host
/// (`minio.example.com`, `http://localhost:9000`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobSettings {
    pub endpoint: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: String,
    pub region: String,
}

impl Default for BlobSettings {
    fn default() -> Self {
        Self {
            endpoint: "memory".to_string(),
            access_key: None,
            secret_key: None,
            bucket: "train-dispatch".to_string(),
            region: "us-east-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub poll_interval_ms: u64,
    pub drain_timeout_secs: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            drain_timeout_secs: 30,
        }
    }
}

impl DispatcherSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Settings {
    /// Load settings from `path`, or from the default location when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => resolve_config_path()?,
        };
        if !path.exists() {
            return Err(DispatchError::Config(format!(
                "no config file at {} (run `train-dispatch init` to create one)",
                path.display()
            )));
        }

        let raw = fs::read_to_string(&path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let expanded = expand_env_vars(raw, |name| env::var(name).ok());
        serde_yaml::from_str(&expanded)
            .map_err(|e| DispatchError::Config(format!("invalid config file: {}", e)))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| DispatchError::Config(format!("cannot serialize config: {}", e)))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_yaml()?)?;
        Ok(())
    }
}

pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(p) = env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join(CONFIG_DIR).join(CONFIG_FILE));
    }

    if let Ok(home) = env::var("HOME") {
        return Ok(PathBuf::from(home)
            .join(".config")
            .join(CONFIG_DIR)
            .join(CONFIG_FILE));
    }

    Err(DispatchError::Config(format!(
        "Could not locate a config file (set {} or HOME)",
        CONFIG_ENV
    )))
}

/// Replace `${NAME}` with `lookup(NAME)`. Unknown names are left verbatim.
fn expand_env_vars(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Some(val) = lookup(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}
