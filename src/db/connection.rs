use serde::{Deserialize, Serialize};
use std::env;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;

use crate::error::Result;

pub type Db = Surreal<Any>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env::var("SURREALDB_URL")
                .unwrap_or_else(|_| "memory".to_string()),
            namespace: env::var("SURREALDB_NAMESPACE")
                .unwrap_or_else(|_| "train".to_string()),
            database: env::var("SURREALDB_DATABASE")
                .unwrap_or_else(|_| "dispatch".to_string()),
            username: env::var("SURREALDB_USERNAME").ok(),
            password: env::var("SURREALDB_PASSWORD").ok(),
        }
    }
}

impl DatabaseConfig {
    /// Replace credentials with `${VAR}` references to the variables they
    /// default from, so a written config file never holds the secrets.
    pub fn with_credential_placeholders(mut self) -> Self {
        if self.username.is_some() {
            self.username = Some("${SURREALDB_USERNAME}".to_string());
        }
        if self.password.is_some() {
            self.password = Some("${SURREALDB_PASSWORD}".to_string());
        }
        self
    }
}

pub async fn create_connection(config: DatabaseConfig) -> Result<Db> {
    let db = surrealdb::engine::any::connect(config.url).await?;

    // Sign in if credentials are provided
    if let (Some(username), Some(password)) = (config.username, config.password) {
        db.signin(Root {
            username: &username,
            password: &password,
        })
        .await?;
    }

    db.use_ns(config.namespace).use_db(config.database).await?;

    Ok(db)
}

pub async fn ensure_schema(db: &Db) -> Result<()> {
    let schema_queries = [
        // One row per submitted job
        "DEFINE TABLE IF NOT EXISTS run SCHEMAFULL;
         DEFINE FIELD IF NOT EXISTS run_id ON TABLE run TYPE string;
         DEFINE FIELD IF NOT EXISTS script_key ON TABLE run TYPE option<string>;
         DEFINE FIELD IF NOT EXISTS status ON TABLE run TYPE string
             ASSERT $value INSIDE ['QUEUED', 'RUNNING', 'COMPLETED', 'FAILED'];
         DEFINE FIELD IF NOT EXISTS train_config ON TABLE run TYPE option<string>;
         DEFINE FIELD IF NOT EXISTS model_config ON TABLE run TYPE option<string>;
         DEFINE FIELD IF NOT EXISTS train_score ON TABLE run TYPE option<number>;
         DEFINE FIELD IF NOT EXISTS validation_score ON TABLE run TYPE option<number>;
         DEFINE FIELD IF NOT EXISTS weights_path ON TABLE run TYPE option<string>;
         DEFINE FIELD IF NOT EXISTS tags ON TABLE run TYPE option<string>;
         DEFINE FIELD IF NOT EXISTS created_at ON TABLE run VALUE $before OR time::now();
         DEFINE FIELD IF NOT EXISTS updated_at ON TABLE run VALUE time::now();",

        // Uploaded scripts, immutable once created
        "DEFINE TABLE IF NOT EXISTS script SCHEMAFULL;
         DEFINE FIELD IF NOT EXISTS script_id ON TABLE script TYPE string;
         DEFINE FIELD IF NOT EXISTS script_path ON TABLE script TYPE string;
         DEFINE FIELD IF NOT EXISTS file_name ON TABLE script TYPE string;
         DEFINE FIELD IF NOT EXISTS checksum ON TABLE script TYPE option<string>;
         DEFINE FIELD IF NOT EXISTS created_at ON TABLE script VALUE $before OR time::now();",

        "DEFINE INDEX IF NOT EXISTS run_status ON TABLE run COLUMNS status;
         DEFINE INDEX IF NOT EXISTS run_id_unique ON TABLE run COLUMNS run_id UNIQUE;
         DEFINE INDEX IF NOT EXISTS script_id_unique ON TABLE script COLUMNS script_id UNIQUE;",
    ];

    for query in schema_queries {
        db.query(query).await?.check()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_schema_is_idempotent() {
        let db = create_connection(DatabaseConfig {
            url: "memory".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

        ensure_schema(&db).await.unwrap();
        ensure_schema(&db).await.unwrap();
    }

    #[test]
    fn test_credential_placeholders_hide_secrets() {
        let config = DatabaseConfig {
            url: "ws://127.0.0.1:8000".to_string(),
            username: Some("root".to_string()),
            password: Some("hunter2".to_string()),
            ..Default::default()
        }
        .with_credential_placeholders();

        assert_eq!(config.username.as_deref(), Some("${SURREALDB_USERNAME}"));
        assert_eq!(config.password.as_deref(), Some("${SURREALDB_PASSWORD}"));
        assert_eq!(config.url, "ws://127.0.0.1:8000");

        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(!yaml.contains("hunter2"));

        let anonymous = DatabaseConfig {
            username: None,
            password: None,
            ..Default::default()
        }
        .with_credential_placeholders();
        assert!(anonymous.username.is_none() && anonymous.password.is_none());
    }
}
