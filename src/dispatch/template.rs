//! Parameter substitution into script bodies.

use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};

use super::payload::JobConfig;
use crate::error::{Result, ValidationError};

/// Names bound by the dispatcher itself. A job parameter may only use one of
/// them if it carries exactly the value the dispatcher would bind.
pub const RESERVED_BINDINGS: [&str; 5] = ["run_id", "script_key", "params", "run_config", "model_config"];

/// Renders script bodies with strict undefined handling, so a typo in a
/// template variable fails the job instead of silently rendering nothing.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);
        Self { env }
    }

    pub fn render(&self, template: &str, bindings: &Bindings) -> Result<String> {
        let ctx = minijinja::Value::from_serialize(&bindings.0);
        Ok(self.env.render_str(template, ctx)?)
    }
}

/// Variables visible to a script template.
#[derive(Debug, Clone, PartialEq)]
pub struct Bindings(Map<String, Value>);

impl Bindings {
    /// Build the bindings for one job.
    ///
    /// Every params key is bound at top level, followed by `run_id`,
    /// `script_key`, `params`, `run_config` (all three fields again) and
    /// `model_config` (as a JSON string).
    pub fn for_job(job: &JobConfig, model_config: &Value) -> Result<Self> {
        let run_config = serde_json::to_value(job)?;
        let reserved: [(&str, Value); 5] = [
            ("run_id", Value::String(job.run_id.to_string())),
            ("script_key", Value::String(job.script_key.to_string())),
            ("params", Value::Object(job.params.clone())),
            ("run_config", run_config),
            ("model_config", Value::String(serde_json::to_string(model_config)?)),
        ];

        let mut map = job.params.clone();
        for (name, value) in reserved {
            match map.get(name) {
                Some(existing) if *existing != value => {
                    return Err(ValidationError::ReservedParameter(name.to_string()).into());
                }
                _ => {
                    map.insert(name.to_string(), value);
                }
            }
        }

        Ok(Self(map))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }
}
