//! Settings - `spindle.toml`（任意）→ 環境変数 `SPINDLE__SECTION__KEY` の順に重ねる
//!
//! ```toml
//! [database]
//! url = "postgres://localhost/spindle"
//!
//! [worker]
//! queues = ["mail", "reports"]
//! concurrency = 4
//! timeout = "5s"
//!
//! [log]
//! json = true
//! ```

use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use spindle_core::WorkerConfig;

const DEFAULT_FILE: &str = "spindle";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// PostgreSQL connection URL
    pub url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogSettings {
    /// JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

fn default_max_connections() -> u32 {
    10
}

fn environment() -> Environment {
    Environment::with_prefix("SPINDLE")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("worker.queues")
}

impl Settings {
    /// Load from `path` (required) or `./spindle.toml` (optional), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_FILE).required(false),
        };
        Config::builder()
            .add_source(file)
            .add_source(environment())
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;
    use spindle_core::DeleteJobCondition;
    use std::time::Duration;

    fn from_toml(text: &str) -> Settings {
        Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let settings = from_toml("");
        assert_eq!(settings.database.url, None);
        assert_eq!(settings.database.max_connections, 10);
        assert_eq!(settings.worker, WorkerConfig::default());
        assert!(!settings.log.json);
    }

    #[test]
    fn test_worker_section() {
        let settings = from_toml(
            r#"
            [database]
            url = "postgres://localhost/jobs"

            [worker]
            name = "reports"
            queues = ["reports"]
            concurrency = 3
            timeout = "2s"
            delete_jobs = "always"

            [worker.additional_context]
            region = "eu"

            [log]
            json = true
            "#,
        );

        assert_eq!(settings.database.url.as_deref(), Some("postgres://localhost/jobs"));
        assert_eq!(settings.worker.name, "reports");
        assert_eq!(settings.worker.queues, Some(vec!["reports".to_string()]));
        assert_eq!(settings.worker.concurrency, 3);
        assert_eq!(settings.worker.timeout, Duration::from_secs(2));
        assert_eq!(settings.worker.delete_jobs, DeleteJobCondition::Always);
        assert_eq!(settings.worker.additional_context["region"], "eu");
        assert!(settings.log.json);
    }
}
