use std::collections::{BTreeMap, HashMap};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EmberError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "ember.toml";
pub const DEFAULT_APP_NAME: &str = "ember";
/// Worker pool size used when the config does not set one.
pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_TIMER_THREADS: usize = 1;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 0;

/// Top-level config (ember.toml + EMBER_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmberConfig {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

/// Identity of the running application instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Prefix of every generated job id. Regenerated on each process start
    /// unless pinned in the config file.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            instance_id: default_instance_id(),
        }
    }
}

/// Job scheduler sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Maximum number of payloads executing at the same time.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Threads driving the time-based admission queue.
    #[serde(default = "default_timer_threads")]
    pub timer_threads: usize,
    /// How long `shutdown` waits for in-flight payloads before detaching them.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            timer_threads: DEFAULT_TIMER_THREADS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl JobsConfig {
    /// Reject sizes the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(EmberError::Config("jobs.pool_size must be at least 1".into()));
        }
        if self.timer_threads == 0 {
            return Err(EmberError::Config(
                "jobs.timer_threads must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_app_name() -> String {
    DEFAULT_APP_NAME.to_string()
}
/// Short, time-ordered prefix for generated job ids.
pub fn default_instance_id() -> String {
    let id = uuid::Uuid::now_v7().simple().to_string();
    id[..12].to_string()
}
fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}
fn default_timer_threads() -> usize {
    DEFAULT_TIMER_THREADS
}
fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

impl EmberConfig {
    /// Load config from a TOML file with EMBER_* env var overrides.
    ///
    /// Nested keys use a double underscore: `EMBER_JOBS__POOL_SIZE=4`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        Settings::load(config_path).map(|s| s.config)
    }
}

/// Resolves `${key}` placeholders against external configuration.
pub trait PlaceholderResolver: Send + Sync {
    fn resolve(&self, key: &str) -> Option<String>;
}

impl PlaceholderResolver for HashMap<String, String> {
    fn resolve(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

impl PlaceholderResolver for BTreeMap<String, String> {
    fn resolve(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Typed config plus the raw figment it was extracted from.
///
/// The figment is kept so that arbitrary dotted keys (e.g. `jobs.cleanup_every`)
/// can be looked up later, outside of the typed sections.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config: EmberConfig,
    figment: Figment,
}

impl Settings {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path.unwrap_or(DEFAULT_CONFIG_FILE);
        debug!(path, "loading configuration");

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("EMBER_").split("__"));

        let config: EmberConfig = figment
            .extract()
            .map_err(|e| EmberError::Config(e.to_string()))?;
        config.jobs.validate()?;

        Ok(Self { config, figment })
    }

    /// Wrap an already-built config, e.g. defaults or a test fixture.
    pub fn from_config(config: EmberConfig) -> Self {
        let figment = Figment::from(Serialized::defaults(&config));
        Self { config, figment }
    }

    /// Look up a dotted key and render scalar values as strings.
    pub fn lookup(&self, key: &str) -> Option<String> {
        match self.figment.extract_inner::<serde_json::Value>(key).ok()? {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

impl PlaceholderResolver for Settings {
    fn resolve(&self, key: &str) -> Option<String> {
        self.lookup(key)
    }
}
