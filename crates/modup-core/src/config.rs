use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::http::url_with_query;
use crate::install::ArchiveTool;

pub const SKIP_HOST_UPDATE: &str = "SKIP_HOST_UPDATE";
pub const SKIP_MODULE_UPDATE: &str = "SKIP_MODULE_UPDATE";

const KEYS: &[&str] = &[
    "endpoint",
    "release_channel",
    "host_version",
    SKIP_HOST_UPDATE,
    SKIP_MODULE_UPDATE,
    "core_modules",
    "check_cooldown_secs",
    "max_redirects",
    "max_concurrent_modules",
    "http_timeout_secs",
    "commit_failed_installs",
    "archive_tool",
    "local_modules_root",
    "debug_logging",
    "max_log_size_bytes",
];

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("{context} {}: {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid setting `{key}`: {details}")]
    InvalidValue { key: &'static str, details: String },
}

impl SettingsError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Persistent key-value settings shared with the rest of the application.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&mut self, key: &str, value: Value);
    /// # Errors
    /// Returns an error if the settings cannot be persisted.
    fn save(&self) -> Result<(), SettingsError>;
}

/// Settings kept as a flat JSON object in a single file.
#[derive(Debug, Clone)]
pub struct JsonSettings {
    path: PathBuf,
    values: Map<String, Value>,
}

impl JsonSettings {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            values: Map::new(),
        }
    }

    /// Read the settings file. A missing or unparsable file yields empty
    /// settings.
    #[must_use]
    pub fn load(path: PathBuf) -> Self {
        let values = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Map<String, Value>>(&content) {
                Ok(values) => values,
                Err(error) => {
                    warn!("Ignoring unreadable settings {}: {error}", path.display());
                    Map::new()
                }
            },
            Err(_) => Map::new(),
        };
        Self { path, values }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    fn save(&self) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                SettingsError::io("failed to create settings directory", parent, error)
            })?;
        }
        let content = serde_json::to_string_pretty(&self.values)?;
        std::fs::write(&self.path, content)
            .map_err(|error| SettingsError::io("failed to write settings", &self.path, error))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    #[serde(default)]
    pub endpoint: String,

    #[serde(default = "default_release_channel")]
    pub release_channel: String,

    #[serde(default = "default_host_version")]
    pub host_version: String,

    #[serde(default, rename = "SKIP_HOST_UPDATE")]
    pub skip_host_update: bool,

    #[serde(default, rename = "SKIP_MODULE_UPDATE")]
    pub skip_module_update: bool,

    #[serde(default = "default_core_modules")]
    pub core_modules: Vec<String>,

    #[serde(default = "default_check_cooldown")]
    pub check_cooldown_secs: u64,

    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Unbounded when absent.
    #[serde(default)]
    pub max_concurrent_modules: Option<usize>,

    #[serde(default)]
    pub http_timeout_secs: Option<u64>,

    /// Record the attempted version even when extraction fails.
    #[serde(default = "default_true")]
    pub commit_failed_installs: bool,

    #[serde(default)]
    pub archive_tool: ArchiveTool,

    /// Modules ship next to the host; nothing is downloaded.
    #[serde(default)]
    pub local_modules_root: Option<PathBuf>,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,
}

fn default_release_channel() -> String {
    "stable".to_string()
}

fn default_host_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_core_modules() -> Vec<String> {
    ["desktop_core", "utils", "voice"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_check_cooldown() -> u64 {
    10
}

fn default_max_redirects() -> usize {
    crate::http::DEFAULT_MAX_REDIRECTS
}

fn default_true() -> bool {
    true
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            release_channel: default_release_channel(),
            host_version: default_host_version(),
            skip_host_update: false,
            skip_module_update: false,
            core_modules: default_core_modules(),
            check_cooldown_secs: default_check_cooldown(),
            max_redirects: default_max_redirects(),
            max_concurrent_modules: None,
            http_timeout_secs: None,
            commit_failed_installs: true,
            archive_tool: ArchiveTool::default(),
            local_modules_root: None,
            debug_logging: false,
            max_log_size_bytes: default_max_log_size_bytes(),
        }
    }
}

impl UpdaterConfig {
    /// Build from a settings store. Keys holding a value of the wrong shape
    /// are logged and fall back to their default.
    #[must_use]
    pub fn from_settings(store: &dyn SettingsStore) -> Self {
        let mut accepted = Map::new();
        for &key in KEYS {
            let Some(value) = store.get(key) else {
                continue;
            };
            let single = Value::Object(Map::from_iter([(key.to_string(), value.clone())]));
            match serde_json::from_value::<Self>(single) {
                Ok(_) => {
                    accepted.insert(key.to_string(), value);
                }
                Err(error) => warn!("Ignoring setting {key}: {error}"),
            }
        }
        serde_json::from_value(Value::Object(accepted)).unwrap_or_default()
    }

    /// Write every field back into `store` without saving it.
    ///
    /// # Errors
    /// Returns an error if the config cannot be represented as JSON.
    pub fn write_to(&self, store: &mut dyn SettingsStore) -> Result<(), SettingsError> {
        if let Value::Object(values) = serde_json::to_value(self)? {
            for (key, value) in values {
                store.set(&key, value);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn check_cooldown(&self) -> Duration {
        Duration::from_secs(self.check_cooldown_secs)
    }

    #[must_use]
    pub fn http_timeout(&self) -> Option<Duration> {
        self.http_timeout_secs.map(Duration::from_secs)
    }

    #[must_use]
    pub fn is_local_distribution(&self) -> bool {
        self.local_modules_root.is_some()
    }

    /// Module updates are off explicitly or because modules ship locally.
    #[must_use]
    pub fn module_updates_disabled(&self) -> bool {
        self.skip_module_update || self.is_local_distribution()
    }

    /// # Errors
    /// Returns [`SettingsError::InvalidValue`] when the endpoint is needed
    /// but unusable, or the concurrency cap is zero.
    pub fn validate(&self) -> Result<(), SettingsError> {
        match self.max_concurrent_modules {
            Some(0) => {
                return Err(SettingsError::InvalidValue {
                    key: "max_concurrent_modules",
                    details: "must be at least 1".to_string(),
                });
            }
            Some(permits) if permits > Semaphore::MAX_PERMITS => {
                return Err(SettingsError::InvalidValue {
                    key: "max_concurrent_modules",
                    details: format!("must be at most {}", Semaphore::MAX_PERMITS),
                });
            }
            _ => {}
        }
        if self.skip_host_update && self.module_updates_disabled() {
            return Ok(());
        }
        if self.endpoint.trim().is_empty() {
            return Err(SettingsError::InvalidValue {
                key: "endpoint",
                details: "no update endpoint configured".to_string(),
            });
        }
        url_with_query(&self.endpoint, &[]).map_err(|error| SettingsError::InvalidValue {
            key: "endpoint",
            details: error.to_string(),
        })?;
        Ok(())
    }
}
