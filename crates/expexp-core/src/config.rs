//! Module configuration file.
//!
//! ```yaml
//! modules:
//!   proc_stat:
//!     method: file
//!     timeout: 5
//!     file:
//!       path: /proc/stat
//!       use_mtime: false
//!       allow_re: "^secret/"
//! ```
//!
//! Only the `file` method is served by this build; the `exec` and `http`
//! module kinds are recognised and rejected.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::module::FileModule;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("module {module:?}: method {method:?} is not supported")]
    UnsupportedMethod { module: String, method: String },

    #[error("module {module:?}: method {method:?} requires a `{method}` section")]
    MissingSection { module: String, method: String },

    #[error("module {module:?}: file path must not be empty")]
    EmptyPath { module: String },

    #[error("module {module:?}: invalid allow_re: {source}")]
    InvalidPattern {
        module: String,
        #[source]
        source: regex::Error,
    },

    #[error("module {module:?}: timeout must be a positive number of seconds")]
    InvalidTimeout { module: String },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    modules: BTreeMap<String, RawModule>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawModule {
    method: String,
    /// Seconds.
    #[serde(default)]
    timeout: Option<f64>,
    #[serde(default)]
    file: Option<RawFileSettings>,
    // Sections of the module kinds served by other builds.
    #[allow(dead_code)]
    #[serde(default)]
    exec: Option<serde_yaml::Value>,
    #[allow(dead_code)]
    #[serde(default)]
    http: Option<serde_yaml::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFileSettings {
    path: String,
    #[serde(default)]
    use_mtime: bool,
    #[serde(default)]
    allow_re: Option<String>,
}

/// Validated module set, keyed by module name.
#[derive(Debug, Clone, Default)]
pub struct Config {
    modules: BTreeMap<String, Arc<FileModule>>,
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text)?;
        let mut modules = BTreeMap::new();
        for (name, module) in raw.modules {
            let built = build_module(&name, module)?;
            modules.insert(name, Arc::new(built));
        }
        Ok(Self { modules })
    }

    pub fn module(&self, name: &str) -> Option<&Arc<FileModule>> {
        self.modules.get(name)
    }

    pub fn modules(&self) -> impl Iterator<Item = &Arc<FileModule>> {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

fn build_module(name: &str, raw: RawModule) -> Result<FileModule, ConfigError> {
    if raw.method != "file" {
        return Err(ConfigError::UnsupportedMethod {
            module: name.to_string(),
            method: raw.method,
        });
    }
    let settings = raw.file.ok_or_else(|| ConfigError::MissingSection {
        module: name.to_string(),
        method: "file".to_string(),
    })?;
    if settings.path.is_empty() {
        return Err(ConfigError::EmptyPath {
            module: name.to_string(),
        });
    }

    let mut module = FileModule::new(name, settings.path).with_use_mtime(settings.use_mtime);
    if let Some(pattern) = settings.allow_re {
        let re = Regex::new(&pattern).map_err(|source| ConfigError::InvalidPattern {
            module: name.to_string(),
            source,
        })?;
        module = module.with_allow_pattern(re);
    }
    if let Some(secs) = raw.timeout {
        let timeout = Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|t| !t.is_zero())
            .ok_or_else(|| ConfigError::InvalidTimeout {
                module: name.to_string(),
            })?;
        module = module.with_timeout(timeout);
    }
    Ok(module)
}
