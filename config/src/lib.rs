//! Configuration loading and parsing for dispatch.
//!
//! ```toml
//! [runtime]
//! worker_threads = 4
//! max_io_threads = 64
//! thread_name = "dispatch"
//! ui_thread_name = "dispatch-ui"
//!
//! [scope]
//! supervision = "isolated"
//! primary_role = "ui-immediate"
//! immediate_policy = "reconcile"
//! ```
//!
//! Every section and field is optional. A missing file is not an error.

use std::path::{Path, PathBuf};
use std::{env, fs};

use serde::Deserialize;

use dispatch_types::{ImmediatePolicy, Role, Supervision};

/// Environment variable that overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "DISPATCH_CONFIG";

const DEFAULT_MAX_IO_THREADS: usize = 512;

fn default_thread_name() -> String {
    "dispatch-worker".to_string()
}

fn default_ui_thread_name() -> String {
    "dispatch-ui".to_string()
}

const fn default_max_io_threads() -> usize {
    DEFAULT_MAX_IO_THREADS
}

const fn default_primary_role() -> Role {
    Role::UiImmediate
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub scope: ScopeSettings,
}

/// Production execution substrate settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Size of the general-purpose worker pool. `None` uses one per core.
    pub worker_threads: Option<usize>,
    /// Upper bound on threads serving the `io` role. Default: 512.
    #[serde(default = "default_max_io_threads")]
    pub max_io_threads: usize,
    /// Name prefix for worker threads.
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
    /// Name of the dedicated UI thread.
    #[serde(default = "default_ui_thread_name")]
    pub ui_thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            max_io_threads: DEFAULT_MAX_IO_THREADS,
            thread_name: default_thread_name(),
            ui_thread_name: default_ui_thread_name(),
        }
    }
}

/// Defaults applied by the canonical scope factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ScopeSettings {
    /// Failure semantics for lifetimes synthesized when a config supplies none.
    #[serde(default)]
    pub supervision: Supervision,
    /// Role a scope launches on when no role is named.
    #[serde(default = "default_primary_role")]
    pub primary_role: Role,
    /// Whether merges reconcile `ui-immediate` against `ui`.
    #[serde(default)]
    pub immediate_policy: ImmediatePolicy,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            supervision: Supervision::default(),
            primary_role: default_primary_role(),
            immediate_policy: ImmediatePolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

impl DispatchConfig {
    /// Load from the default location. `Ok(None)` when there is no config file.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let path = match config_path() {
            Some(path) => path,
            None => return Ok(None),
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match Self::parse(&content) {
            Ok(config) => {
                tracing::debug!(path = %path.display(), "Loaded dispatch config");
                Ok(config)
            }
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load from the default location, falling back to defaults on any problem.
    ///
    /// Problems are logged, never surfaced: a broken config file must not keep
    /// the process from constructing scopes.
    #[must_use]
    pub fn load_or_default() -> Self {
        match Self::load() {
            Ok(Some(config)) => config,
            Ok(None) => Self::default(),
            Err(err) => {
                tracing::warn!(path = %err.path().display(), "Using default dispatch config: {err}");
                Self::default()
            }
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }
}

/// `$DISPATCH_CONFIG` if set, else `~/.dispatch/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var(CONFIG_PATH_ENV)
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".dispatch").join("config.toml"))
}
