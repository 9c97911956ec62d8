use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from efck.toml.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
#[derive(Default)]
pub struct LauncherConfig {
    pub instance: InstanceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct InstanceConfig {
    /// Searched for in process names, executable paths and command lines.
    pub app_name: String,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Also write log records to a per-launch file.
    pub file: bool,
    /// Directory for the log file (default: the system temp dir).
    pub dir: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            app_name: "efck".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "error".to_string(),
            file: true,
            dir: None,
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file is not valid TOML for this schema.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// A value parsed but is unusable.
    Invalid { field: &'static str, reason: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config value for {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl LauncherConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the launcher cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // An empty prefix matches every process on the host.
        if self.instance.app_name.is_empty() {
            return Err(ConfigError::Invalid {
                field: "instance.app_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.logging.level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::Invalid {
                field: "logging.level",
                reason: format!("unknown level {:?}", self.logging.level),
            });
        }
        Ok(())
    }
}
