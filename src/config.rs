use crate::supervisor::SupervisorConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from transcode-watch.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct WatchConfig {
    pub supervisor: SupervisorSection,
    pub validation: ValidationSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    /// Seconds without a diagnostic record before the process is presumed hung.
    /// Zero disables the watchdog.
    pub inactivity_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub record_delimiter: String,
    pub priority: i32,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ValidationSection {
    pub enabled: bool,
    pub ffprobe: PathBuf,
}

// --- Default implementations ---

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 300,
            poll_interval_ms: 100,
            record_delimiter: "size=".to_string(),
            priority: 0,
        }
    }
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl WatchConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config: WatchConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supervisor.record_delimiter.is_empty() {
            return Err(ConfigError::Invalid(
                "supervisor.record_delimiter must not be empty".to_string(),
            ));
        }
        if self.supervisor.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the supervisor settings. A zero timeout means "disabled".
    pub fn supervisor_config(&self) -> SupervisorConfig {
        let timeout = match self.supervisor.inactivity_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        SupervisorConfig {
            inactivity_timeout: timeout,
            poll_interval: Duration::from_millis(self.supervisor.poll_interval_ms),
            record_delimiter: self.supervisor.record_delimiter.clone(),
        }
    }
}
