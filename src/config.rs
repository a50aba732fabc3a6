use crate::process::WorkerCommand;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from escalator.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct EscalatorConfig {
    pub worker: WorkerConfig,
    pub escalation: EscalationConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub initial_delay_secs: u64,
    pub restart_delay_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub grace_secs: u64,
    pub final_grace_secs: u64,
}

// --- Default implementations ---

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "escalator-worker".to_string(),
            args: Vec::new(),
            initial_delay_secs: 30,
            restart_delay_secs: 5,
        }
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            grace_secs: 10,
            final_grace_secs: 10,
        }
    }
}

/// Errors raised while loading or validating configuration.
///
/// All of them are fatal and reported before any worker is spawned.
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
    /// The worker command is empty.
    EmptyCommand,
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
            ConfigError::EmptyCommand => write!(f, "worker command can't be empty"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::EmptyCommand => None,
        }
    }
}

/// Runtime settings for one supervision run, resolved from config and CLI.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub worker: WorkerCommand,
    /// `--delay` passed to generation 1.
    pub initial_delay_secs: u64,
    /// `--delay` passed to the restarted generation.
    pub restart_delay_secs: u64,
    pub grace: Duration,
    pub final_grace: Duration,
}

/// Load config from `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<EscalatorConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(EscalatorConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

impl EscalatorConfig {
    /// Check the invariants that must hold before anything is spawned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        Ok(())
    }

    /// Convert the validated config into supervisor settings.
    pub fn supervisor_settings(&self) -> Result<SupervisorSettings, ConfigError> {
        let worker = WorkerCommand::new(&self.worker.command, self.worker.args.clone())?;
        Ok(SupervisorSettings {
            worker,
            initial_delay_secs: self.worker.initial_delay_secs,
            restart_delay_secs: self.worker.restart_delay_secs,
            grace: Duration::from_secs(self.escalation.grace_secs),
            final_grace: Duration::from_secs(self.escalation.final_grace_secs),
        })
    }
}
