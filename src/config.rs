//! Session configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::codec::DEFAULT_MAX_BUFFER_BYTES;
use crate::{AppError, Result};

fn default_executable() -> String {
    "claude".into()
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_buffer_bytes() -> usize {
    DEFAULT_MAX_BUFFER_BYTES
}

fn default_control_timeout_seconds() -> u64 {
    60
}

fn default_terminate_grace_millis() -> u64 {
    2000
}

/// Run the subprocess as a different OS user.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RunAsConfig {
    /// Target account name.
    pub user: String,
    /// Switch with `sudo -n -u` instead of `su` when not running as root.
    #[serde(default)]
    pub use_sudo: bool,
}

/// Configuration for one streaming session, parsed from TOML or built in code.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// CLI binary to launch (e.g., `claude`).
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Arguments placed before the streaming protocol flags.
    #[serde(default)]
    pub args: Vec<String>,
    /// Directory the subprocess starts in.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Extra environment variables layered over the inherited allowlist.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Hard limit on undecoded bytes held by the frame buffer.
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
    /// Upper bound on how long a control-protocol callback may take.
    #[serde(default = "default_control_timeout_seconds")]
    pub control_timeout_seconds: u64,
    /// Time between SIGTERM and a hard kill when terminating.
    #[serde(default = "default_terminate_grace_millis")]
    pub terminate_grace_millis: u64,
    /// Optional alternate account to run the subprocess as.
    #[serde(default)]
    pub run_as: Option<RunAsConfig>,
}

impl SessionConfig {
    /// Build a configuration for `executable` with every other field defaulted.
    #[must_use]
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: default_working_dir(),
            env: HashMap::new(),
            max_buffer_bytes: default_max_buffer_bytes(),
            control_timeout_seconds: default_control_timeout_seconds(),
            terminate_grace_millis: default_terminate_grace_millis(),
            run_as: None,
        }
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Timeout applied to each control-protocol callback.
    #[must_use]
    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_seconds)
    }

    /// Grace period between polite and forced termination.
    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_millis)
    }

    /// Check invariants and canonicalize `working_dir`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated constraint.
    pub fn validate(&mut self) -> Result<()> {
        if self.executable.trim().is_empty() {
            return Err(AppError::Config("executable must not be empty".into()));
        }

        if self.max_buffer_bytes == 0 {
            return Err(AppError::Config(
                "max_buffer_bytes must be greater than zero".into(),
            ));
        }

        if self.control_timeout_seconds == 0 {
            return Err(AppError::Config(
                "control_timeout_seconds must be greater than zero".into(),
            ));
        }

        if let Some(run_as) = &self.run_as {
            if run_as.user.trim().is_empty() {
                return Err(AppError::Config("run_as.user must not be empty".into()));
            }
        }

        self.working_dir = self
            .working_dir
            .canonicalize()
            .map_err(|err| AppError::Config(format!("working_dir invalid: {err}")))?;

        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(default_executable())
    }
}
