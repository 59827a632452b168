//! Command construction for the CLI subprocess.
//!
//! Builds a `tokio::process::Command` with:
//! - `kill_on_drop(true)` so an abandoned session never leaks a process.
//! - `env_clear()` plus a short allowlist, so unrelated secrets in the host
//!   environment are not visible to the child.
//! - The streaming protocol flags appended after the caller's own arguments.
//! - Optionally, a switch to another OS account through `sudo` or `su`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::config::SessionConfig;
use crate::{AppError, Result};

// ── Environment ──────────────────────────────────────────────────────────────

/// Environment variables inherited by the subprocess.
///
/// Everything else is stripped via `env_clear()` before launch.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "TERM",
    "SHELL",
    "TMPDIR",
    "RUST_LOG",
    "ANTHROPIC_API_KEY",
    "ANTHROPIC_BASE_URL",
    "CLAUDE_CONFIG_DIR",
    "XDG_CONFIG_HOME",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Entrypoint tag reported to the CLI.
pub const SDK_ENTRYPOINT: &str = "sdk-rs";

/// Flags that put the CLI into bidirectional stream-json mode.
pub const PROTOCOL_FLAGS: &[&str] = &[
    "--print",
    "--input-format",
    "stream-json",
    "--output-format",
    "stream-json",
    "--include-partial-messages",
    "--verbose",
];

/// Variables that identify this crate to the CLI. Applied last.
#[must_use]
pub fn sdk_env() -> Vec<(&'static str, &'static str)> {
    vec![
        ("CLAUDE_CODE_ENTRYPOINT", SDK_ENTRYPOINT),
        ("AGENT_DUPLEX_VERSION", env!("CARGO_PKG_VERSION")),
    ]
}

// ── Launch description ───────────────────────────────────────────────────────

/// How the subprocess is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnBackend {
    /// Launch the executable directly as the current user.
    Direct,
    /// Launch as another OS account.
    RunAs {
        /// Target account name.
        user: String,
        /// Use `sudo -n -u` when not root; `su -` is used when root.
        use_sudo: bool,
    },
}

/// Everything needed to launch one subprocess.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Binary to run.
    pub executable: String,
    /// Full argument list, protocol flags included.
    pub args: Vec<String>,
    /// Starting directory.
    pub working_dir: PathBuf,
    /// Extra variables layered over the allowlist.
    pub env: HashMap<String, String>,
    /// Launch strategy.
    pub backend: SpawnBackend,
    /// Time between SIGTERM and a hard kill.
    pub terminate_grace: Duration,
}

impl LaunchSpec {
    /// Derive a launch description from session configuration, appending the
    /// streaming protocol flags to the configured arguments.
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        let mut args = config.args.clone();
        args.extend(PROTOCOL_FLAGS.iter().map(|&flag| flag.to_owned()));

        let backend = match &config.run_as {
            Some(run_as) => SpawnBackend::RunAs {
                user: run_as.user.clone(),
                use_sudo: run_as.use_sudo,
            },
            None => SpawnBackend::Direct,
        };

        Self {
            executable: config.executable.clone(),
            args,
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
            backend,
            terminate_grace: config.terminate_grace(),
        }
    }

    /// Full child environment: allowlisted host variables, then configured
    /// variables, then the SDK identification variables.
    #[must_use]
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = Vec::new();
        let mut set = |key: &str, value: String| {
            vars.retain(|(existing, _)| existing != key);
            vars.push((key.to_owned(), value));
        };

        for &key in ALLOWED_ENV_VARS {
            if let Ok(value) = std::env::var(key) {
                set(key, value);
            }
        }
        let mut configured: Vec<_> = self.env.iter().collect();
        configured.sort();
        for (key, value) in configured {
            set(key, value.clone());
        }
        for (key, value) in sdk_env() {
            set(key, value.to_owned());
        }
        vars
    }

    /// Build the command for this launch, stdio fully piped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the run-as backend cannot be used from
    /// the current account.
    pub fn build_command(&self) -> Result<Command> {
        let env = self.environment();

        let mut cmd = match &self.backend {
            SpawnBackend::Direct => {
                let mut cmd = Command::new(&self.executable);
                cmd.args(&self.args).current_dir(&self.working_dir);
                cmd
            }
            SpawnBackend::RunAs { user, use_sudo } => self.run_as_command(user, *use_sudo, &env)?,
        };

        cmd.env_clear();
        for (key, value) in &env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    fn run_as_command(
        &self,
        user: &str,
        use_sudo: bool,
        env: &[(String, String)],
    ) -> Result<Command> {
        let is_root = running_as_root();

        if use_sudo && !is_root {
            debug!(user, executable = %self.executable, "spawning via sudo");
            let mut cmd = Command::new("sudo");
            cmd.arg("-n")
                .arg("-u")
                .arg(user)
                .arg("--preserve-env")
                .arg("--")
                .arg(&self.executable)
                .args(&self.args)
                .current_dir(&self.working_dir);
            return Ok(cmd);
        }

        if is_root {
            // `su -` starts a login shell with a fresh environment, so the
            // variables travel inside the command line.
            debug!(user, executable = %self.executable, "spawning via su");
            let assignments = env
                .iter()
                .map(|(key, value)| format!("{key}={}", shell_escape(value)))
                .collect::<Vec<_>>()
                .join(" ");
            let args = self
                .args
                .iter()
                .map(|arg| shell_escape(arg))
                .collect::<Vec<_>>()
                .join(" ");
            let script = format!(
                "cd {} && exec env {assignments} {} {args}",
                shell_escape(&self.working_dir.to_string_lossy()),
                shell_escape(&self.executable),
            );

            let mut cmd = Command::new("su");
            cmd.arg("-").arg(user).arg("-c").arg(script);
            return Ok(cmd);
        }

        Err(AppError::Spawn(format!(
            "cannot run as '{user}': not root and sudo is disabled"
        )))
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

/// Quote `s` for a POSIX shell when it contains anything beyond a safe set.
#[must_use]
pub fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '=' | ':'))
    {
        s.to_owned()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}
