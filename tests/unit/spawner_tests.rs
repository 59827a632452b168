//! Unit tests for subprocess command construction.
//!
//! Tests that touch the process environment are serialized with
//! `serial_test` so they do not observe each other's variables.

use std::collections::HashMap;

use serial_test::serial;

use agent_duplex::config::{RunAsConfig, SessionConfig};
use agent_duplex::transport::spawner::{
    sdk_env, shell_escape, LaunchSpec, SpawnBackend, ALLOWED_ENV_VARS, PROTOCOL_FLAGS,
    SDK_ENTRYPOINT,
};
use agent_duplex::AppError;

fn env_map(spec: &LaunchSpec) -> HashMap<String, String> {
    spec.environment().into_iter().collect()
}

// ── Arguments ───────────────────────────────────────────────────────────────

#[test]
fn protocol_flags_follow_user_args() {
    let mut config = SessionConfig::new("claude");
    config.args = vec!["--model".into(), "sonnet".into()];
    let spec = LaunchSpec::from_config(&config);

    assert_eq!(&spec.args[..2], &["--model", "sonnet"]);
    assert_eq!(&spec.args[2..], PROTOCOL_FLAGS);
    assert_eq!(spec.backend, SpawnBackend::Direct);
}

#[test]
fn protocol_flags_select_bidirectional_stream_json() {
    let joined = PROTOCOL_FLAGS.join(" ");
    assert!(joined.contains("--input-format stream-json"));
    assert!(joined.contains("--output-format stream-json"));
    assert!(joined.contains("--include-partial-messages"));
    assert!(joined.contains("--verbose"));
    assert!(joined.starts_with("--print"));
}

#[test]
fn run_as_config_selects_run_as_backend() {
    let mut config = SessionConfig::new("claude");
    config.run_as = Some(RunAsConfig {
        user: "agent".into(),
        use_sudo: true,
    });
    assert_eq!(
        LaunchSpec::from_config(&config).backend,
        SpawnBackend::RunAs {
            user: "agent".into(),
            use_sudo: true
        }
    );
}

// ── Environment ─────────────────────────────────────────────────────────────

#[test]
#[serial]
fn non_allowlisted_variables_are_stripped() {
    std::env::set_var("AGENT_DUPLEX_TEST_SECRET", "hunter2");
    let env = env_map(&LaunchSpec::from_config(&SessionConfig::new("claude")));
    std::env::remove_var("AGENT_DUPLEX_TEST_SECRET");

    assert!(!env.contains_key("AGENT_DUPLEX_TEST_SECRET"));
    for key in env.keys() {
        let allowed = ALLOWED_ENV_VARS.contains(&key.as_str())
            || sdk_env().iter().any(|(k, _)| k == key);
        assert!(allowed, "unexpected variable {key} in child environment");
    }
}

#[test]
#[serial]
fn allowlisted_variables_are_inherited() {
    std::env::set_var("ANTHROPIC_BASE_URL", "http://localhost:9999");
    let env = env_map(&LaunchSpec::from_config(&SessionConfig::new("claude")));
    std::env::remove_var("ANTHROPIC_BASE_URL");

    assert_eq!(
        env.get("ANTHROPIC_BASE_URL").map(String::as_str),
        Some("http://localhost:9999")
    );
}

#[test]
#[serial]
fn configured_variables_override_inherited_ones() {
    std::env::set_var("ANTHROPIC_BASE_URL", "http://inherited");
    let mut config = SessionConfig::new("claude");
    config
        .env
        .insert("ANTHROPIC_BASE_URL".into(), "http://configured".into());
    config.env.insert("EXTRA_FLAG".into(), "1".into());
    let env = env_map(&LaunchSpec::from_config(&config));
    std::env::remove_var("ANTHROPIC_BASE_URL");

    assert_eq!(
        env.get("ANTHROPIC_BASE_URL").map(String::as_str),
        Some("http://configured")
    );
    assert_eq!(env.get("EXTRA_FLAG").map(String::as_str), Some("1"));
}

#[test]
fn sdk_variables_are_always_set_and_win() {
    let mut config = SessionConfig::new("claude");
    config
        .env
        .insert("CLAUDE_CODE_ENTRYPOINT".into(), "something-else".into());
    let env = env_map(&LaunchSpec::from_config(&config));

    assert_eq!(
        env.get("CLAUDE_CODE_ENTRYPOINT").map(String::as_str),
        Some(SDK_ENTRYPOINT)
    );
    assert_eq!(
        env.get("AGENT_DUPLEX_VERSION").map(String::as_str),
        Some(env!("CARGO_PKG_VERSION"))
    );
}

#[test]
fn environment_has_no_duplicate_keys() {
    let mut config = SessionConfig::new("claude");
    config.env.insert("PATH".into(), "/opt/bin".into());
    let vars = LaunchSpec::from_config(&config).environment();
    let unique: std::collections::HashSet<_> = vars.iter().map(|(k, _)| k.clone()).collect();
    assert_eq!(unique.len(), vars.len());
}

// ── Command building ────────────────────────────────────────────────────────

#[test]
fn direct_backend_runs_executable() {
    let spec = LaunchSpec::from_config(&SessionConfig::new("my-cli"));
    let cmd = spec.build_command().expect("direct command builds");
    assert_eq!(cmd.as_std().get_program(), "my-cli");
    let args: Vec<_> = cmd.as_std().get_args().collect();
    assert_eq!(args.len(), PROTOCOL_FLAGS.len());
}

#[cfg(unix)]
#[test]
fn run_as_without_sudo_requires_root() {
    let mut spec = LaunchSpec::from_config(&SessionConfig::new("my-cli"));
    spec.backend = SpawnBackend::RunAs {
        user: "nobody".into(),
        use_sudo: false,
    };

    let result = spec.build_command();
    if nix::unistd::geteuid().is_root() {
        let cmd = result.expect("root may switch users with su");
        assert_eq!(cmd.as_std().get_program(), "su");
    } else {
        assert!(matches!(result, Err(AppError::Spawn(_))));
    }
}

#[cfg(unix)]
#[test]
fn run_as_with_sudo_wraps_command() {
    let mut spec = LaunchSpec::from_config(&SessionConfig::new("my-cli"));
    spec.backend = SpawnBackend::RunAs {
        user: "nobody".into(),
        use_sudo: true,
    };

    let cmd = spec.build_command().expect("run-as command builds");
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let args: Vec<String> = cmd
        .as_std()
        .get_args()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();

    if nix::unistd::geteuid().is_root() {
        assert_eq!(program, "su");
        assert!(args.iter().any(|a| a.contains("my-cli")));
    } else {
        assert_eq!(program, "sudo");
        assert_eq!(&args[..5], &["-n", "-u", "nobody", "--preserve-env", "--"]);
        assert_eq!(args[5], "my-cli");
    }
}

#[test]
fn shell_escape_quotes_only_when_needed() {
    assert_eq!(shell_escape("stream-json"), "stream-json");
    assert_eq!(shell_escape("/usr/bin/claude"), "/usr/bin/claude");
    assert_eq!(shell_escape("two words"), "'two words'");
    assert_eq!(shell_escape("it's"), "'it'\\''s'");
    assert_eq!(shell_escape(""), "''");
}
