//! End-to-end tests against a real subprocess.
//!
//! A small `sh` script plays the CLI: it announces a conversation id, then
//! answers every stdin line with one streamed turn.

use agent_duplex::{
    close_session, get_session_id, send_message, start_session, AppError, SessionConfig,
    SessionState,
};

use super::test_helpers::{script_config, within, write_script};

const ECHO_CLI: &str = r##"
printf '%s\n' '{"type":"system","subtype":"init","session_id":"sess-fake-1"}'
n=0
while IFS= read -r line; do
  n=$((n + 1))
  printf '%s\n' '{"type":"stream_event","event":{"type":"message_start","message":{}}}'
  printf '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"reply-%s"}}}\n' "$n"
  printf '%s\n' '{"type":"stream_event","event":{"type":"message_stop"}}'
done
"##;

const CRASHING_CLI: &str = r##"
IFS= read -r line
printf '%s\n' '{"type":"stream_event","event":{"type":"message_start","message":{}}}'
echo boom >&2
exit 3
"##;

const INTROSPECTING_CLI: &str = r##"
IFS= read -r line
printf '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"%s"}}}\n' "$CLAUDE_CODE_ENTRYPOINT $*"
printf '%s\n' '{"type":"stream_event","event":{"type":"message_stop"}}'
cat > /dev/null
"##;

fn fake_cli(body: &str) -> (tempfile::TempDir, SessionConfig) {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = write_script(dir.path(), "fake-cli.sh", body);
    let config = script_config(dir.path(), &script);
    (dir, config)
}

#[tokio::test]
async fn single_turn_against_real_process() {
    let (_dir, config) = fake_cli(ECHO_CLI);
    let session = start_session(&config, None).expect("spawn");

    let text = within(async {
        send_message(&session, "hello")
            .await
            .expect("send")
            .collect_text()
            .await
    })
    .await
    .expect("turn");
    assert_eq!(text, "reply-1");
    assert_eq!(get_session_id(&session).as_deref(), Some("sess-fake-1"));

    within(close_session(&session)).await.expect("close");
}

#[tokio::test]
async fn concurrent_turns_are_answered_in_order() {
    let (_dir, config) = fake_cli(ECHO_CLI);
    let session = start_session(&config, None).expect("spawn");

    let first = within(send_message(&session, "one")).await.expect("send one");
    let second = within(send_message(&session, "two")).await.expect("send two");
    let (a, b) = within(async { tokio::join!(first.collect_text(), second.collect_text()) }).await;

    assert_eq!(a.expect("first"), "reply-1");
    assert_eq!(b.expect("second"), "reply-2");
    within(close_session(&session)).await.expect("close");
}

#[tokio::test]
async fn missing_executable_is_a_spawn_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = SessionConfig::new(
        dir.path()
            .join("definitely-not-installed")
            .display()
            .to_string(),
    );
    config.working_dir = dir.path().to_path_buf();

    let err = start_session(&config, None).expect_err("nothing to launch");
    assert!(matches!(err, AppError::Spawn(_)), "got {err:?}");
}

#[tokio::test]
async fn crash_reports_exit_code_and_stderr() {
    let (_dir, config) = fake_cli(CRASHING_CLI);
    let session = start_session(&config, None).expect("spawn");

    let err = within(async {
        send_message(&session, "trigger")
            .await
            .expect("send")
            .collect_text()
            .await
    })
    .await
    .expect_err("process crashed");
    let message = err.to_string();
    assert!(message.contains("code 3"), "got {message}");
    assert!(message.contains("boom"), "got {message}");

    within(session.closed()).await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn close_terminates_a_waiting_process() {
    let (_dir, config) = fake_cli(ECHO_CLI);
    let session = start_session(&config, None).expect("spawn");

    within(close_session(&session)).await.expect("close");
    assert_eq!(session.state(), SessionState::Closed);

    let err = within(send_message(&session, "late"))
        .await
        .expect_err("closed");
    assert!(matches!(err, AppError::Closed(_)), "got {err:?}");
}

#[tokio::test]
async fn child_sees_protocol_flags_and_sdk_environment() {
    let (_dir, config) = fake_cli(INTROSPECTING_CLI);
    let session = start_session(&config, None).expect("spawn");

    let text = within(async {
        send_message(&session, "who are you")
            .await
            .expect("send")
            .collect_text()
            .await
    })
    .await
    .expect("turn");

    assert!(text.starts_with("sdk-rs "), "got {text}");
    assert!(text.contains("--input-format stream-json"), "got {text}");
    assert!(text.contains("--output-format stream-json"), "got {text}");
    within(close_session(&session)).await.expect("close");
}
