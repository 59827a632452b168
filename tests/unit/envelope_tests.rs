//! Unit tests for inbound frame classification and outbound envelopes.

use serde_json::json;

use agent_duplex::protocol::envelope::{to_line, unwrap_stream_event, user_message, Inbound};

#[test]
fn wrapped_stream_event_is_unwrapped() {
    let frame = json!({
        "type": "stream_event",
        "session_id": "s1",
        "event": { "type": "message_stop" }
    });
    match Inbound::classify(&frame) {
        Inbound::StreamEvent { event, session_id } => {
            assert_eq!(event, json!({ "type": "message_stop" }));
            assert_eq!(session_id.as_deref(), Some("s1"));
        }
        other => panic!("expected stream event, got {other:?}"),
    }
}

#[test]
fn bare_stream_event_passes_through() {
    let frame = json!({ "type": "content_block_stop", "index": 0 });
    assert_eq!(
        Inbound::classify(&frame),
        Inbound::StreamEvent {
            event: frame.clone(),
            session_id: None
        }
    );
}

#[test]
fn stream_event_without_inner_object_is_other() {
    let frame = json!({ "type": "stream_event", "event": "nope" });
    assert_eq!(
        Inbound::classify(&frame),
        Inbound::Other {
            kind: "stream_event".into()
        }
    );
}

#[test]
fn control_request_is_classified() {
    let frame = json!({
        "type": "control_request",
        "request_id": "req-1",
        "request": { "subtype": "can_use_tool", "tool_name": "Bash", "input": {} }
    });
    match Inbound::classify(&frame) {
        Inbound::ControlRequest {
            request_id,
            request,
        } => {
            assert_eq!(request_id, "req-1");
            assert_eq!(request["subtype"], "can_use_tool");
        }
        other => panic!("expected control request, got {other:?}"),
    }
}

#[test]
fn control_response_success_and_error_are_classified() {
    let ok = json!({
        "type": "control_response",
        "response": { "subtype": "success", "request_id": "req_1_ab", "response": { "ok": true } }
    });
    assert_eq!(
        Inbound::classify(&ok),
        Inbound::ControlResponse {
            request_id: "req_1_ab".into(),
            subtype: "success".into(),
            response: Some(json!({ "ok": true })),
            error: None,
        }
    );

    let err = json!({
        "type": "control_response",
        "response": { "subtype": "error", "request_id": "req_2_cd", "error": "nope" }
    });
    assert_eq!(
        Inbound::classify(&err),
        Inbound::ControlResponse {
            request_id: "req_2_cd".into(),
            subtype: "error".into(),
            response: None,
            error: Some("nope".into()),
        }
    );
}

#[test]
fn system_and_result_frames_carry_session_id() {
    let init = json!({ "type": "system", "subtype": "init", "session_id": "abc" });
    assert_eq!(Inbound::classify(&init).session_id(), Some("abc"));

    let result = json!({ "type": "result", "subtype": "success", "is_error": false, "session_id": "abc" });
    assert_eq!(
        Inbound::classify(&result),
        Inbound::Result {
            session_id: Some("abc".into()),
            is_error: false
        }
    );
}

#[test]
fn unknown_frames_are_other() {
    let frame = json!({ "type": "assistant", "message": {} });
    assert_eq!(
        Inbound::classify(&frame),
        Inbound::Other {
            kind: "assistant".into()
        }
    );
    assert_eq!(
        Inbound::classify(&json!({ "no_type": 1 })),
        Inbound::Other { kind: String::new() }
    );
}

#[test]
fn unwrap_is_identity_for_bare_events() {
    let bare = json!({ "type": "ping" });
    assert_eq!(unwrap_stream_event(&bare), &bare);
}

#[test]
fn user_message_has_expected_shape() {
    let value = user_message("Hello");
    assert_eq!(
        value,
        json!({ "type": "user", "message": { "role": "user", "content": "Hello" } })
    );

    let line = to_line(&value).expect("serializable");
    assert_eq!(line.last(), Some(&b'\n'));
    let parsed: serde_json::Value =
        serde_json::from_slice(&line[..line.len() - 1]).expect("line is valid JSON");
    assert_eq!(parsed, value);
}
