//! Unit tests for stream-event translation.

use serde_json::{json, Value};

use agent_duplex::protocol::translator::translate;
use agent_duplex::DomainEvent;

fn wrapped(event: Value) -> Value {
    json!({ "type": "stream_event", "event": event })
}

fn text_delta(text: &str) -> Value {
    json!({
        "type": "content_block_delta",
        "index": 0,
        "delta": { "type": "text_delta", "text": text }
    })
}

// ── Text accumulation ───────────────────────────────────────────────────────

#[test]
fn deltas_carry_increments_and_accumulate_exactly() {
    let mut accumulated = String::new();
    let mut emitted = Vec::new();

    for part in ["Hel", "lo, ", "world"] {
        let out = translate(&wrapped(text_delta(part)), accumulated);
        accumulated = out.accumulated;
        emitted.extend(out.events);
    }

    assert_eq!(accumulated, "Hello, world");
    assert_eq!(
        emitted,
        vec![
            DomainEvent::TextDelta { text: "Hel".into() },
            DomainEvent::TextDelta { text: "lo, ".into() },
            DomainEvent::TextDelta {
                text: "world".into()
            },
        ],
        "each delta must carry only its own increment"
    );
}

#[test]
fn message_stop_resets_accumulation_and_reports_turn_text() {
    let out = translate(
        &wrapped(json!({ "type": "message_stop" })),
        "Hello, world".to_owned(),
    );

    assert_eq!(out.events, vec![DomainEvent::MessageStop {}]);
    assert!(out.accumulated.is_empty());
    assert_eq!(out.completed.as_deref(), Some("Hello, world"));
}

#[test]
fn non_text_events_leave_accumulation_untouched() {
    let out = translate(
        &json!({ "type": "content_block_stop", "index": 0 }),
        "kept".to_owned(),
    );
    assert_eq!(out.events, vec![DomainEvent::ContentBlockStop {}]);
    assert_eq!(out.accumulated, "kept");
    assert!(out.completed.is_none());
}

// ── Envelope forms ──────────────────────────────────────────────────────────

#[test]
fn wrapped_and_bare_forms_translate_identically() {
    let inner_events = [
        json!({ "type": "message_start", "message": { "id": "msg_1" } }),
        json!({ "type": "content_block_start", "index": 0,
                "content_block": { "type": "tool_use", "id": "toolu_1", "name": "Read" } }),
        json!({ "type": "content_block_delta", "index": 0,
                "delta": { "type": "input_json_delta", "partial_json": "{\"path\":" } }),
        text_delta("abc"),
        json!({ "type": "content_block_stop", "index": 0 }),
        json!({ "type": "message_stop" }),
    ];

    for inner in inner_events {
        let bare = translate(&inner, "x".to_owned());
        let enveloped = translate(&wrapped(inner.clone()), "x".to_owned());
        assert_eq!(bare, enveloped, "forms diverged for {inner}");
    }
}

// ── Event mapping ───────────────────────────────────────────────────────────

#[test]
fn message_start_maps_to_message_start() {
    let out = translate(&json!({ "type": "message_start", "message": {} }), String::new());
    assert_eq!(out.events, vec![DomainEvent::MessageStart {}]);
}

#[test]
fn tool_use_block_maps_to_tool_use_start_and_deltas() {
    let start = translate(
        &json!({
            "type": "content_block_start",
            "index": 1,
            "content_block": { "type": "tool_use", "id": "toolu_9", "name": "Bash", "input": {} }
        }),
        String::new(),
    );
    assert_eq!(
        start.events,
        vec![DomainEvent::ToolUseStart {
            name: "Bash".into(),
            id: "toolu_9".into(),
        }]
    );

    let delta = translate(
        &json!({
            "type": "content_block_delta",
            "index": 1,
            "delta": { "type": "input_json_delta", "partial_json": "{\"cmd\":\"ls\"}" }
        }),
        String::new(),
    );
    assert_eq!(
        delta.events,
        vec![DomainEvent::ToolUseDelta {
            partial_json: "{\"cmd\":\"ls\"}".into(),
        }]
    );
}

#[test]
fn text_block_start_produces_no_event() {
    let out = translate(
        &json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": { "type": "text", "text": "" }
        }),
        String::new(),
    );
    assert!(out.events.is_empty());
}

#[test]
fn thinking_delta_maps_to_thinking_delta() {
    let out = translate(
        &json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "thinking_delta", "thinking": "hmm" }
        }),
        "visible".to_owned(),
    );
    assert_eq!(out.events, vec![DomainEvent::ThinkingDelta { text: "hmm".into() }]);
    assert_eq!(out.accumulated, "visible", "thinking is not part of the reply text");
}

#[test]
fn error_event_maps_to_error_with_message() {
    let out = translate(
        &json!({
            "type": "error",
            "error": { "type": "overloaded_error", "message": "Overloaded" }
        }),
        String::new(),
    );
    assert_eq!(out.events, vec![DomainEvent::error("Overloaded")]);
}

#[test]
fn error_event_without_body_gets_generic_reason() {
    let out = translate(&json!({ "type": "error" }), String::new());
    assert_eq!(out.events, vec![DomainEvent::error("stream error")]);
}

#[test]
fn unknown_event_and_delta_kinds_are_dropped() {
    let unknown_event = translate(&json!({ "type": "future_event", "x": 1 }), String::new());
    assert!(unknown_event.events.is_empty());

    let unknown_delta = translate(
        &json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "signature_delta", "signature": "abc" }
        }),
        "keep".to_owned(),
    );
    assert!(unknown_delta.events.is_empty());
    assert_eq!(unknown_delta.accumulated, "keep");
}

#[test]
fn ping_and_message_delta_produce_no_events() {
    assert!(translate(&json!({ "type": "ping" }), String::new()).events.is_empty());
    assert!(translate(
        &json!({ "type": "message_delta", "delta": { "stop_reason": "end_turn" } }),
        String::new()
    )
    .events
    .is_empty());
}

#[test]
fn malformed_event_is_dropped_without_losing_text() {
    let out = translate(&json!({ "type": "content_block_delta" }), "so far".to_owned());
    assert!(out.events.is_empty());
    assert_eq!(out.accumulated, "so far");
}

// ── Conversation id ─────────────────────────────────────────────────────────

#[test]
fn conversation_id_is_taken_from_envelope() {
    let frame = json!({
        "type": "stream_event",
        "session_id": "sess-42",
        "event": { "type": "ping" }
    });
    assert_eq!(
        translate(&frame, String::new()).conversation_id.as_deref(),
        Some("sess-42")
    );
}

#[test]
fn conversation_id_is_taken_from_message_start() {
    let frame = json!({
        "type": "message_start",
        "message": { "id": "msg_1", "session_id": "sess-7" }
    });
    assert_eq!(
        translate(&frame, String::new()).conversation_id.as_deref(),
        Some("sess-7")
    );
}
