//! Wire envelopes for the stream-json protocol.
//!
//! # Inbound frames
//!
//! | `type` field           | Maps to                                   |
//! |------------------------|-------------------------------------------|
//! | `stream_event`         | [`Inbound::StreamEvent`] (inner unwrapped)|
//! | bare SSE event kinds   | [`Inbound::StreamEvent`] (passed through) |
//! | `control_request`      | [`Inbound::ControlRequest`]               |
//! | `control_response`     | [`Inbound::ControlResponse`]              |
//! | `system`               | [`Inbound::System`]                       |
//! | `result`               | [`Inbound::Result`]                       |
//! | *(any other)*          | [`Inbound::Other`]; skipped by the session|
//!
//! Both the wrapped and the bare stream-event forms occur in practice and
//! are treated as equivalent.

use serde_json::{json, Value};

/// Event kinds that may arrive without the `stream_event` wrapper.
pub const BARE_EVENT_TYPES: &[&str] = &[
    "message_start",
    "message_delta",
    "message_stop",
    "content_block_start",
    "content_block_delta",
    "content_block_stop",
    "ping",
    "error",
];

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A streaming event, already unwrapped from its envelope.
    StreamEvent {
        /// The inner event object (has its own `type`).
        event: Value,
        /// Conversation identifier carried on the envelope, if any.
        session_id: Option<String>,
    },
    /// Out-of-band request from the subprocess awaiting a response.
    ControlRequest {
        /// Correlation identifier to echo back.
        request_id: String,
        /// Request body; carries a `subtype`.
        request: Value,
    },
    /// Response to a control request this side sent earlier.
    ControlResponse {
        /// Correlation identifier of the original request.
        request_id: String,
        /// `success` or `error`.
        subtype: String,
        /// Success payload, when present.
        response: Option<Value>,
        /// Error message, when present.
        error: Option<String>,
    },
    /// System notice (e.g. `init`).
    System {
        /// System message subtype.
        subtype: String,
        /// Conversation identifier, if reported.
        session_id: Option<String>,
    },
    /// End-of-request summary.
    Result {
        /// Conversation identifier, if reported.
        session_id: Option<String>,
        /// Whether the request failed.
        is_error: bool,
    },
    /// Anything else (assistant snapshots, user echoes, future kinds).
    Other {
        /// The `type` field, or empty when absent.
        kind: String,
    },
}

impl Inbound {
    /// Classify a decoded frame by its `type` discriminator.
    #[must_use]
    pub fn classify(frame: &Value) -> Self {
        let kind = str_field(frame, "type").unwrap_or_default();
        let session_id = str_field(frame, "session_id");

        match kind.as_str() {
            "stream_event" => match frame.get("event") {
                Some(event) if event.is_object() => Self::StreamEvent {
                    event: event.clone(),
                    session_id,
                },
                _ => Self::other(&kind),
            },
            "control_request" => {
                let request_id = str_field(frame, "request_id");
                match (request_id, frame.get("request")) {
                    (Some(request_id), Some(request)) => Self::ControlRequest {
                        request_id,
                        request: request.clone(),
                    },
                    _ => Self::other(&kind),
                }
            }
            "control_response" => {
                let body = frame.get("response").unwrap_or(&Value::Null);
                match str_field(body, "request_id") {
                    Some(request_id) => Self::ControlResponse {
                        request_id,
                        subtype: str_field(body, "subtype").unwrap_or_default(),
                        response: body.get("response").cloned(),
                        error: str_field(body, "error"),
                    },
                    None => Self::other(&kind),
                }
            }
            "system" => Self::System {
                subtype: str_field(frame, "subtype").unwrap_or_default(),
                session_id,
            },
            "result" => Self::Result {
                session_id,
                is_error: frame
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            bare if BARE_EVENT_TYPES.contains(&bare) => Self::StreamEvent {
                event: frame.clone(),
                session_id,
            },
            _ => Self::other(&kind),
        }
    }

    fn other(kind: &str) -> Self {
        Self::Other {
            kind: kind.to_owned(),
        }
    }

    /// Conversation identifier carried by this frame, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::StreamEvent { session_id, .. }
            | Self::System { session_id, .. }
            | Self::Result { session_id, .. } => session_id.as_deref(),
            _ => None,
        }
    }
}

/// Strip the `stream_event` wrapper from `frame`, if present.
///
/// Frames without the wrapper are returned unchanged.
#[must_use]
pub fn unwrap_stream_event(frame: &Value) -> &Value {
    if frame.get("type").and_then(Value::as_str) == Some("stream_event") {
        if let Some(inner) = frame.get("event").filter(|e| e.is_object()) {
            return inner;
        }
    }
    frame
}

/// Build the outbound envelope for one user turn.
///
/// ```json
/// {"type":"user","message":{"role":"user","content":"<text>"}}
/// ```
#[must_use]
pub fn user_message(text: &str) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": text,
        }
    })
}

/// Serialize `value` as one NDJSON line (compact JSON plus `\n`).
///
/// # Errors
///
/// Returns [`serde_json::Error`] if serialization fails (cannot happen for a
/// plain [`Value`]).
pub fn to_line(value: &Value) -> serde_json::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_owned)
}
