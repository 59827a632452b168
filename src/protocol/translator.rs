//! Stream-event translator.
//!
//! Converts the subprocess's low-level streaming events into the flat
//! [`DomainEvent`] set. The translator is stateless: the per-turn text
//! accumulation is threaded through every call by the owning session.
//!
//! # Mapping
//!
//! | Inner event                                  | Domain event            |
//! |----------------------------------------------|-------------------------|
//! | `message_start`                              | `message_start`         |
//! | `content_block_start` (`tool_use` block)     | `tool_use_start`        |
//! | `content_block_delta` / `text_delta`         | `text_delta`            |
//! | `content_block_delta` / `input_json_delta`   | `tool_use_delta`        |
//! | `content_block_delta` / `thinking_delta`     | `thinking_delta`        |
//! | `content_block_stop`                         | `content_block_stop`    |
//! | `message_stop`                               | `message_stop`          |
//! | `error`                                      | `error`                 |
//! | *(any other)*                                | dropped; logged `DEBUG` |

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::event::DomainEvent;
use crate::protocol::envelope::unwrap_stream_event;

/// Output of a single [`translate`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Translation {
    /// Domain events in the order they were produced.
    pub events: Vec<DomainEvent>,
    /// Turn text after this frame; empty again once the turn stopped.
    pub accumulated: String,
    /// Conversation identifier carried by the frame, if any.
    pub conversation_id: Option<String>,
    /// Full turn text, set when this frame stopped the message.
    pub completed: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        #[serde(default)]
        message: Option<MessageInfo>,
        #[serde(default)]
        session_id: Option<String>,
    },
    ContentBlockStart {
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    ContentBlockStop {},
    MessageDelta {},
    MessageStop {},
    Ping {},
    Error {
        #[serde(default)]
        error: Option<ErrorBody>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    ThinkingDelta {
        #[serde(alias = "text")]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

/// Translate one decoded frame, threading the per-turn text through.
///
/// The wrapped (`stream_event`) and bare forms of the same event produce
/// identical output. Text deltas carry only their increment; the full text
/// is carried in [`Translation::accumulated`] until `message_stop` resets it.
#[must_use]
pub fn translate(frame: &Value, accumulated: String) -> Translation {
    let envelope_session = frame
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let inner = unwrap_stream_event(frame);

    let mut out = Translation {
        events: Vec::new(),
        accumulated,
        conversation_id: envelope_session,
        completed: None,
    };

    let event = match StreamEvent::deserialize(inner) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "translator: malformed stream event, dropping");
            return out;
        }
    };

    match event {
        StreamEvent::MessageStart {
            message,
            session_id,
        } => {
            if out.conversation_id.is_none() {
                out.conversation_id = session_id.or_else(|| message.and_then(|m| m.session_id));
            }
            out.events.push(DomainEvent::MessageStart {});
        }
        StreamEvent::ContentBlockStart { content_block } => match content_block {
            ContentBlock::ToolUse { id, name } => {
                out.events.push(DomainEvent::ToolUseStart { name, id });
            }
            ContentBlock::Other => {}
        },
        StreamEvent::ContentBlockDelta { delta } => match delta {
            Delta::TextDelta { text } => {
                out.accumulated.push_str(&text);
                out.events.push(DomainEvent::TextDelta { text });
            }
            Delta::InputJsonDelta { partial_json } => {
                out.events.push(DomainEvent::ToolUseDelta { partial_json });
            }
            Delta::ThinkingDelta { thinking } => {
                out.events.push(DomainEvent::ThinkingDelta { text: thinking });
            }
            Delta::Other => debug!("translator: skipping unknown delta kind"),
        },
        StreamEvent::ContentBlockStop {} => out.events.push(DomainEvent::ContentBlockStop {}),
        StreamEvent::MessageStop {} => {
            out.completed = Some(std::mem::take(&mut out.accumulated));
            out.events.push(DomainEvent::MessageStop {});
        }
        StreamEvent::Error { error } => {
            let reason = error
                .and_then(|e| e.message.or(e.kind))
                .unwrap_or_else(|| "stream error".to_owned());
            out.events.push(DomainEvent::Error { reason });
        }
        StreamEvent::MessageDelta {} | StreamEvent::Ping {} => {}
        StreamEvent::Unknown => {
            let kind = inner.get("type").and_then(Value::as_str).unwrap_or("");
            debug!(kind, "translator: skipping unknown event type");
        }
    }

    out
}
