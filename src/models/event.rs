//! Domain streaming events delivered to subscribers.

use serde::{Deserialize, Serialize};

/// One translated streaming event.
///
/// Serialized with a `type` tag so the wire shape matches the event names
/// (`text_delta`, `message_stop`, ...). Every turn ends in exactly one
/// [`DomainEvent::MessageStop`] or [`DomainEvent::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// The assistant started a new message.
    MessageStart {},
    /// Incremental assistant text; never the accumulated whole.
    TextDelta {
        /// Newly produced text.
        text: String,
    },
    /// The assistant began a tool invocation.
    ToolUseStart {
        /// Tool name.
        name: String,
        /// Tool-use block identifier.
        id: String,
    },
    /// A fragment of the tool input JSON.
    ToolUseDelta {
        /// Partial JSON text, to be concatenated by the consumer.
        partial_json: String,
    },
    /// Incremental extended-thinking text.
    ThinkingDelta {
        /// Newly produced thinking text.
        text: String,
    },
    /// A content block finished.
    ContentBlockStop {},
    /// The turn finished normally.
    MessageStop {},
    /// The turn ended with a failure.
    Error {
        /// Human-readable cause.
        reason: String,
    },
}

impl DomainEvent {
    /// Whether this event ends a turn.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MessageStop {} | Self::Error { .. })
    }

    /// Build an [`DomainEvent::Error`] from anything displayable.
    #[must_use]
    pub fn error(reason: impl ToString) -> Self {
        Self::Error {
            reason: reason.to_string(),
        }
    }
}
