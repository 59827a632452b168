//! Session lifecycle states and transition rules.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a streaming session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Subprocess is being launched.
    Starting,
    /// Idle; no turn on the wire.
    Ready,
    /// A user message was written; no output seen yet for it.
    Sending,
    /// Output for the in-flight turn is arriving.
    Streaming,
    /// Shutdown requested; subprocess is being terminated.
    Closing,
    /// Terminal state. No further operations are valid.
    Closed,
    /// Transport failure. Only cleanup to `Closed` is permitted.
    Error,
}

impl SessionState {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{Closed, Closing, Error, Ready, Sending, Starting, Streaming};

        match (self, next) {
            (Closed, _) => false,
            (Error, Closed) => true,
            (Error, _) => false,
            (_, Error) => true,
            (Starting, Ready)
            | (Ready | Streaming, Sending)
            | (Sending, Streaming)
            | (Sending | Streaming, Ready)
            | (Starting | Ready | Sending | Streaming, Closing | Closed)
            | (Closing, Closed) => true,
            _ => false,
        }
    }

    /// Whether the session has stopped accepting work.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closing | Self::Closed | Self::Error)
    }

    /// Whether a turn is currently on the wire.
    #[must_use]
    pub fn is_turn_in_flight(self) -> bool {
        matches!(self, Self::Sending | Self::Streaming)
    }
}
