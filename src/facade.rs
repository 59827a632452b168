//! Top-level convenience API.
//!
//! ```no_run
//! use agent_duplex::facade::{close_session, send_message, start_session};
//! use agent_duplex::SessionConfig;
//!
//! # async fn demo() -> agent_duplex::Result<()> {
//! let session = start_session(&SessionConfig::new("claude"), None)?;
//! let reply = send_message(&session, "Hello").await?.collect_text().await?;
//! println!("{reply}");
//! close_session(&session).await?;
//! # Ok(())
//! # }
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;

use crate::config::SessionConfig;
use crate::models::event::DomainEvent;
use crate::protocol::control::ControlHandler;
use crate::session::{SessionHandle, Subscription};
use crate::{AppError, Result};

/// Launch the subprocess described by `config` and start a session on it.
///
/// `handler` answers control requests (tool permissions, hooks); without
/// one, permission checks are denied.
///
/// # Errors
///
/// Returns `AppError::Spawn` if the executable cannot be started.
pub fn start_session(
    config: &SessionConfig,
    handler: Option<Arc<dyn ControlHandler>>,
) -> Result<SessionHandle> {
    SessionHandle::start(config, handler)
}

/// Send `text` as one user turn and stream that turn's events.
///
/// If another turn is in flight the message waits its turn; the returned
/// stream stays silent until then.
///
/// # Errors
///
/// Returns `AppError::Closed` if the session is closed, or the transport
/// error if writing fails.
pub async fn send_message(session: &SessionHandle, text: &str) -> Result<TurnStream> {
    let mut subscription = session.subscribe().await?;
    subscription.send(text).await?;
    Ok(TurnStream { subscription })
}

/// Terminate the session and release every waiting caller.
///
/// # Errors
///
/// See [`SessionHandle::close`].
pub async fn close_session(session: &SessionHandle) -> Result<()> {
    session.close().await
}

/// Conversation identifier reported by the subprocess, once known.
#[must_use]
pub fn get_session_id(session: &SessionHandle) -> Option<String> {
    session.conversation_id()
}

/// Events of one turn, ending after `message_stop` or `error`.
#[derive(Debug)]
pub struct TurnStream {
    subscription: Subscription,
}

impl TurnStream {
    /// Next event; `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<DomainEvent> {
        self.subscription.next_event().await
    }

    /// Drain the turn and return the concatenated text deltas.
    ///
    /// # Errors
    ///
    /// - `AppError::Session` carrying the reason if the turn ended in `error`.
    /// - `AppError::Closed` if the stream ended without a terminal event.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(event) = self.next_event().await {
            match event {
                DomainEvent::TextDelta { text: delta } => text.push_str(&delta),
                DomainEvent::MessageStop {} => return Ok(text),
                DomainEvent::Error { reason } => return Err(AppError::Session(reason)),
                _ => {}
            }
        }
        Err(AppError::Closed(
            "event stream ended before the turn completed".into(),
        ))
    }
}

impl Stream for TurnStream {
    type Item = DomainEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.subscription.poll_event(cx)
    }
}
