//! Streaming sessions over one CLI subprocess.
//!
//! A [`SessionHandle`] is a cheap, cloneable reference to a session actor.
//! Callers obtain a [`Subscription`], send exactly one message through it,
//! and read that turn's events back. Concurrent callers are serialized:
//! the next turn is written only after the current one has ended on the
//! wire.

pub mod actor;
pub mod subscribers;

use std::future::poll_fn;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::models::event::DomainEvent;
use crate::models::state::SessionState;
use crate::protocol::control::ControlHandler;
use crate::session::actor::{Command, SessionActor};
use crate::session::subscribers::SubscriberId;
use crate::transport::child::ChildProcessTransport;
use crate::transport::spawner::LaunchSpec;
use crate::transport::ProcessTransport;
use crate::{AppError, Result};

/// Observable session status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// Current lifecycle state.
    pub state: SessionState,
    /// Conversation identifier reported by the subprocess, once known.
    pub conversation_id: Option<String>,
}

/// Handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: String,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    control_timeout: Duration,
}

fn actor_gone() -> AppError {
    AppError::Closed("session actor has stopped".into())
}

impl SessionHandle {
    /// Launch the configured executable and start a session on it.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the subprocess cannot be launched.
    pub fn start(config: &SessionConfig, handler: Option<Arc<dyn ControlHandler>>) -> Result<Self> {
        let spec = LaunchSpec::from_config(config);
        let transport = ChildProcessTransport::spawn(&spec)?;
        Ok(Self::start_with_transport(Box::new(transport), config, handler))
    }

    /// Start a session on an already established transport.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start_with_transport(
        transport: Box<dyn ProcessTransport>,
        config: &SessionConfig,
        handler: Option<Arc<dyn ControlHandler>>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SessionStatus {
            state: SessionState::Starting,
            conversation_id: None,
        });

        let actor = SessionActor::new(
            id.clone(),
            transport,
            config,
            handler,
            command_rx,
            status_tx,
        );
        tokio::spawn(actor.run());
        info!(session = %id, "session started");

        Self {
            id,
            commands,
            status,
            control_timeout: config.control_timeout(),
        }
    }

    /// Local identifier used in logs.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    /// Snapshot of state and conversation id.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Conversation identifier reported by the subprocess, if any yet.
    #[must_use]
    pub fn conversation_id(&self) -> Option<String> {
        self.status.borrow().conversation_id.clone()
    }

    /// Receiver notified on every status change.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Wait until the session reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.status.clone();
        let _ = rx
            .wait_for(|status| status.state == SessionState::Closed)
            .await;
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())
    }

    /// Register a new subscriber.
    ///
    /// The subscriber is active at once if no turn is pending, otherwise it
    /// waits in line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Closed` if the session no longer accepts work.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let (id, events) = self
            .request(|reply| Command::Subscribe { reply })
            .await??;
        Ok(Subscription {
            id,
            events,
            commands: self.commands.clone(),
            finished: false,
        })
    }

    /// Text of the most recently completed turn.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Closed` if the actor has stopped.
    pub async fn last_response(&self) -> Result<Option<String>> {
        self.request(|reply| Command::LastResponse { reply }).await
    }

    /// Ask the subprocess to stop the current turn and wait for its answer.
    ///
    /// # Errors
    ///
    /// - `AppError::Closed` if the session is closed.
    /// - `AppError::ControlTimeout` if no answer arrives in time.
    /// - `AppError::Control` if the subprocess rejects the request.
    pub async fn interrupt(&self) -> Result<Value> {
        let waiter = self
            .request(|reply| Command::Interrupt { reply })
            .await??;
        match tokio::time::timeout(self.control_timeout, waiter).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(actor_gone()),
            Err(_) => Err(AppError::ControlTimeout(format!(
                "interrupt not acknowledged within {}s",
                self.control_timeout.as_secs()
            ))),
        }
    }

    /// Terminate the subprocess and release every subscriber.
    ///
    /// Idempotent: closing a closed session succeeds.
    ///
    /// # Errors
    ///
    /// Reserved for future termination failures; currently always `Ok`.
    pub async fn close(&self) -> Result<()> {
        match self.request(|reply| Command::Close { reply }).await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }
}

/// One caller's claim on a turn.
///
/// Dropping a subscription detaches it: a waiting one leaves the queue, an
/// active one mid-turn has the rest of its events discarded.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    events: mpsc::UnboundedReceiver<DomainEvent>,
    commands: mpsc::UnboundedSender<Command>,
    finished: bool,
}

impl Subscription {
    /// Identifier within the session.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Submit this subscription's message.
    ///
    /// Written immediately when active, stored and written on promotion
    /// when queued.
    ///
    /// # Errors
    ///
    /// - `AppError::Session` if a message was already submitted.
    /// - `AppError::Closed` if the session is closed or failed.
    /// - `AppError::TransportWrite` if writing to the subprocess failed.
    pub async fn send(&mut self, text: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                id: self.id,
                text: text.into(),
                reply,
            })
            .map_err(|_| actor_gone())?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Poll for the next event; `None` after the terminal event.
    pub fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<DomainEvent>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.events.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    /// Next event of this turn; `None` once the turn is over.
    pub async fn next_event(&mut self) -> Option<DomainEvent> {
        poll_fn(|cx| self.poll_event(cx)).await
    }

    /// Whether the terminal event has been observed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.commands.send(Command::Unsubscribe { id: self.id });
        }
    }
}
