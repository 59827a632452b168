//! The per-session actor task.
//!
//! One task owns the transport, the frame buffer, the control router, and
//! the subscriber bookkeeping. Handles talk to it over an unbounded command
//! channel; it multiplexes those commands with subprocess output and the
//! answers of detached control callbacks. Everything that reaches the
//! subprocess's stdin is written from this task.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::models::event::DomainEvent;
use crate::models::state::SessionState;
use crate::protocol::codec::{Frame, FrameBuffer};
use crate::protocol::control::{ControlHandler, ControlRouter};
use crate::protocol::envelope::{to_line, user_message, Inbound};
use crate::protocol::translator::translate;
use crate::session::subscribers::{Removal, Slot, Submission, SubscriberId, Subscribers};
use crate::session::SessionStatus;
use crate::transport::{ExitInfo, ProcessTransport, TransportEvent};
use crate::{AppError, Result};

/// Reason delivered to subscribers released by `close`.
pub const SESSION_CLOSED_REASON: &str = "session closed";

/// Requests from handles to the actor.
pub(crate) enum Command {
    Subscribe {
        reply: oneshot::Sender<Result<(SubscriberId, mpsc::UnboundedReceiver<DomainEvent>)>>,
    },
    Send {
        id: SubscriberId,
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        id: SubscriberId,
    },
    Interrupt {
        reply: oneshot::Sender<Result<oneshot::Receiver<Result<Value>>>>,
    },
    LastResponse {
        reply: oneshot::Sender<Option<String>>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
}

pub(crate) struct SessionActor {
    label: String,
    transport: Box<dyn ProcessTransport>,
    transport_open: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    control_tx: mpsc::UnboundedSender<Value>,
    control_rx: mpsc::UnboundedReceiver<Value>,
    status: watch::Sender<SessionStatus>,
    buffer: FrameBuffer,
    accumulated: String,
    last_response: Option<String>,
    subscribers: Subscribers,
    router: ControlRouter,
}

impl SessionActor {
    pub(crate) fn new(
        label: String,
        transport: Box<dyn ProcessTransport>,
        config: &SessionConfig,
        handler: Option<Arc<dyn ControlHandler>>,
        commands: mpsc::UnboundedReceiver<Command>,
        status: watch::Sender<SessionStatus>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let mut actor = Self {
            label,
            transport,
            transport_open: true,
            commands,
            control_tx,
            control_rx,
            status,
            buffer: FrameBuffer::with_max_bytes(config.max_buffer_bytes),
            accumulated: String::new(),
            last_response: None,
            subscribers: Subscribers::new(),
            router: ControlRouter::new(handler, config.control_timeout()),
        };
        actor.set_state(SessionState::Ready);
        actor
    }

    fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    fn set_state(&mut self, next: SessionState) {
        let current = self.state();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            debug!(session = %self.label, ?current, ?next, "ignoring invalid state transition");
            return;
        }
        debug!(session = %self.label, ?current, ?next, "session state changed");
        self.status.send_modify(|status| status.state = next);
    }

    fn capture_conversation_id(&mut self, id: Option<&str>) {
        let Some(id) = id.filter(|id| !id.is_empty()) else {
            return;
        };
        if self.status.borrow().conversation_id.as_deref() == Some(id) {
            return;
        }
        info!(session = %self.label, conversation_id = id, "conversation id reported");
        self.status
            .send_modify(|status| status.conversation_id = Some(id.to_owned()));
    }

    /// Run until every handle is gone.
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        debug!(session = %self.label, "all handles dropped, shutting down");
                        self.shutdown().await;
                        break;
                    };
                    self.handle_command(cmd).await;
                }
                Some(response) = self.control_rx.recv() => {
                    self.write_control_response(&response).await;
                }
                event = self.transport.poll(), if self.transport_open => {
                    self.on_transport_event(event).await;
                }
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Subscribe { reply } => {
                let _ = reply.send(self.subscribe());
            }
            Command::Send { id, text, reply } => {
                let result = self.send(id, text).await;
                let _ = reply.send(result);
            }
            Command::Unsubscribe { id } => self.unsubscribe(id).await,
            Command::Interrupt { reply } => {
                let result = self.interrupt().await;
                let _ = reply.send(result);
            }
            Command::LastResponse { reply } => {
                let _ = reply.send(self.last_response.clone());
            }
            Command::Close { reply } => {
                self.shutdown().await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            SessionState::Closing | SessionState::Closed => {
                Err(AppError::Closed("session is closed".into()))
            }
            SessionState::Error => Err(AppError::Closed(
                "session failed and no longer accepts work".into(),
            )),
            _ => Ok(()),
        }
    }

    fn subscribe(&mut self) -> Result<(SubscriberId, mpsc::UnboundedReceiver<DomainEvent>)> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (id, active) = self.subscribers.add(tx);
        debug!(session = %self.label, subscriber = %id, active, "subscriber registered");
        Ok((id, rx))
    }

    async fn send(&mut self, id: SubscriberId, text: String) -> Result<()> {
        self.ensure_open()?;
        match self.subscribers.submit(id, text)? {
            Submission::Queued => {
                debug!(session = %self.label, subscriber = %id, "message queued behind active turn");
                Ok(())
            }
            Submission::SendNow(text) => self.transmit(id, &text).await,
        }
    }

    /// Write one user turn for the active subscriber `id`.
    async fn transmit(&mut self, id: SubscriberId, text: &str) -> Result<()> {
        self.set_state(SessionState::Sending);
        debug!(session = %self.label, subscriber = %id, bytes = text.len(), "writing user message");

        match self.write_value(&user_message(text)).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    async fn unsubscribe(&mut self, id: SubscriberId) {
        match self.subscribers.remove(id) {
            Removal::ActiveIdle => {
                debug!(session = %self.label, subscriber = %id, "idle active subscriber left");
                self.advance().await;
            }
            Removal::ActiveAbandoned => {
                debug!(
                    session = %self.label,
                    subscriber = %id,
                    "active subscriber left mid-turn, discarding rest of turn"
                );
            }
            Removal::Queued => {
                debug!(session = %self.label, subscriber = %id, "queued subscriber left");
            }
            Removal::Unknown => {}
        }
    }

    async fn interrupt(&mut self) -> Result<oneshot::Receiver<Result<Value>>> {
        self.ensure_open()?;
        let (request_id, envelope, rx) = self
            .router
            .register_outbound(json!({ "subtype": "interrupt" }));
        info!(session = %self.label, request_id, "sending interrupt");

        if let Err(err) = self.write_value(&envelope).await {
            let _ = self.router.resolve(&request_id, Err(err.clone()));
            self.fail(&err);
            return Err(err);
        }
        Ok(rx)
    }

    // ── Turn flow ────────────────────────────────────────────────────────────

    /// Fill a free active slot from the queue, writing its stored message.
    async fn advance(&mut self) {
        if self.subscribers.active().is_none() {
            if let Some((id, message)) = self.subscribers.promote() {
                debug!(session = %self.label, subscriber = %id, "subscriber promoted");
                if let Some(text) = message {
                    if let Err(err) = self.transmit(id, &text).await {
                        warn!(
                            session = %self.label,
                            subscriber = %id,
                            error = %err,
                            "queued message could not be written"
                        );
                        return;
                    }
                }
            }
        }

        let busy = self.subscribers.active().is_some_and(|slot| slot.is_sent());
        if !busy && self.state().is_turn_in_flight() {
            self.set_state(SessionState::Ready);
        }
    }

    async fn end_turn(&mut self) {
        if let Some(slot) = self.subscribers.finish_turn() {
            debug!(
                session = %self.label,
                subscriber = %slot.id,
                abandoned = slot.is_abandoned(),
                "turn finished"
            );
        }
        self.accumulated.clear();
        self.set_state(SessionState::Ready);
        self.advance().await;
    }

    // ── Transport output ─────────────────────────────────────────────────────

    async fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Stdout(bytes)) => {
                let outcome = self.buffer.push(&bytes);
                for frame in outcome.frames {
                    self.on_frame(frame).await;
                }
                if let Some(err) = outcome.error {
                    self.on_overflow(&err);
                }
            }
            Some(TransportEvent::Stderr(_)) => {}
            Some(TransportEvent::Exited(info)) => {
                for frame in self.buffer.finish().frames {
                    self.on_frame(frame).await;
                }
                self.transport_open = false;
                self.on_exit(&info);
            }
            None => {
                self.transport_open = false;
                self.on_exit(&ExitInfo::default());
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        match Inbound::classify(&frame.value) {
            Inbound::StreamEvent { session_id, .. } => {
                self.capture_conversation_id(session_id.as_deref());
                self.on_stream_event(&frame.value).await;
            }
            Inbound::ControlRequest {
                request_id,
                request,
            } => {
                let deferred = self.router.handle_inbound_request(request_id, &request);
                let tx = self.control_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(deferred.await);
                });
            }
            Inbound::ControlResponse {
                request_id,
                subtype,
                response,
                error,
            } => {
                let outcome = if subtype == "error" {
                    Err(AppError::Control(
                        error.unwrap_or_else(|| "control request failed".into()),
                    ))
                } else {
                    Ok(response.unwrap_or(Value::Null))
                };
                if let Err(err) = self.router.resolve(&request_id, outcome) {
                    warn!(session = %self.label, error = %err, "unmatched control response");
                }
            }
            Inbound::System {
                subtype,
                session_id,
            } => {
                debug!(session = %self.label, subtype, "system frame");
                self.capture_conversation_id(session_id.as_deref());
            }
            Inbound::Result {
                session_id,
                is_error,
            } => {
                debug!(session = %self.label, is_error, "result frame");
                self.capture_conversation_id(session_id.as_deref());
            }
            Inbound::Other { kind } => {
                debug!(session = %self.label, kind, "skipping frame");
            }
        }
    }

    async fn on_stream_event(&mut self, value: &Value) {
        let translation = translate(value, std::mem::take(&mut self.accumulated));
        self.accumulated = translation.accumulated;
        self.capture_conversation_id(translation.conversation_id.as_deref());

        // `None`: nobody holds the wire. `Some(false)`: the active
        // subscriber has not written yet, so this output is not its turn.
        let owner_sent = self.subscribers.active().map(Slot::is_sent);
        if owner_sent == Some(false) {
            self.accumulated.clear();
        } else if let Some(text) = translation.completed {
            self.last_response = Some(text);
        }
        if owner_sent == Some(true) && !translation.events.is_empty() {
            self.set_state(SessionState::Streaming);
        }

        let mut turn_over = false;
        for event in translation.events {
            turn_over |= event.is_terminal();
            match self.subscribers.active_mut() {
                Some(slot) if slot.is_sent() => slot.deliver(event),
                _ => debug!(session = %self.label, ?event, "no turn awaiting output, dropping event"),
            }
        }

        if !turn_over {
            return;
        }
        if owner_sent == Some(false) {
            debug!(
                session = %self.label,
                "terminal event outside any turn, active subscriber keeps its slot"
            );
            return;
        }
        self.end_turn().await;
    }

    fn on_overflow(&mut self, err: &AppError) {
        warn!(session = %self.label, error = %err, "output buffer overflow");
        if let Some(slot) = self.subscribers.active_mut().filter(|slot| slot.is_sent()) {
            slot.deliver(DomainEvent::error(err));
            // Rest of this turn is unreliable; hold the slot until it ends.
            let id = slot.id;
            self.subscribers.remove(id);
        }
    }

    fn on_exit(&mut self, info: &ExitInfo) {
        if self.state() == SessionState::Closed {
            return;
        }
        let in_flight = self
            .subscribers
            .active()
            .is_some_and(|slot| slot.is_sent());

        let (err, log_as_failure) = if info.requested && self.state() == SessionState::Closing {
            (AppError::Closed(SESSION_CLOSED_REASON.into()), false)
        } else if !info.is_success() {
            (AppError::UnexpectedExit(info.describe()), true)
        } else if in_flight {
            (
                AppError::UnexpectedExit(format!("{} before the turn completed", info.describe())),
                true,
            )
        } else {
            (AppError::Closed(info.describe()), false)
        };

        if log_as_failure {
            warn!(session = %self.label, reason = %err, "subprocess exited unexpectedly");
            self.set_state(SessionState::Error);
        } else {
            info!(session = %self.label, reason = %err, "subprocess exited");
        }

        self.release_all(&err);
        self.router.cancel_all(&err);
        self.set_state(SessionState::Closed);
    }

    /// A write failed: the session can no longer make progress.
    fn fail(&mut self, err: &AppError) {
        warn!(session = %self.label, error = %err, "transport write failed");
        self.release_all(err);
        self.router.cancel_all(err);
        self.set_state(SessionState::Error);
    }

    fn release_all(&mut self, err: &AppError) {
        for mut slot in self.subscribers.drain() {
            slot.deliver(DomainEvent::error(err));
        }
        self.accumulated.clear();
    }

    async fn shutdown(&mut self) {
        if self.state() == SessionState::Closed {
            return;
        }
        info!(session = %self.label, "closing session");
        self.set_state(SessionState::Closing);

        if let Err(err) = self.transport.terminate().await {
            warn!(session = %self.label, error = %err, "terminate failed");
        }
        self.transport_open = false;

        let err = AppError::Closed(SESSION_CLOSED_REASON.into());
        for mut slot in self.subscribers.drain() {
            slot.deliver(DomainEvent::error(SESSION_CLOSED_REASON));
        }
        self.accumulated.clear();
        self.router.cancel_all(&err);
        self.set_state(SessionState::Closed);
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    async fn write_value(&mut self, value: &Value) -> Result<()> {
        let line = to_line(value)?;
        self.transport.write(Bytes::from(line)).await
    }

    async fn write_control_response(&mut self, response: &Value) {
        if !matches!(
            self.state(),
            SessionState::Ready | SessionState::Sending | SessionState::Streaming
        ) {
            debug!(session = %self.label, "session not live, dropping control response");
            return;
        }
        if let Err(err) = self.write_value(response).await {
            self.fail(&err);
        }
    }
}
