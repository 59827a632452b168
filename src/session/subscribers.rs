//! Subscriber arbitration for a single session.
//!
//! At most one subscriber is *active* and receives events; everyone else
//! waits in FIFO order. The active slot is held until the turn it started
//! has ended on the wire, even if its owner walked away, so output of one
//! turn can never reach the owner of the next.

use std::collections::VecDeque;
use std::fmt;

use tokio::sync::mpsc;
use tracing::debug;

use crate::models::event::DomainEvent;
use crate::{AppError, Result};

/// Session-unique subscriber identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Bookkeeping for one subscriber.
#[derive(Debug)]
pub struct Slot {
    /// Identifier handed to the caller.
    pub id: SubscriberId,
    tx: mpsc::UnboundedSender<DomainEvent>,
    /// Message stored while queued, written on promotion.
    pending: Option<String>,
    /// The user message for this slot is on the wire.
    sent: bool,
    /// The owner left mid-turn; events are discarded until the turn ends.
    abandoned: bool,
}

impl Slot {
    /// Whether this slot's message has been written.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// Whether this slot's owner left mid-turn.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.abandoned
    }

    /// Deliver `event` unless the owner is gone.
    pub fn deliver(&mut self, event: DomainEvent) {
        if self.abandoned {
            return;
        }
        if self.tx.send(event).is_err() {
            debug!(subscriber = %self.id, "subscriber receiver dropped, abandoning slot");
            self.abandoned = true;
        }
    }
}

/// Result of [`Subscribers::submit`].
#[derive(Debug, PartialEq, Eq)]
pub enum Submission {
    /// The subscriber is active: write this message now.
    SendNow(String),
    /// The subscriber is queued: the message was stored.
    Queued,
}

/// Result of [`Subscribers::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// A waiting subscriber left; nothing reached the wire.
    Queued,
    /// The active subscriber left before sending; the slot is free.
    ActiveIdle,
    /// The active subscriber left mid-turn; the slot stays until the turn ends.
    ActiveAbandoned,
    /// No such subscriber (already finished or never existed).
    Unknown,
}

/// Active slot plus FIFO queue.
#[derive(Debug, Default)]
pub struct Subscribers {
    active: Option<Slot>,
    queue: VecDeque<Slot>,
    next_id: u64,
}

impl Subscribers {
    /// Empty arbitration state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber delivering to `tx`.
    ///
    /// Returns its id and whether it became active immediately.
    pub fn add(&mut self, tx: mpsc::UnboundedSender<DomainEvent>) -> (SubscriberId, bool) {
        self.next_id += 1;
        let id = SubscriberId(self.next_id);
        let slot = Slot {
            id,
            tx,
            pending: None,
            sent: false,
            abandoned: false,
        };

        if self.active.is_none() {
            self.active = Some(slot);
            (id, true)
        } else {
            self.queue.push_back(slot);
            (id, false)
        }
    }

    /// Current active slot.
    #[must_use]
    pub fn active(&self) -> Option<&Slot> {
        self.active.as_ref()
    }

    /// Current active slot, mutably.
    pub fn active_mut(&mut self) -> Option<&mut Slot> {
        self.active.as_mut()
    }

    /// Number of waiting subscribers.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Whether nobody is active or waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }

    /// Accept `message` from subscriber `id`.
    ///
    /// # Errors
    ///
    /// - [`AppError::Session`] if `id` already sent its one message.
    /// - [`AppError::NotFound`] if `id` is not registered.
    pub fn submit(&mut self, id: SubscriberId, message: String) -> Result<Submission> {
        if let Some(active) = self.active.as_mut().filter(|slot| slot.id == id) {
            if active.sent {
                return Err(AppError::Session(format!(
                    "subscriber {id} already has a turn in flight"
                )));
            }
            active.sent = true;
            return Ok(Submission::SendNow(message));
        }

        let queued = self
            .queue
            .iter_mut()
            .find(|slot| slot.id == id)
            .ok_or_else(|| AppError::NotFound(format!("no subscriber {id}")))?;
        if queued.pending.is_some() {
            return Err(AppError::Session(format!(
                "subscriber {id} already has a queued message"
            )));
        }
        queued.pending = Some(message);
        Ok(Submission::Queued)
    }

    /// Detach subscriber `id`.
    pub fn remove(&mut self, id: SubscriberId) -> Removal {
        if let Some(active) = self.active.as_mut().filter(|slot| slot.id == id) {
            if active.sent {
                active.abandoned = true;
                return Removal::ActiveAbandoned;
            }
            self.active = None;
            return Removal::ActiveIdle;
        }

        match self.queue.iter().position(|slot| slot.id == id) {
            Some(index) => {
                self.queue.remove(index);
                Removal::Queued
            }
            None => Removal::Unknown,
        }
    }

    /// The active turn ended: release its slot.
    ///
    /// A slot whose message was never written has no turn to end and
    /// stays active.
    pub fn finish_turn(&mut self) -> Option<Slot> {
        if self.active.as_ref().is_some_and(|slot| !slot.sent) {
            return None;
        }
        self.active.take()
    }

    /// Move the next waiting subscriber into a free active slot.
    ///
    /// Returns the promoted subscriber and the message it stored while
    /// waiting, already marked as sent.
    pub fn promote(&mut self) -> Option<(SubscriberId, Option<String>)> {
        if self.active.is_some() {
            return None;
        }
        let mut slot = self.queue.pop_front()?;
        let message = slot.pending.take();
        slot.sent = message.is_some();
        let id = slot.id;
        self.active = Some(slot);
        Some((id, message))
    }

    /// Remove everyone, active first, then the queue in order.
    pub fn drain(&mut self) -> Vec<Slot> {
        let mut all: Vec<Slot> = self.active.take().into_iter().collect();
        all.extend(self.queue.drain(..));
        all
    }
}
