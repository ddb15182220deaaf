//! Live connection outboxes
//!
//! Every open socket gets an unbounded outbox drained by its writer task.
//! Pushes are best effort: a closed outbox means the peer is gone, and the
//! event is dropped with a debug line. Nothing here blocks or retries.

use crate::chat::protocol::ServerEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Opaque handle for one live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// One addressed outbound event
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: ConnectionId,
    pub event: ServerEvent,
}

impl Outbound {
    pub fn new(to: ConnectionId, event: ServerEvent) -> Self {
        Self { to, event }
    }
}

#[derive(Default)]
pub struct ConnectionHub {
    outboxes: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<ServerEvent>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and hand back its outbox receiver.
    pub fn open(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.outboxes.lock().insert(id, tx);
        (id, rx)
    }

    pub fn close(&self, id: ConnectionId) {
        self.outboxes.lock().remove(&id);
    }

    pub fn is_open(&self, id: ConnectionId) -> bool {
        self.outboxes.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.outboxes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Best-effort push. Returns whether the event was queued.
    pub fn push(&self, to: ConnectionId, event: ServerEvent) -> bool {
        let outbox = self.outboxes.lock().get(&to).cloned();
        match outbox {
            Some(tx) => match tx.send(event) {
                Ok(()) => true,
                Err(mpsc::error::SendError(event)) => {
                    debug!("[Hub] Dropped {} for closed connection {}", event.name(), to);
                    false
                }
            },
            None => {
                debug!("[Hub] Dropped {} for unknown connection {}", event.name(), to);
                false
            }
        }
    }

    /// Push a batch in order; returns how many were queued.
    pub fn dispatch(&self, batch: Vec<Outbound>) -> usize {
        batch
            .into_iter()
            .filter(|out| self.push(out.to, out.event.clone()))
            .count()
    }

    /// Push `event` to every open connection except `except`.
    pub fn broadcast(&self, event: &ServerEvent, except: Option<ConnectionId>) -> usize {
        let targets: Vec<ConnectionId> = self
            .outboxes
            .lock()
            .keys()
            .copied()
            .filter(|id| Some(*id) != except)
            .collect();

        targets
            .into_iter()
            .filter(|id| self.push(*id, event.clone()))
            .count()
    }
}
