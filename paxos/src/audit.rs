//! Structured audit events and the injected sinks that consume them.
//!
//! The protocol emits one [`AuditEvent`] per message attempt and per decision.
//! Sinks are write-only: they must not block, and nothing they do can change
//! a protocol outcome.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::cluster::{ClusterView, Liveness, Roles};
use crate::core::{Ballot, NodeId};

/// What happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Action {
    PrepareSend,
    PrepareReject,
    PromiseSend,
    AcceptSend,
    AcceptReject,
    AcceptedSend,
    Decide,
    /// The bus refused a message because an endpoint was not up
    Undelivered,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One side of an event, as seen when the event was recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Peer {
    pub id: NodeId,
    pub roles: Roles,
    pub liveness: Liveness,
}

impl Peer {
    /// Snapshot `id` from the view. Unknown ids show no roles and `Down`.
    #[must_use]
    pub fn observe(view: &ClusterView, id: NodeId) -> Self {
        match view.member(id) {
            Some(member) => Self {
                id,
                roles: member.roles,
                liveness: member.liveness,
            },
            None => Self {
                id,
                roles: Roles::NONE,
                liveness: Liveness::Down,
            },
        }
    }
}

/// A structured audit record.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AuditEvent<V> {
    /// Ballot sequence the event belongs to (0 when there is none)
    pub round: u64,
    pub timestamp: SystemTime,
    pub from: Peer,
    pub to: Peer,
    pub action: Action,
    /// Ballot carried by the message
    pub ballot: Option<Ballot>,
    /// Value carried by the message
    pub value: Option<V>,
    /// Value the emitting node has recorded as decided, if any
    pub consensus_value: Option<V>,
    pub consensus_reached: bool,
}

impl<V> AuditEvent<V> {
    #[must_use]
    pub fn new(action: Action, from: Peer, to: Peer, ballot: Option<Ballot>) -> Self {
        Self {
            round: ballot.map_or(0, |b| b.sequence),
            timestamp: SystemTime::now(),
            from,
            to,
            action,
            ballot,
            value: None,
            consensus_value: None,
            consensus_reached: false,
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: Option<V>) -> Self {
        self.value = value;
        self
    }

    #[must_use]
    pub fn with_consensus(mut self, value: Option<V>) -> Self {
        self.consensus_reached = value.is_some();
        self.consensus_value = value;
        self
    }
}

/// Consumer of audit events.
pub trait AuditSink<V>: Send + Sync {
    /// Fire-and-forget. Must return promptly.
    fn record(&self, event: AuditEvent<V>);
}

impl<V, T: AuditSink<V> + ?Sized> AuditSink<V> for Arc<T> {
    fn record(&self, event: AuditEvent<V>) {
        (**self).record(event);
    }
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl<V> AuditSink<V> for NoopSink {
    fn record(&self, _event: AuditEvent<V>) {}
}

/// Keeps every event in memory.
pub struct MemorySink<V> {
    events: Arc<Mutex<Vec<AuditEvent<V>>>>,
}

impl<V> Clone for MemorySink<V> {
    fn clone(&self) -> Self {
        Self {
            events: self.events.clone(),
        }
    }
}

impl<V> Default for MemorySink<V> {
    fn default() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<V: Clone> MemorySink<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far, in record order.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent<V>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events with the given action.
    #[must_use]
    pub fn with_action(&self, action: Action) -> Vec<AuditEvent<V>> {
        self.events()
            .into_iter()
            .filter(|e| e.action == action)
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl<V: Send> AuditSink<V> for MemorySink<V> {
    fn record(&self, event: AuditEvent<V>) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Emits each event as a structured `tracing` event at `info`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl<V: fmt::Debug> AuditSink<V> for TracingSink {
    fn record(&self, event: AuditEvent<V>) {
        info!(
            target: "synod::audit",
            round = event.round,
            action = %event.action,
            from = %event.from.id,
            from_roles = %event.from.roles,
            from_liveness = %event.from.liveness,
            to = %event.to.id,
            to_roles = %event.to.roles,
            to_liveness = %event.to.liveness,
            ballot = ?event.ballot,
            value = ?event.value,
            consensus_value = ?event.consensus_value,
            consensus_reached = event.consensus_reached,
        );
    }
}

/// Forwards events to an unbounded channel, e.g. for a task that writes them
/// out. Events are dropped once the receiver is gone.
pub struct ChannelSink<V> {
    tx: mpsc::UnboundedSender<AuditEvent<V>>,
}

impl<V> ChannelSink<V> {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AuditEvent<V>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl<V: Send> AuditSink<V> for ChannelSink<V> {
    fn record(&self, event: AuditEvent<V>) {
        // No receiver is not our problem
        let _ = self.tx.send(event);
    }
}
