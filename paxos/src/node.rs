//! Node actors: one task per member, handling its inbox one message at a time.
//!
//! ```text
//! Cluster
//!   ├─► MessageBus (inbox per node, liveness filter, audit)
//!   ├─► NodeActor[1] (AcceptorCore + learner record)
//!   ├─► NodeActor[2]
//!   └─► NodeActor[n]
//! ```
//!
//! A [`Node`] is a cheap handle onto one actor. Proposing happens outside the
//! actor, through a [`Proposer`] built from the handle, so a node can send
//! requests to itself without deadlocking.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use error_stack::Report;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, instrument, trace, warn};

use crate::audit::{Action, AuditEvent, AuditSink, NoopSink, Peer};
use crate::bus::{Envelope, Inbox, MessageBus};
use crate::cluster::{ClusterView, Role, Roles};
use crate::config::{ProposerConfig, Sleep};
use crate::core::{AcceptorCore, Ballot, Decision, NodeId, Proposal, Request, Response};
use crate::error::ProposeError;
use crate::proposer::Proposer;

/// Point-in-time copy of a node's acceptor state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptorSnapshot<V> {
    pub promised: Option<Ballot>,
    pub accepted: Option<Proposal<V>>,
}

/// Handle onto one cluster member.
pub struct Node<V> {
    id: NodeId,
    roles: Roles,
    bus: MessageBus<V>,
    acceptor: Arc<Mutex<AcceptorCore<V>>>,
    decided: watch::Receiver<Option<Decision<V>>>,
    /// Highest ballot sequence this node has minted or observed
    sequence: Arc<AtomicU64>,
}

impl<V> Clone for Node<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            roles: self.roles,
            bus: self.bus.clone(),
            acceptor: self.acceptor.clone(),
            decided: self.decided.clone(),
            sequence: self.sequence.clone(),
        }
    }
}

impl<V> fmt::Debug for Node<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("roles", &self.roles)
            .finish_non_exhaustive()
    }
}

impl<V> Node<V>
where
    V: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn roles(&self) -> Roles {
        self.roles
    }

    #[must_use]
    pub fn bus(&self) -> &MessageBus<V> {
        &self.bus
    }

    #[must_use]
    pub fn view(&self) -> &ClusterView {
        self.bus.view()
    }

    /// The value this node has learned, if any.
    #[must_use]
    pub fn decision(&self) -> Option<Decision<V>> {
        self.decided.borrow().clone()
    }

    /// Wait until this node learns a value.
    ///
    /// Returns `None` if the node's actor stopped first.
    pub async fn wait_for_decision(&self) -> Option<Decision<V>> {
        let mut decided = self.decided.clone();
        let decision = decided.wait_for(Option::is_some).await.ok()?;
        decision.clone()
    }

    #[must_use]
    pub fn acceptor_state(&self) -> AcceptorSnapshot<V> {
        let core = self.acceptor.lock().unwrap_or_else(PoisonError::into_inner);
        AcceptorSnapshot {
            promised: core.promised(),
            accepted: core.accepted().cloned(),
        }
    }

    /// Record a ballot seen from another proposer so the next one minted
    /// here is above it.
    pub fn observe(&self, ballot: Ballot) {
        self.sequence.fetch_max(ballot.sequence, Ordering::AcqRel);
    }

    /// Mint a fresh ballot, strictly above every ballot this node has minted,
    /// observed, or promised as an acceptor.
    ///
    /// Returns `None` once a ballot with the last sequence number has been
    /// minted or seen.
    #[must_use]
    pub fn mint_ballot(&self) -> Option<Ballot> {
        if let Some(promised) = self.acceptor_state().promised {
            self.observe(promised);
        }
        let previous = self
            .sequence
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |seq| seq.checked_add(1))
            .ok()?;
        Ballot::successor(Ballot::new(previous, self.id), self.id)
    }

    /// Build a proposer driving rounds from this node.
    ///
    /// # Errors
    ///
    /// Fails with [`ProposeError::NotProposer`] if the node lacks the role.
    pub fn proposer<S: Sleep, R: Rng>(
        &self,
        config: ProposerConfig<S, R>,
    ) -> Result<Proposer<V, S, R>, Report<ProposeError>> {
        if !self.roles.contains(Role::Proposer) {
            return Err(Report::new(ProposeError::NotProposer)
                .attach(format!("node {} has roles {}", self.id, self.roles)));
        }
        Ok(Proposer::new(self.clone(), config))
    }
}

/// The task behind a [`Node`].
struct NodeActor<V> {
    id: NodeId,
    roles: Roles,
    view: ClusterView,
    sink: Arc<dyn AuditSink<V>>,
    acceptor: Arc<Mutex<AcceptorCore<V>>>,
    decided: watch::Sender<Option<Decision<V>>>,
}

impl<V> NodeActor<V>
where
    V: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    #[instrument(skip_all, name = "node", fields(node_id = %self.id))]
    async fn run(self, mut inbox: Inbox<V>) {
        debug!(roles = %self.roles, "node started");
        while let Some(Envelope {
            from,
            request,
            reply,
        }) = inbox.recv().await
        {
            // Liveness may have changed while the message was queued
            if !self.view.is_reachable(self.id) || !self.view.is_reachable(from) {
                trace!(%from, "dropping message: endpoint not up");
                continue;
            }
            let Some(response) = self.handle(from, request) else {
                continue;
            };
            // The requester may have given up on us
            let _ = reply.send(response);
        }
        debug!("inbox closed, node stopping");
    }

    fn handle(&self, from: NodeId, request: Request<V>) -> Option<Response<V>> {
        match request {
            Request::Prepare(_) | Request::Accept(_) => {
                if !self.roles.contains(Role::Acceptor) {
                    warn!(%from, "not an acceptor, ignoring request");
                    return None;
                }
                let rejected = match request {
                    Request::Prepare(_) => Action::PrepareReject,
                    _ => Action::AcceptReject,
                };
                let response = self
                    .acceptor
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .handle_request(request)?;
                self.audit_response(from, &response, rejected);
                Some(response)
            }
            Request::Decide(proposal) => {
                if !self.roles.contains(Role::Learner) {
                    trace!(%from, "not a learner, ignoring decide");
                    return Some(Response::Learned { decided: None });
                }
                self.learn(from, proposal);
                Some(Response::Learned {
                    decided: self.decided.borrow().clone(),
                })
            }
        }
    }

    /// Record a decided proposal. The first one wins; replays of the same
    /// value are no-ops.
    fn learn(&self, from: NodeId, proposal: Proposal<V>) {
        let ballot = proposal.ballot;
        let changed = self.decided.send_if_modified(|slot| match slot {
            None => {
                debug!(%ballot, value = ?proposal.value, "learned decision");
                *slot = Some(proposal.into());
                true
            }
            Some(existing) if existing.value == proposal.value => {
                trace!(%ballot, "decision already recorded");
                false
            }
            Some(existing) => {
                error!(
                    recorded = ?existing,
                    conflicting = ?proposal,
                    "conflicting decision received, keeping the recorded one"
                );
                false
            }
        });

        if changed {
            let decided = self.decided.borrow().clone();
            let event = AuditEvent::new(
                Action::Decide,
                Peer::observe(&self.view, from),
                Peer::observe(&self.view, self.id),
                Some(ballot),
            )
            .with_value(decided.as_ref().map(|d| d.value.clone()))
            .with_consensus(decided.map(|d| d.value));
            self.sink.record(event);
        }
    }

    /// Audit an acceptor response. `rejected` names the action used if the
    /// response is a rejection, which depends on the request it answers.
    fn audit_response(&self, to: NodeId, response: &Response<V>, rejected: Action) {
        let (action, ballot, value) = match response {
            Response::Promise { ballot, accepted } => (
                Action::PromiseSend,
                *ballot,
                accepted.as_ref().map(|p| p.value.clone()),
            ),
            // carry the promise that caused the rejection
            Response::Reject { promised, .. } => (rejected, *promised, None),
            Response::Accepted { ballot } => (Action::AcceptedSend, *ballot, None),
            Response::Learned { .. } => return,
        };
        let event = AuditEvent::new(
            action,
            Peer::observe(&self.view, self.id),
            Peer::observe(&self.view, to),
            Some(ballot),
        )
        .with_value(value)
        .with_consensus(self.decided.borrow().as_ref().map(|d| d.value.clone()));
        self.sink.record(event);
    }
}

/// A running set of node actors sharing one bus.
///
/// Dropping the cluster stops every actor.
pub struct Cluster<V> {
    view: ClusterView,
    bus: MessageBus<V>,
    nodes: BTreeMap<NodeId, Node<V>>,
    _tasks: JoinSet<()>,
}

impl<V> Cluster<V>
where
    V: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    /// Spawn one actor per member of `view`. Must be called inside a tokio
    /// runtime.
    pub fn start(view: ClusterView, sink: Arc<dyn AuditSink<V>>) -> Self {
        let (bus, inboxes) = MessageBus::new(view.clone(), sink.clone());
        let mut tasks = JoinSet::new();
        let mut nodes = BTreeMap::new();

        for (id, inbox) in inboxes {
            let roles = view.roles(id).unwrap_or_default();
            let acceptor = Arc::new(Mutex::new(AcceptorCore::new()));
            let (decided_tx, decided_rx) = watch::channel(None);

            let actor = NodeActor {
                id,
                roles,
                view: view.clone(),
                sink: sink.clone(),
                acceptor: acceptor.clone(),
                decided: decided_tx,
            };
            tasks.spawn(actor.run(inbox));

            nodes.insert(
                id,
                Node {
                    id,
                    roles,
                    bus: bus.clone(),
                    acceptor,
                    decided: decided_rx,
                    sequence: Arc::new(AtomicU64::new(0)),
                },
            );
        }

        debug!(
            members = nodes.len(),
            quorum = view.quorum_size(),
            "cluster started"
        );
        Self {
            view,
            bus,
            nodes,
            _tasks: tasks,
        }
    }

    /// `n` nodes holding every role, with no audit sink.
    pub fn uniform(n: u64) -> Self {
        Self::start(ClusterView::uniform(n), Arc::new(NoopSink))
    }

    #[must_use]
    pub fn view(&self) -> &ClusterView {
        &self.view
    }

    #[must_use]
    pub fn bus(&self) -> &MessageBus<V> {
        &self.bus
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node<V>> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node<V>> {
        self.nodes.values()
    }

    /// Decisions of every node that has learned one.
    #[must_use]
    pub fn decisions(&self) -> BTreeMap<NodeId, Decision<V>> {
        self.nodes
            .iter()
            .filter_map(|(id, node)| node.decision().map(|d| (*id, d)))
            .collect()
    }
}
