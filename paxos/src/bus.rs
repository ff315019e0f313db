//! In-process message bus between node actors.
//!
//! Every node owns an unbounded inbox. A request travels as an [`Envelope`]
//! carrying a oneshot reply slot; a dropped reply slot reads as
//! [`Unreachable`]. One inbox per receiver keeps delivery FIFO for each
//! (sender, receiver) pair, with no ordering across receivers.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::audit::{Action, AuditEvent, AuditSink, Peer};
use crate::cluster::ClusterView;
use crate::core::{NodeId, Request, Response};
use crate::error::Unreachable;

/// A request in flight to a node actor.
pub(crate) struct Envelope<V> {
    pub(crate) from: NodeId,
    pub(crate) request: Request<V>,
    pub(crate) reply: oneshot::Sender<Response<V>>,
}

pub(crate) type Inbox<V> = mpsc::UnboundedReceiver<Envelope<V>>;

/// Outcome of one request: who it went to and what came back.
pub type Delivery<V> = (NodeId, Result<Response<V>, Unreachable>);

/// Responses to a broadcast, yielded in completion order.
///
/// Dropping the stream abandons every request still outstanding.
pub type Responses<V> = FuturesUnordered<BoxFuture<'static, Delivery<V>>>;

struct BusInner<V> {
    view: ClusterView,
    inboxes: BTreeMap<NodeId, mpsc::UnboundedSender<Envelope<V>>>,
    sink: Arc<dyn AuditSink<V>>,
}

/// Delivers requests between nodes, filtered by [`ClusterView`] liveness.
pub struct MessageBus<V> {
    inner: Arc<BusInner<V>>,
}

impl<V> Clone for MessageBus<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> MessageBus<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a bus with one inbox per member of `view`.
    pub(crate) fn new(
        view: ClusterView,
        sink: Arc<dyn AuditSink<V>>,
    ) -> (Self, BTreeMap<NodeId, Inbox<V>>) {
        let mut inboxes = BTreeMap::new();
        let mut receivers = BTreeMap::new();
        for id in view.members() {
            let (tx, rx) = mpsc::unbounded_channel();
            inboxes.insert(id, tx);
            receivers.insert(id, rx);
        }
        let inner = BusInner {
            view,
            inboxes,
            sink,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receivers,
        )
    }

    #[must_use]
    pub fn view(&self) -> &ClusterView {
        &self.inner.view
    }

    /// Send `request` from `from` to `to` and wait for the response.
    ///
    /// Liveness of both ends is checked here and again when the receiver
    /// dequeues the message.
    ///
    /// # Errors
    ///
    /// [`Unreachable`] if either end is not up, the receiver is unknown or
    /// stopped, or it went down before answering.
    pub async fn send(
        &self,
        from: NodeId,
        to: NodeId,
        request: Request<V>,
    ) -> Result<Response<V>, Unreachable> {
        let unreachable = Unreachable { from, to };
        let view = &self.inner.view;

        let action = match &request {
            Request::Prepare(_) => Some(Action::PrepareSend),
            Request::Accept(_) => Some(Action::AcceptSend),
            // learners record the decide themselves
            Request::Decide(_) => None,
        };

        if !view.is_reachable(from) || !view.is_reachable(to) {
            trace!(%from, %to, "not delivering: endpoint not up");
            self.audit(Action::Undelivered, from, to, &request);
            return Err(unreachable);
        }
        let Some(inbox) = self.inner.inboxes.get(&to) else {
            return Err(unreachable);
        };

        if let Some(action) = action {
            self.audit(action, from, to, &request);
        }

        let (reply, response) = oneshot::channel();
        inbox
            .send(Envelope {
                from,
                request,
                reply,
            })
            .map_err(|_| unreachable)?;
        response.await.map_err(|_| unreachable)
    }

    /// Send `request` to every node in `targets` concurrently.
    pub fn broadcast(&self, from: NodeId, targets: &[NodeId], request: &Request<V>) -> Responses<V> {
        targets
            .iter()
            .map(|&to| {
                let bus = self.clone();
                let request = request.clone();
                async move { (to, bus.send(from, to, request).await) }.boxed()
            })
            .collect()
    }

    fn audit(&self, action: Action, from: NodeId, to: NodeId, request: &Request<V>) {
        let view = &self.inner.view;
        let event = AuditEvent::new(
            action,
            Peer::observe(view, from),
            Peer::observe(view, to),
            Some(request.ballot()),
        )
        .with_value(request.value().cloned());
        self.inner.sink.record(event);
    }
}
