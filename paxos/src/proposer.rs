//! Proposer runtime
//!
//! Drives single-slot rounds from one node over the [`MessageBus`]:
//!
//! 1. Mint a fresh ballot and broadcast Prepare to every configured acceptor.
//! 2. On a quorum of promises, broadcast Accept with the selected value.
//! 3. On a quorum of accepts, broadcast Decide to every learner.
//!
//! The round state itself lives in [`ProposerCore`]; this module only moves
//! messages, enforces the round timeout and retries.
//!
//! # Example
//!
//! ```ignore
//! use synod::{Cluster, NodeId, ProposerConfig};
//!
//! let cluster = Cluster::uniform(3);
//! let node = cluster.node(NodeId(1)).unwrap();
//! let mut proposer = node.proposer(ProposerConfig::default())?;
//! let decision = proposer.propose("A").await?;
//! ```
//!
//! [`MessageBus`]: crate::bus::MessageBus

use std::fmt;
use std::pin::pin;
use std::time::Duration;

use error_stack::Report;
use futures::StreamExt;
use rand::Rng;
use rand::rngs::StdRng;
use tracing::{debug, error, instrument, trace};

use crate::bus::Responses;
use crate::cluster::Role;
use crate::config::{BackoffConfig, ProposerConfig, Sleep, TokioSleep};
use crate::core::{
    AcceptPhaseResult, Ballot, Decision, NodeId, PreparePhaseResult, Proposal, ProposerCore,
    Request, Response,
};
use crate::error::{InvalidTransition, ProposeError, Unreachable};
use crate::node::Node;

/// How a single round ended
enum RoundResult<V> {
    Decided(Decision<V>),
    /// A response revealed a higher ballot
    Preempted { by: Ballot },
    /// Timed out, or every acceptor answered without a quorum forming
    NoQuorum {
        phase: &'static str,
        responders: usize,
    },
}

/// What the next response means for the round
enum Step<V> {
    Continue,
    Done(V),
    Preempted(Ballot),
}

/// Drives `propose` calls from one node.
///
/// Each call runs up to `retry_limit + 1` rounds, each with a fresh ballot.
/// Ballots are minted from a counter shared by every proposer of the node,
/// so two proposers of the same node never reuse a ballot.
pub struct Proposer<V, S: Sleep = TokioSleep, R: Rng = StdRng> {
    node: Node<V>,
    retry_limit: u32,
    round_timeout: Duration,
    backoff: BackoffConfig,
    sleep: S,
    rng: R,
}

impl<V, S: Sleep, R: Rng> fmt::Debug for Proposer<V, S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proposer")
            .field("node", &self.node)
            .field("retry_limit", &self.retry_limit)
            .field("round_timeout", &self.round_timeout)
            .finish_non_exhaustive()
    }
}

impl<V, S, R> Proposer<V, S, R>
where
    V: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
    S: Sleep,
    R: Rng,
{
    pub(crate) fn new(node: Node<V>, config: ProposerConfig<S, R>) -> Self {
        debug!(node_id = %node.id(), "creating proposer");
        Self {
            node,
            retry_limit: config.retry_limit,
            round_timeout: config.round_timeout,
            backoff: config.backoff,
            sleep: config.sleep,
            rng: config.rng,
        }
    }

    #[must_use]
    pub fn node(&self) -> &Node<V> {
        &self.node
    }

    /// Drive `value` (or a value already on its way to being chosen) to a
    /// decision.
    ///
    /// The returned value may differ from `value`: if any promiser had already
    /// accepted a proposal, the highest-ballot one is carried forward instead.
    ///
    /// # Errors
    ///
    /// - [`ProposeError::QuorumUnavailable`] if the last round could not
    ///   gather a quorum before its timeout
    /// - [`ProposeError::Preempted`] if the last round was superseded by a
    ///   higher ballot
    /// - [`ProposeError::InvalidTransition`] if the round state machine was
    ///   misused (a defect; never retried)
    /// - [`ProposeError::BallotsExhausted`] if a ballot with the last
    ///   sequence number was already minted or observed
    #[instrument(skip_all, name = "propose", fields(node_id = %self.node.id()))]
    pub async fn propose(&mut self, value: V) -> Result<Decision<V>, Report<ProposeError>> {
        let attempts = self.retry_limit.saturating_add(1);
        let mut failure = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = self.backoff.duration(attempt - 1, &mut self.rng);
                trace!(?backoff, "backing off before retry");
                self.sleep.sleep(backoff).await;
            }

            let Some(ballot) = self.node.mint_ballot() else {
                error!(attempt, "ballot sequence exhausted");
                return Err(Report::new(ProposeError::BallotsExhausted)
                    .attach(format!("node {}", self.node.id())));
            };
            debug!(%ballot, attempt, "starting round");

            let result = match self.run_round(ballot, value.clone()).await {
                Ok(result) => result,
                Err(invalid) => {
                    error!(%ballot, %invalid, "proposer state machine misused");
                    return Err(Report::new(invalid)
                        .change_context(ProposeError::InvalidTransition)
                        .attach(format!("ballot {ballot}")));
                }
            };

            match result {
                RoundResult::Decided(decision) => {
                    debug!(%ballot, value = ?decision.value, attempt, "decided");
                    return Ok(decision);
                }
                RoundResult::Preempted { by } => {
                    debug!(%ballot, %by, "preempted, will retry");
                    self.node.observe(by);
                    failure = Some((
                        ProposeError::Preempted,
                        ballot,
                        format!("preempted by ballot {by}"),
                    ));
                }
                RoundResult::NoQuorum { phase, responders } => {
                    debug!(%ballot, phase, responders, "no quorum, will retry");
                    let quorum = self.node.view().quorum_size();
                    failure = Some((
                        ProposeError::QuorumUnavailable,
                        ballot,
                        format!("{phase}: {responders} of {quorum} required responses"),
                    ));
                }
            }
        }

        let (context, ballot, detail) = failure.unwrap_or((
            ProposeError::QuorumUnavailable,
            Ballot::new(0, self.node.id()),
            "no round attempted".to_owned(),
        ));
        Err(Report::new(context)
            .attach(detail)
            .attach(format!("last ballot {ballot}"))
            .attach(format!("gave up after {attempts} attempts")))
    }

    /// Run one round through both phases with a single timer.
    ///
    /// Returning drops the outstanding response stream, which abandons every
    /// request still in flight.
    async fn run_round(&self, ballot: Ballot, value: V) -> Result<RoundResult<V>, InvalidTransition> {
        let me = self.node.id();
        let view = self.node.view();
        let bus = self.node.bus();
        let acceptors = view.members_with(Role::Acceptor);
        let mut core = ProposerCore::new(ballot, value, view.quorum_size());
        let mut timeout = pin!(self.sleep.sleep(self.round_timeout));
        trace!(quorum = core.quorum(), acceptors = acceptors.len(), "collecting promises");

        // Phase 1: collect promises
        let mut responses = bus.broadcast(me, &acceptors, &Request::Prepare(ballot));
        let chosen = loop {
            let (from, response) = tokio::select! {
                // an expired round takes no more responses
                biased;
                () = &mut timeout => {
                    debug!("prepare phase timed out");
                    return Ok(no_quorum("prepare", &core));
                }
                next = responses.next() => match next {
                    Some(delivery) => delivery,
                    None => return Ok(no_quorum("prepare", &core)),
                },
            };
            let step = match response {
                Ok(Response::Promise {
                    ballot: answered,
                    accepted,
                }) if answered == ballot => match core.handle_promise(from, accepted)? {
                    PreparePhaseResult::Quorum { value } => Step::Done(value),
                    PreparePhaseResult::Pending => Step::Continue,
                },
                other => on_other(&mut core, from, other)?,
            };
            match step {
                Step::Continue => {}
                Step::Done(value) => break value,
                Step::Preempted(by) => return Ok(RoundResult::Preempted { by }),
            }
        };
        drop(responses);

        // Phase 2: collect accepts
        trace!(value = ?chosen, "collecting accepts");
        let proposal = Proposal::new(ballot, chosen);
        let mut responses = bus.broadcast(me, &acceptors, &Request::Accept(proposal));
        let decided = loop {
            let (from, response) = tokio::select! {
                // an expired round takes no more responses
                biased;
                () = &mut timeout => {
                    debug!("accept phase timed out");
                    return Ok(no_quorum("accept", &core));
                }
                next = responses.next() => match next {
                    Some(delivery) => delivery,
                    None => return Ok(no_quorum("accept", &core)),
                },
            };
            let step = match response {
                Ok(Response::Accepted { ballot: answered }) if answered == ballot => {
                    match core.handle_accepted(from)? {
                        AcceptPhaseResult::Decided { proposal } => Step::Done(proposal),
                        AcceptPhaseResult::Pending => Step::Continue,
                    }
                }
                other => on_other(&mut core, from, other)?,
            };
            match step {
                Step::Continue => {}
                Step::Done(proposal) => break proposal,
                Step::Preempted(by) => return Ok(RoundResult::Preempted { by }),
            }
        };
        drop(responses);

        self.announce(&decided).await;
        Ok(RoundResult::Decided(decided.into()))
    }

    /// Tell every learner about the decision. Best effort: unreachable
    /// learners miss it.
    async fn announce(&self, decided: &Proposal<V>) {
        let learners = self.node.view().members_with(Role::Learner);
        let responses: Responses<V> =
            self.node
                .bus()
                .broadcast(self.node.id(), &learners, &Request::Decide(decided.clone()));
        let delivered = responses
            .filter(|(_, response)| std::future::ready(response.is_ok()))
            .count()
            .await;
        debug!(
            ballot = %decided.ballot,
            learners = learners.len(),
            delivered,
            "announced decision"
        );
    }
}

fn no_quorum<V: Clone>(phase: &'static str, core: &ProposerCore<V>) -> RoundResult<V> {
    RoundResult::NoQuorum {
        phase,
        responders: core.responders(),
    }
}

/// Handle a response that is not the one the current phase is waiting for.
fn on_other<V: Clone + fmt::Debug, T>(
    core: &mut ProposerCore<V>,
    from: NodeId,
    response: Result<Response<V>, Unreachable>,
) -> Result<Step<T>, InvalidTransition> {
    match response {
        Err(unreachable) => {
            trace!(%unreachable, "no answer");
            Ok(Step::Continue)
        }
        Ok(Response::Reject { promised, .. }) => match core.handle_reject(promised)? {
            Some(by) => Ok(Step::Preempted(by)),
            None => {
                trace!(%from, %promised, "ignoring stale reject");
                Ok(Step::Continue)
            }
        },
        Ok(other) => {
            trace!(%from, ?other, "ignoring stale response");
            Ok(Step::Continue)
        }
    }
}

/// Propose `value` from `node` with default backoff.
///
/// # Errors
///
/// See [`Proposer::propose`]. Also fails with [`ProposeError::NotProposer`]
/// if `node` does not hold the proposer role.
pub async fn propose<V>(
    node: &Node<V>,
    value: V,
    retry_limit: u32,
    round_timeout: Duration,
) -> Result<Decision<V>, Report<ProposeError>>
where
    V: Clone + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    node.proposer(ProposerConfig::with_limits(retry_limit, round_timeout))?
        .propose(value)
        .await
}
