//! Pure acceptor state machine - no I/O, no async, no synchronization
//!
//! This module contains the core state transition logic for a single-slot
//! Paxos acceptor.

use super::types::{Ballot, Proposal, Request, Response};

/// Pure acceptor state
///
/// Tracks the highest promised ballot (`None` until the first promise) and
/// the highest accepted proposal.
///
/// Invariants:
/// - `promised` never decreases
/// - if `accepted` is set, its ballot is `<= promised`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AcceptorCore<V> {
    promised: Option<Ballot>,
    accepted: Option<Proposal<V>>,
}

impl<V> Default for AcceptorCore<V> {
    fn default() -> Self {
        Self {
            promised: None,
            accepted: None,
        }
    }
}

/// Result of handling a Prepare request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PrepareResult<V> {
    /// Promised - carries the previously accepted proposal, if any
    Promised { accepted: Option<Proposal<V>> },
    /// Rejected - an equal or higher ballot was already promised
    Rejected { promised: Ballot },
}

/// Result of handling an Accept request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcceptResult {
    Accepted,
    /// Rejected - a higher ballot was already promised
    Rejected { promised: Ballot },
}

impl<V: Clone> AcceptorCore<V> {
    /// Create a new empty acceptor state
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest ballot promised so far
    #[must_use]
    pub fn promised(&self) -> Option<Ballot> {
        self.promised
    }

    /// Highest proposal accepted so far
    #[must_use]
    pub fn accepted(&self) -> Option<&Proposal<V>> {
        self.accepted.as_ref()
    }

    /// Handle a Prepare request - pure state transition
    ///
    /// Promises only if `ballot` is strictly greater than anything promised
    /// before. Rejections leave the state untouched and report the current
    /// promise so the proposer can fast-forward.
    pub fn prepare(&mut self, ballot: Ballot) -> PrepareResult<V> {
        match self.promised {
            Some(promised) if promised >= ballot => PrepareResult::Rejected { promised },
            _ => {
                self.promised = Some(ballot);
                PrepareResult::Promised {
                    accepted: self.accepted.clone(),
                }
            }
        }
    }

    /// Handle an Accept request - pure state transition
    ///
    /// Accepts if `ballot >= promised`. Equality is the normal case: the
    /// Prepare for this very ballot raised the watermark.
    pub fn accept(&mut self, proposal: Proposal<V>) -> AcceptResult {
        match self.promised {
            Some(promised) if promised > proposal.ballot => AcceptResult::Rejected { promised },
            _ => {
                self.promised = Some(proposal.ballot);
                self.accepted = Some(proposal);
                AcceptResult::Accepted
            }
        }
    }

    /// Handle an acceptor request and produce a response.
    ///
    /// Convenience wrapper over [`prepare`](Self::prepare) and
    /// [`accept`](Self::accept) with message-based input/output, shared by the
    /// node actor and the model checker. Returns `None` for requests that are
    /// not addressed to the acceptor role.
    pub fn handle_request(&mut self, request: Request<V>) -> Option<Response<V>> {
        match request {
            Request::Prepare(ballot) => Some(match self.prepare(ballot) {
                PrepareResult::Promised { accepted } => Response::Promise { ballot, accepted },
                PrepareResult::Rejected { promised } => Response::Reject { ballot, promised },
            }),
            Request::Accept(proposal) => {
                let ballot = proposal.ballot;
                Some(match self.accept(proposal) {
                    AcceptResult::Accepted => Response::Accepted { ballot },
                    AcceptResult::Rejected { promised } => Response::Reject { ballot, promised },
                })
            }
            Request::Decide(_) => None,
        }
    }
}
