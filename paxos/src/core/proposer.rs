//! Pure proposer state machine - no I/O, no async
//!
//! This module contains the core state transition logic for one proposer
//! round. A round starts in `Preparing` and ends in `Decided` or
//! `Preempted`; a retired round is never reused, the runtime builds a fresh
//! [`ProposerCore`] with a higher ballot instead.

use std::collections::BTreeMap;

use super::quorum::Tally;
use super::types::{Ballot, NodeId, Proposal};
use crate::error::InvalidTransition;

/// Pure proposer state - tracks phase and quorum for a single round
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProposerCore<V> {
    /// Ballot of this round
    ballot: Ballot,
    /// Value being proposed (or adopted from a previously accepted proposal)
    value: V,
    /// Current phase
    phase: ProposerPhase<V>,
    /// Quorum size
    quorum: usize,
}

/// Proposer phase
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProposerPhase<V> {
    /// Collecting promises (Phase 1)
    Preparing {
        /// Map from acceptor ID to the proposal it reported as accepted
        promises: BTreeMap<NodeId, Option<Proposal<V>>>,
    },
    /// Collecting accepts (Phase 2)
    Proposing { accepts: Tally },
    /// Quorum accepted the value
    Decided,
    /// Superseded by a higher ballot
    Preempted { by: Ballot },
}

impl<V> ProposerPhase<V> {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Preparing { .. } => "preparing",
            Self::Proposing { .. } => "proposing",
            Self::Decided => "decided",
            Self::Preempted { .. } => "preempted",
        }
    }
}

/// Result of processing a response during the Prepare phase
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreparePhaseResult<V> {
    /// Need more promises
    Pending,
    /// Got quorum - ready to send Accept with this value
    Quorum {
        /// The value to propose (may be adopted from a previous accept)
        value: V,
    },
}

/// Result of processing a response during the Accept phase
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AcceptPhaseResult<V> {
    /// Need more accepts
    Pending,
    /// Got quorum - value is decided
    Decided { proposal: Proposal<V> },
}

impl<V: Clone> ProposerCore<V> {
    /// Create a new proposer core in the Preparing phase
    #[must_use]
    pub fn new(ballot: Ballot, value: V, quorum: usize) -> Self {
        Self {
            ballot,
            value,
            phase: ProposerPhase::Preparing {
                promises: BTreeMap::new(),
            },
            quorum,
        }
    }

    #[must_use]
    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    /// The value this round proposes. After the Prepare quorum this is the
    /// selected value, which may differ from the caller's.
    #[must_use]
    pub fn value(&self) -> &V {
        &self.value
    }

    #[must_use]
    pub fn phase(&self) -> &ProposerPhase<V> {
        &self.phase
    }

    #[must_use]
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Number of distinct responders counted in the current phase.
    #[must_use]
    pub fn responders(&self) -> usize {
        match &self.phase {
            ProposerPhase::Preparing { promises } => promises.len(),
            ProposerPhase::Proposing { accepts } => accepts.len(),
            ProposerPhase::Decided | ProposerPhase::Preempted { .. } => 0,
        }
    }

    #[must_use]
    pub fn is_decided(&self) -> bool {
        matches!(self.phase, ProposerPhase::Decided)
    }

    #[must_use]
    pub fn is_preempted(&self) -> bool {
        matches!(self.phase, ProposerPhase::Preempted { .. })
    }

    fn invalid(&self, event: &'static str) -> InvalidTransition {
        InvalidTransition {
            phase: self.phase.name(),
            event,
        }
    }

    /// Process a promise for this round's ballot.
    ///
    /// On quorum, selects the value of the highest-ballot proposal reported
    /// by any promiser, falling back to the caller's value, and moves to
    /// `Proposing`.
    ///
    /// # Errors
    ///
    /// Fails if the round is not `Preparing`.
    pub fn handle_promise(
        &mut self,
        acceptor: NodeId,
        accepted: Option<Proposal<V>>,
    ) -> Result<PreparePhaseResult<V>, InvalidTransition> {
        let ProposerPhase::Preparing { promises } = &mut self.phase else {
            return Err(self.invalid("promise"));
        };

        promises.insert(acceptor, accepted);
        if promises.len() < self.quorum {
            return Ok(PreparePhaseResult::Pending);
        }

        if let Some(highest) = promises
            .values()
            .flatten()
            .max_by_key(|proposal| proposal.ballot)
        {
            self.value = highest.value.clone();
        }

        self.phase = ProposerPhase::Proposing {
            accepts: Tally::new(self.quorum),
        };
        Ok(PreparePhaseResult::Quorum {
            value: self.value.clone(),
        })
    }

    /// Process an Accepted for this round's ballot.
    ///
    /// Once decided, a replayed Accepted reports the same decision again
    /// without changing state.
    ///
    /// # Errors
    ///
    /// Fails if the round is `Preparing` or was preempted.
    pub fn handle_accepted(
        &mut self,
        acceptor: NodeId,
    ) -> Result<AcceptPhaseResult<V>, InvalidTransition> {
        let accepts = match &mut self.phase {
            ProposerPhase::Proposing { accepts } => accepts,
            ProposerPhase::Decided => {
                return Ok(AcceptPhaseResult::Decided {
                    proposal: Proposal::new(self.ballot, self.value.clone()),
                });
            }
            ProposerPhase::Preparing { .. } | ProposerPhase::Preempted { .. } => {
                return Err(self.invalid("accepted"));
            }
        };

        if !accepts.insert(acceptor) {
            return Ok(AcceptPhaseResult::Pending);
        }

        self.phase = ProposerPhase::Decided;
        Ok(AcceptPhaseResult::Decided {
            proposal: Proposal::new(self.ballot, self.value.clone()),
        })
    }

    /// Process a rejection carrying the acceptor's current promise.
    ///
    /// Returns the ballot the round was preempted by, or `None` if the
    /// reported ballot does not supersede ours (a stale or duplicated
    /// request) or the round already decided.
    ///
    /// # Errors
    ///
    /// Fails if the round was already preempted.
    pub fn handle_reject(&mut self, promised: Ballot) -> Result<Option<Ballot>, InvalidTransition> {
        match self.phase {
            ProposerPhase::Preparing { .. } | ProposerPhase::Proposing { .. } => {}
            ProposerPhase::Decided => return Ok(None),
            ProposerPhase::Preempted { .. } => return Err(self.invalid("reject")),
        }

        if promised < self.ballot {
            return Ok(None);
        }
        self.phase = ProposerPhase::Preempted { by: promised };
        Ok(Some(promised))
    }
}
