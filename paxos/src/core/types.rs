//! Core type definitions for the protocol
//!
//! These types are shared between the async runtime and the model checker.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Identity of a cluster member.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Ordering key for proposal attempts - compares by (`sequence`, `node`).
///
/// Field order matters: the derived `Ord` is lexicographic, so the node id
/// only breaks ties between equal sequence numbers. Two ballots are equal
/// only when both fields are.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Ballot {
    /// Per-proposer monotonic counter
    pub sequence: u64,
    /// Proposer that minted the ballot
    pub node: NodeId,
}

impl Ballot {
    /// Mint a ballot.
    #[must_use]
    pub const fn new(sequence: u64, node: NodeId) -> Self {
        Self { sequence, node }
    }

    /// The next ballot `node` should try after observing `observed`.
    ///
    /// Always strictly greater than `observed`, or `None` once the sequence
    /// space is used up.
    #[must_use]
    pub const fn successor(observed: Ballot, node: NodeId) -> Option<Self> {
        match observed.sequence.checked_add(1) {
            Some(sequence) => Some(Self::new(sequence, node)),
            None => None,
        }
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.sequence, self.node.0)
    }
}

/// A candidate value tagged with the ballot proposing it.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Proposal<V> {
    pub ballot: Ballot,
    pub value: V,
}

impl<V> Proposal<V> {
    #[must_use]
    pub const fn new(ballot: Ballot, value: V) -> Self {
        Self { ballot, value }
    }
}

/// The externally observable outcome of a slot: the decided value and the
/// ballot that decided it.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Decision<V> {
    pub value: V,
    pub ballot: Ballot,
}

impl<V> From<Proposal<V>> for Decision<V> {
    fn from(Proposal { ballot, value }: Proposal<V>) -> Self {
        Self { value, ballot }
    }
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Request carried by the message bus.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Request<V> {
    /// Phase 1a
    Prepare(Ballot),
    /// Phase 2a
    Accept(Proposal<V>),
    /// Announce a decided value to a learner
    Decide(Proposal<V>),
}

impl<V> Request<V> {
    /// Ballot the request is tagged with.
    #[must_use]
    pub fn ballot(&self) -> Ballot {
        match self {
            Self::Prepare(ballot) => *ballot,
            Self::Accept(p) | Self::Decide(p) => p.ballot,
        }
    }

    /// Value the request carries, if any.
    #[must_use]
    pub fn value(&self) -> Option<&V> {
        match self {
            Self::Prepare(_) => None,
            Self::Accept(p) | Self::Decide(p) => Some(&p.value),
        }
    }
}

/// Response carried by the message bus.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Response<V> {
    /// Phase 1b: the acceptor promised `ballot` and reports what it accepted
    /// before, if anything.
    Promise {
        ballot: Ballot,
        accepted: Option<Proposal<V>>,
    },
    /// Phase 2b
    Accepted { ballot: Ballot },
    /// The acceptor already promised `promised`, which is at least `ballot`.
    Reject { ballot: Ballot, promised: Ballot },
    /// The learner's record after handling a decide (`None` for nodes
    /// without the learner role).
    Learned { decided: Option<Decision<V>> },
}
