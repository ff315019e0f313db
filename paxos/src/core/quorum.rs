//! Quorum arithmetic and response tallies.

use std::collections::BTreeSet;

use super::types::NodeId;

/// Majority of `members` configured acceptors: `members / 2 + 1`.
///
/// Always computed from configured membership, never from the members that
/// happen to be up, so a minority can never form a quorum.
#[must_use]
pub const fn quorum_size(members: usize) -> usize {
    members / 2 + 1
}

/// Set of distinct responders, compared against a quorum threshold.
///
/// Duplicate responses from the same node are counted once.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tally {
    responders: BTreeSet<NodeId>,
    quorum: usize,
}

impl Tally {
    #[must_use]
    pub fn new(quorum: usize) -> Self {
        Self {
            responders: BTreeSet::new(),
            quorum,
        }
    }

    /// Record a responder. Returns `true` once the quorum has been reached.
    pub fn insert(&mut self, node: NodeId) -> bool {
        self.responders.insert(node);
        self.reached()
    }

    #[must_use]
    pub fn reached(&self) -> bool {
        self.responders.len() >= self.quorum
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.responders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.responders.is_empty()
    }

    #[must_use]
    pub fn quorum(&self) -> usize {
        self.quorum
    }
}
