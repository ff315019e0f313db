//! Cluster membership, capability roles and liveness.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use error_stack::Report;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{NodeId, quorum_size};
use crate::error::ClusterError;

/// Liveness of a member, mutated from outside to simulate faults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Liveness {
    #[default]
    Up,
    /// Crashed: sends nothing, receives nothing
    Down,
    /// Running but cut off from the rest of the cluster
    Blocked,
}

impl Liveness {
    #[must_use]
    pub fn is_up(self) -> bool {
        matches!(self, Self::Up)
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Blocked => "blocked",
        })
    }
}

/// A capability a node can hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Role {
    Acceptor,
    Proposer,
    Learner,
}

impl Role {
    const fn bit(self) -> u8 {
        match self {
            Self::Acceptor => 1,
            Self::Proposer => 1 << 1,
            Self::Learner => 1 << 2,
        }
    }
}

/// Set of [`Role`]s held by one node.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct Roles(u8);

impl Roles {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0b111);

    #[must_use]
    pub const fn with(self, role: Role) -> Self {
        Self(self.0 | role.bit())
    }

    #[must_use]
    pub const fn contains(self, role: Role) -> bool {
        self.0 & role.bit() != 0
    }

    pub fn iter(self) -> impl Iterator<Item = Role> {
        [Role::Acceptor, Role::Proposer, Role::Learner]
            .into_iter()
            .filter(move |role| self.contains(*role))
    }
}

impl From<Role> for Roles {
    fn from(role: Role) -> Self {
        Self::NONE.with(role)
    }
}

impl FromIterator<Role> for Roles {
    fn from_iter<T: IntoIterator<Item = Role>>(iter: T) -> Self {
        iter.into_iter().fold(Self::NONE, Self::with)
    }
}

impl fmt::Debug for Roles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for Roles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for role in self.iter() {
            if !first {
                f.write_str("+")?;
            }
            first = false;
            f.write_str(match role {
                Role::Acceptor => "acceptor",
                Role::Proposer => "proposer",
                Role::Learner => "learner",
            })?;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// One configured member.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Member {
    pub id: NodeId,
    pub roles: Roles,
    pub liveness: Liveness,
}

/// Shared view of membership and liveness.
///
/// Cloning gives another handle onto the same view. Membership is fixed at
/// construction; liveness is mutable through [`set_liveness`](Self::set_liveness)
/// and read on every delivery, never inferred from message outcomes.
#[derive(Clone)]
pub struct ClusterView {
    members: Arc<RwLock<BTreeMap<NodeId, Member>>>,
    acceptors: usize,
}

impl fmt::Debug for ClusterView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterView")
            .field("members", &*self.read())
            .field("quorum", &self.quorum_size())
            .finish()
    }
}

impl ClusterView {
    /// Create a view where every member starts up.
    #[must_use]
    pub fn new(members: impl IntoIterator<Item = (NodeId, Roles)>) -> Self {
        let members: BTreeMap<NodeId, Member> = members
            .into_iter()
            .map(|(id, roles)| {
                let member = Member {
                    id,
                    roles,
                    liveness: Liveness::Up,
                };
                (id, member)
            })
            .collect();
        let acceptors = members
            .values()
            .filter(|m| m.roles.contains(Role::Acceptor))
            .count();
        Self {
            members: Arc::new(RwLock::new(members)),
            acceptors,
        }
    }

    /// `n` members with ids `1..=n`, each holding every role.
    #[must_use]
    pub fn uniform(n: u64) -> Self {
        Self::new((1..=n).map(|id| (NodeId(id), Roles::ALL)))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<NodeId, Member>> {
        self.members.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Majority of configured acceptors. Unaffected by liveness.
    #[must_use]
    pub fn quorum_size(&self) -> usize {
        quorum_size(self.acceptors)
    }

    /// Number of configured members holding the acceptor role.
    #[must_use]
    pub fn configured_acceptors(&self) -> usize {
        self.acceptors
    }

    /// Whether messages to and from `id` are currently delivered.
    #[must_use]
    pub fn is_reachable(&self, id: NodeId) -> bool {
        self.read().get(&id).is_some_and(|m| m.liveness.is_up())
    }

    #[must_use]
    pub fn live_members(&self) -> BTreeSet<NodeId> {
        self.read()
            .values()
            .filter(|m| m.liveness.is_up())
            .map(|m| m.id)
            .collect()
    }

    #[must_use]
    pub fn members(&self) -> Vec<NodeId> {
        self.read().keys().copied().collect()
    }

    /// Every configured member holding `role`, regardless of liveness.
    #[must_use]
    pub fn members_with(&self, role: Role) -> Vec<NodeId> {
        self.read()
            .values()
            .filter(|m| m.roles.contains(role))
            .map(|m| m.id)
            .collect()
    }

    #[must_use]
    pub fn member(&self, id: NodeId) -> Option<Member> {
        self.read().get(&id).copied()
    }

    #[must_use]
    pub fn liveness(&self, id: NodeId) -> Option<Liveness> {
        self.member(id).map(|m| m.liveness)
    }

    #[must_use]
    pub fn roles(&self, id: NodeId) -> Option<Roles> {
        self.member(id).map(|m| m.roles)
    }

    /// Fault injection: takes effect on the next message involving `id`.
    ///
    /// Returns the previous liveness.
    ///
    /// # Errors
    ///
    /// Fails if `id` is not a configured member.
    pub fn set_liveness(
        &self,
        id: NodeId,
        liveness: Liveness,
    ) -> Result<Liveness, Report<ClusterError>> {
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        let Some(member) = members.get_mut(&id) else {
            return Err(Report::new(ClusterError).attach(format!("unknown member {id}")));
        };
        let previous = std::mem::replace(&mut member.liveness, liveness);
        debug!(node_id = %id, %previous, %liveness, "liveness changed");
        Ok(previous)
    }
}
