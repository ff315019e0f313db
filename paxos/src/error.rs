//! Error types.
//!
//! Runtime conditions a caller can act on are `error_stack` contexts
//! ([`ProposeError`], [`ClusterError`]). Protocol-level outcomes that stay
//! inside a round ([`Unreachable`], [`InvalidTransition`]) are plain values.

use std::fmt;

use crate::core::NodeId;

/// A message could not be delivered because the sender or receiver is not up.
///
/// This is "no answer", never a protocol decision: the receiving acceptor's
/// state is untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unreachable {
    pub from: NodeId,
    pub to: NodeId,
}

impl fmt::Display for Unreachable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} unreachable from {}", self.to, self.from)
    }
}

impl std::error::Error for Unreachable {}

/// A response was fed to a proposer round in a phase that cannot take it.
///
/// This is a programming defect in the caller of
/// [`ProposerCore`](crate::core::ProposerCore), not a runtime condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub phase: &'static str,
    pub event: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot handle {} while {}", self.event, self.phase)
    }
}

impl std::error::Error for InvalidTransition {}

/// Why a call to `propose` gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposeError {
    /// Fewer than a quorum of acceptors answered within the round timeout,
    /// on every attempt.
    QuorumUnavailable,
    /// Every attempt was preempted by a higher ballot.
    Preempted,
    /// The round state machine was driven incorrectly.
    InvalidTransition,
    /// The node is not configured with the proposer role.
    NotProposer,
    /// Every ballot sequence number has been used.
    BallotsExhausted,
}

impl fmt::Display for ProposeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::QuorumUnavailable => "quorum unavailable",
            Self::Preempted => "preempted by a higher ballot",
            Self::InvalidTransition => "invalid proposer transition",
            Self::NotProposer => "node does not hold the proposer role",
            Self::BallotsExhausted => "no ballot left to mint",
        })
    }
}

impl std::error::Error for ProposeError {}

/// Marker error for membership operations. Use `error_stack::Report<ClusterError>`
/// with attachments for details.
#[derive(Debug)]
pub struct ClusterError;

impl fmt::Display for ClusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cluster membership operation failed")
    }
}

impl std::error::Error for ClusterError {}
