//! Single-slot Paxos consensus library
//!
//! A set of nodes agrees on exactly one value despite crashed or partitioned
//! members and concurrently competing proposers.
//!
//! # Architecture
//!
//! - **Acceptors**: Promise ballots and accept proposals ([`core::AcceptorCore`])
//! - **Proposers**: Drive rounds to a decision ([`Proposer`], [`core::ProposerCore`])
//! - **Learners**: Record the decided value once ([`Node::decision`])
//!
//! Every member runs as a tokio task with its own inbox ([`Cluster`]).
//! Messages travel over an in-process [`MessageBus`] that drops anything sent
//! to or from a member whose [`Liveness`] is not `Up`. Every message attempt
//! and decision is reported to an injected [`AuditSink`].
//!
//! # Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use synod::{Cluster, Liveness, NodeId, propose};
//!
//! let cluster = Cluster::uniform(3);
//! cluster.view().set_liveness(NodeId(3), Liveness::Down)?;
//!
//! let node = cluster.node(NodeId(1)).unwrap();
//! let decision = propose(node, "A", 3, Duration::from_millis(200)).await?;
//! assert_eq!(decision.value, "A");
//! ```

#![warn(clippy::pedantic)]

pub mod audit;
pub mod bus;
pub mod cluster;
pub mod config;
pub mod core;
pub mod error;
pub mod node;
pub mod proposer;

pub use audit::{
    Action, AuditEvent, AuditSink, ChannelSink, MemorySink, NoopSink, Peer, TracingSink,
};
pub use bus::{Delivery, MessageBus, Responses};
pub use cluster::{ClusterView, Liveness, Member, Role, Roles};
pub use config::{BackoffConfig, ProposerConfig, Sleep, TokioSleep};
pub use crate::core::{Ballot, Decision, NodeId, Proposal, Request, Response};
pub use error::{ClusterError, InvalidTransition, ProposeError, Unreachable};
pub use node::{AcceptorSnapshot, Cluster, Node};
pub use proposer::{Proposer, propose};
