//! Pure state machine core - no I/O, no async
//!
//! This module contains the state transition logic shared between:
//! - The async runtime ([`crate::node`], [`crate::proposer`])
//! - The Stateright model checker tests
//!
//! By keeping this logic free of I/O, the model checker verifies the exact
//! same transitions as the runtime.
//!
//! # Modules
//!
//! - [`types`]: `NodeId`, `Ballot`, `Proposal`, `Decision` and the messages
//! - [`acceptor`]: Acceptor state machine (`AcceptorCore`)
//! - [`proposer`]: Proposer round state machine (`ProposerCore`)
//! - [`quorum`]: Quorum arithmetic (`quorum_size`, `Tally`)

pub mod acceptor;
pub mod proposer;
pub mod quorum;
pub mod types;

pub use acceptor::{AcceptResult, AcceptorCore, PrepareResult};
pub use proposer::{AcceptPhaseResult, PreparePhaseResult, ProposerCore, ProposerPhase};
pub use quorum::{Tally, quorum_size};
pub use types::{Ballot, Decision, NodeId, Proposal, Request, Response};
