//!
//! indexctl Core - Control plane of the distributed index-build service
//!
//! This crate holds the flow state machine, the per-generation flow graph,
//! the generation lifecycle and the transactional commit loop that keeps
//! each job's durable status in step with its in-memory state. Storage,
//! worker liveness, checkpoints and resource planning are reached only
//! through the collaborator traits in [`domain::collaborators`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - flows, tasks, templates, the flow graph and generations
pub mod domain;

/// Application services - commit loop, state machine, keepers and controller
pub mod application;

/// Controller configuration
pub mod config;

/// Error types
pub mod error;

#[cfg(test)]
mod test_support;

// Re-export key types
pub use config::ControllerConfig;
pub use error::{CommandReply, CoreError};

pub use application::controller::{GenerationController, GenerationServicesFactory, RecoveryReport};
pub use application::keeper::{GenerationKeeper, GenerationStatus};
pub use application::state_machine::{GenerationServices, GenerationStateMachine, WorkerPlan};
pub use domain::flow::{Flow, FlowId, FlowStatus, MissingAction, WaitMask};
pub use domain::flow_graph::{FlowGraph, FlowSummary, GraphContext};
pub use domain::generation::{BuildId, GenerationStep, JobKind, RollbackTarget};
pub use domain::task::{Task, TaskId, TaskKindRegistry, TaskStatus};
