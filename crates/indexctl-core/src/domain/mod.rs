/// Flow state machine
pub mod flow;

/// Tasks and the task-kind registry
pub mod task;

/// Graph templates
pub mod template;

/// The per-generation flow graph
pub mod flow_graph;

/// Generation identity, steps, job kinds and the persisted document
pub mod generation;

/// Domain events
pub mod events;

/// External collaborator interfaces
pub mod collaborators;
