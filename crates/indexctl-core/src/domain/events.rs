use crate::domain::flow::{FlowId, FlowStatus};
use crate::domain::generation::{BuildId, GenerationStep};
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use tracing::{info, warn};

/// Domain event trait for all events in the system
pub trait DomainEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the id of the flow or generation the event is about
    fn subject(&self) -> String;

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Event: a flow moved to a new status
#[derive(Debug, Clone)]
pub struct FlowStatusChanged {
    /// The flow that changed
    pub flow_id: FlowId,

    /// Status before the transition
    pub from: FlowStatus,

    /// Status after the transition
    pub to: FlowStatus,

    /// The timestamp of the transition
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for FlowStatusChanged {
    fn event_type(&self) -> &'static str {
        "flow.status_changed"
    }

    fn subject(&self) -> String {
        self.flow_id.0.clone()
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: a flow was removed from its graph
#[derive(Debug, Clone)]
pub struct FlowRemoved {
    /// The removed flow
    pub flow_id: FlowId,

    /// Status at removal time
    pub final_status: FlowStatus,

    /// Whether the flow's tasks were cleared as well
    pub tasks_cleared: bool,

    /// The timestamp of the removal
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for FlowRemoved {
    fn event_type(&self) -> &'static str {
        "flow.removed"
    }

    fn subject(&self) -> String {
        self.flow_id.0.clone()
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: the generation moved to a new step
#[derive(Debug, Clone)]
pub struct GenerationStepChanged {
    /// The generation
    pub build_id: BuildId,

    /// Step before the transition
    pub from: GenerationStep,

    /// Step after the transition
    pub to: GenerationStep,

    /// The timestamp of the transition
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for GenerationStepChanged {
    fn event_type(&self) -> &'static str {
        "generation.step_changed"
    }

    fn subject(&self) -> String {
        self.build_id.0.clone()
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: the first fatal flow of a generation was observed
#[derive(Debug, Clone)]
pub struct FatalFlowDetected {
    /// The generation
    pub build_id: BuildId,

    /// The fatal flow
    pub flow_id: FlowId,

    /// Recorded error message
    pub message: String,

    /// The timestamp the fatal error was observed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for FatalFlowDetected {
    fn event_type(&self) -> &'static str {
        "generation.fatal_flow"
    }

    fn subject(&self) -> String {
        self.build_id.0.clone()
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Domain event handler
pub trait DomainEventHandler: Send + Sync {
    /// Handle a domain event
    fn handle_event(&self, event: &dyn DomainEvent);
}

/// Handler that writes every event to the log
#[derive(Debug, Default, Clone)]
pub struct LoggingEventHandler;

impl DomainEventHandler for LoggingEventHandler {
    fn handle_event(&self, event: &dyn DomainEvent) {
        if event.event_type() == "generation.fatal_flow" {
            warn!(subject = %event.subject(), event = ?event, "Fatal flow detected");
        } else {
            info!(
                event_type = event.event_type(),
                subject = %event.subject(),
                "Domain event"
            );
        }
    }
}
