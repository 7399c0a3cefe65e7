use thiserror::Error;

/// Core error type for the indexctl control plane
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Bad command input or job not in a step that accepts the command
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Durable write of the generation status failed
    #[error("Persist error: {0}")]
    PersistError(String),

    /// Stored state could not be turned back into a generation
    #[error("Recovery error: {0}")]
    RecoveryError(String),

    /// An upstream flow is gone and its missing action gives no safe default
    #[error("Dependency missing: {0}")]
    DependencyMissingError(String),

    /// A flow or task reported an unrecoverable condition
    #[error("Fatal flow error: {0}")]
    FatalFlowError(String),

    /// Graph template could not be resolved or instantiated
    #[error("Template error: {0}")]
    TemplateError(String),

    /// Status change not allowed by the flow state machine
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Flow not found
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Generation not found
    #[error("Generation not found: {0}")]
    GenerationNotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// External dependency error (checkpoint store, planner, worker table)
    #[error("External dependency error: {0}")]
    ExternalDependencyError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Input/output error
    #[error("Input/output error: {0}")]
    IOError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Whether the caller may retry the same command unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::PersistError(_) | CoreError::ExternalDependencyError(_) | CoreError::IOError(_)
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::TemplateError(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::IOError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}

/// Boolean-plus-message reply handed to request layers
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CommandReply {
    /// Whether the command took effect
    pub success: bool,
    /// Human-readable error message, empty on success
    pub message: String,
}

impl From<Result<(), CoreError>> for CommandReply {
    fn from(result: Result<(), CoreError>) -> Self {
        match result {
            Ok(()) => CommandReply {
                success: true,
                message: String::new(),
            },
            Err(e) => CommandReply {
                success: false,
                message: e.to_string(),
            },
        }
    }
}
