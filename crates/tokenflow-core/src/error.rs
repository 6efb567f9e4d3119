use thiserror::Error;

use crate::domain::flow_node_instance::StateCategory;
use crate::domain::process_instance::FlowNodeInstanceId;

/// Core error type for the Tokenflow runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Process definition not found
    #[error("Process definition not found: {0}")]
    ProcessDefinitionNotFound(String),

    /// Process instance not found
    #[error("Process instance not found: {0}")]
    ProcessInstanceNotFound(String),

    /// Flow node instance not found
    #[error("Flow node instance not found: {0}")]
    FlowNodeInstanceNotFound(String),

    /// Token not found
    #[error("Token not found: process instance {process_instance_id}, ref {ref_id}")]
    TokenNotFound {
        /// Owning process instance
        process_instance_id: u64,
        /// Reference id looked up
        ref_id: u64,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// No transition exists from the current state
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// The state category may only move forward
    #[error("Invalid state category transition from {from:?} to {to:?}")]
    InvalidStateCategoryTransition {
        /// Current category
        from: StateCategory,
        /// Requested category
        to: StateCategory,
    },

    /// The operation is not allowed in the current state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Recorder/persistence failure
    #[error(transparent)]
    Recorder(#[from] RecorderError),

    /// Scheduler failure
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// A flow node state failed to execute
    #[error(transparent)]
    ActivityStateExecution(#[from] ActivityStateExecutionError),

    /// Dispatching a flow node to the work queue failed
    #[error("Dispatch error: {0}")]
    DispatchError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Whether re-running the whole unit of work may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Recorder(e) => e.is_retryable(),
            CoreError::ActivityStateExecution(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::SerializationError(err.to_string())
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

/// Errors raised by the persistence collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecorderError {
    /// The record does not exist
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A record with the same key already exists
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// A concurrent transaction committed a change to a record this one wrote
    #[error("Concurrent modification of {0}")]
    Conflict(String),

    /// The transaction was already committed or rolled back
    #[error("Transaction already closed")]
    TransactionClosed,

    /// Backend failure
    #[error("Recorder failure: {0}")]
    Backend(String),
}

impl RecorderError {
    /// Conflicts and backend failures are transient
    pub fn is_retryable(&self) -> bool {
        matches!(self, RecorderError::Conflict(_) | RecorderError::Backend(_))
    }
}

/// Errors raised by the scheduler façade
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// `schedule` was called without a trigger
    #[error("Cannot schedule job '{0}' without a trigger")]
    NullTrigger(String),

    /// The job service refused the job descriptor
    #[error("Unable to create job descriptor: {0}")]
    JobDescriptorCreation(String),

    /// The job does not exist
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The executor is not started
    #[error("Scheduler executor is not started")]
    NotStarted,

    /// Executor failure
    #[error("Scheduler executor error: {0}")]
    Executor(String),
}

/// A flow node state failed while executing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unable to execute state '{state}' of flow node {flow_node_instance_id}: {cause}")]
pub struct ActivityStateExecutionError {
    /// Flow node being executed
    pub flow_node_instance_id: FlowNodeInstanceId,
    /// Name of the state that failed
    pub state: String,
    /// Original cause
    #[source]
    pub cause: Box<CoreError>,
}

impl ActivityStateExecutionError {
    /// Wrap a cause raised while executing `state` on `flow_node_instance_id`
    pub fn new(
        flow_node_instance_id: FlowNodeInstanceId,
        state: impl Into<String>,
        cause: impl Into<CoreError>,
    ) -> Self {
        Self {
            flow_node_instance_id,
            state: state.into(),
            cause: Box::new(cause.into()),
        }
    }

    /// Retryability follows the original cause
    pub fn is_retryable(&self) -> bool {
        self.cause.is_retryable()
    }
}

/// A failure escaping a unit of work, enriched with diagnostic context.
///
/// Context entries are only ever appended; the message renders them after
/// the cause as `KEY = value` pairs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{cause}{}", render_context(.context))]
pub struct WorkError {
    /// Original cause
    #[source]
    pub cause: CoreError,
    context: Vec<(String, String)>,
}

impl WorkError {
    /// Wrap a cause
    pub fn new(cause: impl Into<CoreError>) -> Self {
        Self {
            cause: cause.into(),
            context: Vec::new(),
        }
    }

    /// Append one diagnostic entry
    pub fn add_context(&mut self, key: impl Into<String>, value: impl ToString) {
        self.context.push((key.into(), value.to_string()));
    }

    /// Diagnostic entries in insertion order
    pub fn context(&self) -> &[(String, String)] {
        &self.context
    }

    /// Whether the work may be retried
    pub fn is_retryable(&self) -> bool {
        self.cause.is_retryable()
    }
}

impl From<CoreError> for WorkError {
    fn from(err: CoreError) -> Self {
        WorkError::new(err)
    }
}

fn render_context(context: &[(String, String)]) -> String {
    context
        .iter()
        .map(|(key, value)| format!(" | {} = {}", key, value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (
                CoreError::ProcessDefinitionNotFound("7".to_string()),
                "Process definition not found: 7",
            ),
            (
                CoreError::ProcessInstanceNotFound("8".to_string()),
                "Process instance not found: 8",
            ),
            (
                CoreError::TokenNotFound {
                    process_instance_id: 1,
                    ref_id: 2,
                },
                "Token not found: process instance 1, ref 2",
            ),
            (
                CoreError::Recorder(RecorderError::Conflict("flow node 3".to_string())),
                "Concurrent modification of flow node 3",
            ),
            (
                CoreError::Scheduler(SchedulerError::NullTrigger("job".to_string())),
                "Cannot schedule job 'job' without a trigger",
            ),
            (CoreError::Other("other_err".to_string()), "other_err"),
        ];

        for (error, expected_msg) in errors {
            assert_eq!(error.to_string(), expected_msg);
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(CoreError::from(RecorderError::Conflict("x".into())).is_retryable());
        assert!(CoreError::from(RecorderError::Backend("x".into())).is_retryable());
        assert!(!CoreError::from(RecorderError::NotFound("x".into())).is_retryable());
        assert!(!CoreError::from(SchedulerError::NotStarted).is_retryable());

        let wrapped = ActivityStateExecutionError::new(
            FlowNodeInstanceId(4),
            "executing",
            RecorderError::Conflict("activity 4".into()),
        );
        assert!(wrapped.is_retryable());
        assert!(WorkError::new(CoreError::from(wrapped)).is_retryable());
    }

    #[test]
    fn test_work_error_context_is_appended_to_message() {
        let mut error = WorkError::new(CoreError::Other("boom".to_string()));
        error.add_context("PROCESS_INSTANCE_ID", 2);
        error.add_context("ROOT_PROCESS_INSTANCE_ID", 3);

        assert_eq!(
            error.to_string(),
            "boom | PROCESS_INSTANCE_ID = 2 | ROOT_PROCESS_INSTANCE_ID = 3"
        );
        assert_eq!(error.context().len(), 2);
    }

    #[test]
    fn test_from_str() {
        let error: CoreError = "test error message".into();
        assert_eq!(error, CoreError::Other("test error message".to_string()));
    }
}
