use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::flow_node_instance::StateCategory;
use crate::CoreError;

/// Value object: Tenant ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TenantId(pub u64);

/// Value object: Process definition ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessDefinitionId(pub u64);

/// Value object: Process instance ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessInstanceId(pub u64);

/// Value object: Flow node instance ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowNodeInstanceId(pub u64);

macro_rules! display_id {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        })*
    };
}

display_id!(TenantId, ProcessDefinitionId, ProcessInstanceId, FlowNodeInstanceId);

/// Lifecycle of a process instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessInstanceState {
    /// Created, start event not yet dispatched
    Initializing,
    /// Flow nodes are executing
    Started,
    /// Every flow node finished normally
    Completed,
    /// Cancelled from outside
    Cancelled,
}

/// Aggregate: one running process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInstance {
    /// Unique identifier
    pub id: ProcessInstanceId,

    /// Definition this instance executes
    pub process_definition_id: ProcessDefinitionId,

    /// Top-most process instance of the call hierarchy
    pub root_process_instance_id: ProcessInstanceId,

    /// Lifecycle state
    pub state: ProcessInstanceState,

    /// Why the instance is unwinding, if at all
    pub state_category: StateCategory,

    /// Creation timestamp
    pub started_at: DateTime<Utc>,

    /// Bumped by every terminal flow node transition of this instance
    pub last_update: DateTime<Utc>,

    /// End timestamp, set once the instance finished
    pub end_at: Option<DateTime<Utc>>,
}

impl ProcessInstance {
    /// Create a root process instance
    pub fn new(id: ProcessInstanceId, process_definition_id: ProcessDefinitionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            process_definition_id,
            root_process_instance_id: id,
            state: ProcessInstanceState::Initializing,
            state_category: StateCategory::Normal,
            started_at: now,
            last_update: now,
            end_at: None,
        }
    }

    /// Mark the instance as running
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.state != ProcessInstanceState::Initializing {
            return Err(CoreError::IllegalState(format!(
                "Cannot start process instance {} in state {:?}",
                self.id, self.state
            )));
        }
        self.state = ProcessInstanceState::Started;
        self.touch();
        Ok(())
    }

    /// Request cancellation; returns false when it was already requested
    pub fn request_cancellation(&mut self) -> Result<bool, CoreError> {
        if self.is_finished() {
            return Err(CoreError::IllegalState(format!(
                "Process instance {} already finished",
                self.id
            )));
        }
        let changed = self.state_category.transition_to(StateCategory::Cancelling)?;
        if changed {
            self.touch();
        }
        Ok(changed)
    }

    /// Close the instance once no flow node is alive any more
    pub fn finish(&mut self) {
        self.state = match self.state_category {
            StateCategory::Cancelling => ProcessInstanceState::Cancelled,
            _ => ProcessInstanceState::Completed,
        };
        let now = Utc::now();
        self.end_at = Some(now);
        self.last_update = now;
    }

    /// Whether the instance reached an end state
    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            ProcessInstanceState::Completed | ProcessInstanceState::Cancelled
        )
    }

    /// Update the modification timestamp
    #[inline]
    pub fn touch(&mut self) {
        self.last_update = Utc::now();
    }
}

/// Read-only copy of a finished process instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedProcessInstance {
    /// Snapshot taken when the instance finished
    pub instance: ProcessInstance,
    /// Archive timestamp
    pub archived_at: DateTime<Utc>,
}

impl From<ProcessInstance> for ArchivedProcessInstance {
    fn from(instance: ProcessInstance) -> Self {
        Self {
            instance,
            archived_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_only_from_initializing() {
        let mut instance = ProcessInstance::new(ProcessInstanceId(1), ProcessDefinitionId(2));
        assert_eq!(instance.root_process_instance_id, ProcessInstanceId(1));

        instance.start().unwrap();
        assert_eq!(instance.state, ProcessInstanceState::Started);
        assert!(instance.start().is_err());
    }

    #[test]
    fn test_cancelled_instance_finishes_as_cancelled() {
        let mut instance = ProcessInstance::new(ProcessInstanceId(1), ProcessDefinitionId(2));
        instance.start().unwrap();

        assert!(instance.request_cancellation().unwrap());
        assert!(!instance.request_cancellation().unwrap());

        instance.finish();
        assert_eq!(instance.state, ProcessInstanceState::Cancelled);
        assert!(instance.end_at.is_some());
        assert!(instance.request_cancellation().is_err());
    }
}
