use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::process_definition::FlowNodeType;
use super::process_instance::{FlowNodeInstanceId, ProcessDefinitionId, ProcessInstanceId};
use crate::state::StateId;
use crate::CoreError;

/// Why a flow node instance is unwinding, if at all.
///
/// The category only moves forward: `Normal` to `Aborting` or `Cancelling`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateCategory {
    /// Regular execution
    Normal,
    /// Unwinding because a boundary event interrupted it (or its parent)
    Aborting,
    /// Unwinding because the process instance was cancelled
    Cancelling,
}

impl StateCategory {
    /// Move to `next`, returning whether anything changed
    pub fn transition_to(&mut self, next: StateCategory) -> Result<bool, CoreError> {
        if *self == next {
            return Ok(false);
        }
        if *self != StateCategory::Normal {
            return Err(CoreError::InvalidStateCategoryTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(true)
    }
}

/// Containers a flow node instance belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalGroup {
    /// Definition the node was instantiated from
    pub process_definition_id: ProcessDefinitionId,
    /// Root of the process instance hierarchy
    pub root_process_instance_id: ProcessInstanceId,
    /// Activity a boundary event watches
    pub parent_activity_instance_id: Option<FlowNodeInstanceId>,
    /// Process instance owning the node; also the dispatch container
    pub parent_process_instance_id: ProcessInstanceId,
}

/// One instantiated node of a process graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowNodeInstance {
    /// Unique identifier
    pub id: FlowNodeInstanceId,

    /// Name of the flow node definition
    pub name: String,

    /// Kind of node
    pub node_type: FlowNodeType,

    /// Container references
    pub logical_group: LogicalGroup,

    /// Current state id
    pub state_id: StateId,

    /// Current state name
    pub state_name: String,

    /// Why the node is unwinding, if at all
    pub state_category: StateCategory,

    /// Waiting for an external trigger
    pub stable: bool,

    /// In a state that still has work to do
    pub state_executing: bool,

    /// Reached an end state
    pub terminal: bool,

    /// Boundary events only: aborts the watched activity when triggered
    pub interrupting: bool,

    /// Token the node currently carries
    pub token_ref_id: Option<u64>,

    /// Boundary event that interrupted this activity
    pub aborted_by_boundary: Option<FlowNodeInstanceId>,

    /// Joining gateways: tokens delivered by incoming transitions so far
    pub incoming_token_refs: Vec<u64>,

    /// Boundary events only: name of the timer job
    pub timer_job_name: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// When the current state was entered
    pub reached_state_at: DateTime<Utc>,
}

impl FlowNodeInstance {
    /// Create a node in the initializing state
    pub fn new(
        id: FlowNodeInstanceId,
        name: impl Into<String>,
        node_type: FlowNodeType,
        logical_group: LogicalGroup,
        token_ref_id: Option<u64>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            node_type,
            logical_group,
            state_id: StateId::INITIALIZING,
            state_name: "initializing".to_string(),
            state_category: StateCategory::Normal,
            stable: false,
            state_executing: true,
            terminal: false,
            interrupting: false,
            token_ref_id,
            aborted_by_boundary: None,
            incoming_token_refs: Vec::new(),
            timer_job_name: None,
            created_at: now,
            reached_state_at: now,
        }
    }

    /// Owning process instance
    #[inline]
    pub fn parent_process_instance_id(&self) -> ProcessInstanceId {
        self.logical_group.parent_process_instance_id
    }

    /// Root process instance
    #[inline]
    pub fn root_process_instance_id(&self) -> ProcessInstanceId {
        self.logical_group.root_process_instance_id
    }

    /// Definition this node belongs to
    #[inline]
    pub fn process_definition_id(&self) -> ProcessDefinitionId {
        self.logical_group.process_definition_id
    }

    /// Activity watched by this boundary event
    #[inline]
    pub fn activity_instance_id(&self) -> Option<FlowNodeInstanceId> {
        self.logical_group.parent_activity_instance_id
    }

    /// Whether this boundary event interrupts its activity
    #[inline]
    pub fn is_interrupting(&self) -> bool {
        self.interrupting
    }

    /// Move the state category forward; reverting is an error
    pub fn set_state_category(&mut self, category: StateCategory) -> Result<bool, CoreError> {
        self.state_category.transition_to(category)
    }

    /// Record entry into a new state
    pub fn enter_state(&mut self, id: StateId, name: &str, stable: bool, terminal: bool) {
        self.state_id = id;
        self.state_name = name.to_string();
        self.stable = stable;
        self.terminal = terminal;
        self.state_executing = !stable && !terminal;
        self.reached_state_at = Utc::now();
    }
}

/// Read-only copy of a flow node instance that reached a terminal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedFlowNodeInstance {
    /// Snapshot taken in the terminal state
    pub instance: FlowNodeInstance,
    /// Archive timestamp
    pub archived_at: DateTime<Utc>,
}

impl From<FlowNodeInstance> for ArchivedFlowNodeInstance {
    fn from(instance: FlowNodeInstance) -> Self {
        Self {
            instance,
            archived_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity() -> FlowNodeInstance {
        FlowNodeInstance::new(
            FlowNodeInstanceId(10),
            "task",
            FlowNodeType::UserTask,
            LogicalGroup {
                process_definition_id: ProcessDefinitionId(1),
                root_process_instance_id: ProcessInstanceId(2),
                parent_activity_instance_id: None,
                parent_process_instance_id: ProcessInstanceId(2),
            },
            Some(2),
        )
    }

    #[test]
    fn test_category_moves_forward_only() {
        let mut node = activity();

        assert!(node.set_state_category(StateCategory::Aborting).unwrap());
        assert!(!node.set_state_category(StateCategory::Aborting).unwrap());

        let revert = node.set_state_category(StateCategory::Normal);
        assert_eq!(
            revert,
            Err(CoreError::InvalidStateCategoryTransition {
                from: StateCategory::Aborting,
                to: StateCategory::Normal,
            })
        );
        assert!(node.set_state_category(StateCategory::Cancelling).is_err());
        assert_eq!(node.state_category, StateCategory::Aborting);
    }

    #[test]
    fn test_enter_state_updates_flags() {
        let mut node = activity();
        assert!(node.state_executing);

        node.enter_state(StateId::READY, "ready", true, false);
        assert!(node.stable);
        assert!(!node.state_executing);

        node.enter_state(StateId::ABORTED, "aborted", false, true);
        assert!(node.terminal);
        assert!(!node.state_executing);
    }
}
