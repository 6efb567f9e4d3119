use async_trait::async_trait;

use super::{FlowNodeState, StateCode, StateId};
use crate::domain::flow_node_instance::{FlowNodeInstance, StateCategory};
use crate::domain::process_definition::ProcessDefinition;
use crate::execution::context::ExecutionContext;
use crate::ActivityStateExecutionError;

/// A normal state in which the node waits for an external trigger
pub struct StableState {
    id: StateId,
    name: &'static str,
}

impl StableState {
    /// User task waiting for a user
    pub fn ready() -> Self {
        Self {
            id: StateId::READY,
            name: "ready",
        }
    }

    /// Boundary event waiting for its timer
    pub fn waiting() -> Self {
        Self {
            id: StateId::WAITING,
            name: "waiting",
        }
    }

    /// Node whose work failed after every retry
    pub fn failed() -> Self {
        Self {
            id: StateId::FAILED,
            name: "failed",
        }
    }
}

#[async_trait]
impl FlowNodeState for StableState {
    fn id(&self) -> StateId {
        self.id
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn should_execute_state(&self, _: &ProcessDefinition, _: &FlowNodeInstance) -> bool {
        false
    }

    async fn execute(
        &self,
        _ctx: &mut ExecutionContext,
        _definition: &ProcessDefinition,
        _instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, ActivityStateExecutionError> {
        Ok(StateCode::Done)
    }

    fn is_stable(&self) -> bool {
        true
    }

    fn is_terminal(&self) -> bool {
        false
    }

    fn state_category(&self) -> StateCategory {
        StateCategory::Normal
    }
}
