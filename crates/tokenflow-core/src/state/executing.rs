use async_trait::async_trait;
use tracing::debug;

use super::{FlowNodeState, StateCode, StateId};
use crate::domain::flow_node_instance::{FlowNodeInstance, StateCategory};
use crate::domain::process_definition::ProcessDefinition;
use crate::execution::context::ExecutionContext;
use crate::ActivityStateExecutionError;

/// Task body execution. Tasks carry no work of their own in this engine.
pub struct ExecutingState;

#[async_trait]
impl FlowNodeState for ExecutingState {
    fn id(&self) -> StateId {
        StateId::EXECUTING
    }

    fn name(&self) -> &'static str {
        "executing"
    }

    fn should_execute_state(&self, _: &ProcessDefinition, instance: &FlowNodeInstance) -> bool {
        instance.state_id == self.id() && instance.state_category == StateCategory::Normal
    }

    async fn execute(
        &self,
        _ctx: &mut ExecutionContext,
        _definition: &ProcessDefinition,
        instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, ActivityStateExecutionError> {
        debug!(flow_node_instance_id = %instance.id, name = %instance.name, "Executing task");
        Ok(StateCode::Done)
    }

    fn is_stable(&self) -> bool {
        false
    }

    fn is_terminal(&self) -> bool {
        false
    }

    fn state_category(&self) -> StateCategory {
        StateCategory::Normal
    }
}
