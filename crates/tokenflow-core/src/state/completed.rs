use async_trait::async_trait;
use std::sync::Arc;

use super::{FlowNodeState, StateCode, StateId};
use crate::application::activity_instance_service::ActivityInstanceService;
use crate::domain::flow_node_instance::{FlowNodeInstance, StateCategory};
use crate::domain::process_definition::ProcessDefinition;
use crate::execution::context::ExecutionContext;
use crate::execution::flow_nodes;
use crate::{ActivityStateExecutionError, CoreError};

/// Normal end of a flow node. A finishing task takes its still-waiting
/// boundary events down with it.
pub struct CompletedState {
    activities: Arc<dyn ActivityInstanceService>,
}

impl CompletedState {
    /// Create the state
    pub fn new(activities: Arc<dyn ActivityInstanceService>) -> Self {
        Self { activities }
    }

    async fn abort_boundary_events(
        &self,
        ctx: &mut ExecutionContext,
        activity: &FlowNodeInstance,
    ) -> Result<(), CoreError> {
        for mut boundary in flow_nodes::attached_boundary_events(ctx, activity).await? {
            if self
                .activities
                .compare_and_set_state_category(
                    ctx.tx(),
                    &mut boundary,
                    StateCategory::Normal,
                    StateCategory::Aborting,
                )
                .await?
            {
                ctx.dispatch(&boundary);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FlowNodeState for CompletedState {
    fn id(&self) -> StateId {
        StateId::COMPLETED
    }

    fn name(&self) -> &'static str {
        "completed"
    }

    fn should_execute_state(&self, _: &ProcessDefinition, instance: &FlowNodeInstance) -> bool {
        instance.state_id == self.id() && instance.node_type.is_activity()
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        _definition: &ProcessDefinition,
        instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, ActivityStateExecutionError> {
        self.abort_boundary_events(ctx, instance)
            .await
            .map_err(|e| ActivityStateExecutionError::new(instance.id, self.name(), e))?;
        Ok(StateCode::Done)
    }

    fn is_stable(&self) -> bool {
        false
    }

    fn is_terminal(&self) -> bool {
        true
    }

    fn state_category(&self) -> StateCategory {
        StateCategory::Normal
    }
}
