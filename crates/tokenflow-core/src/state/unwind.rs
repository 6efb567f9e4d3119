use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

use super::{FlowNodeState, StateCode, StateId};
use crate::application::activity_instance_service::ActivityInstanceService;
use crate::application::token_ledger::TokenService;
use crate::domain::flow_node_instance::{FlowNodeInstance, StateCategory};
use crate::domain::process_definition::{FlowNodeType, ProcessDefinition};
use crate::execution::context::ExecutionContext;
use crate::execution::flow_nodes;
use crate::{ActivityStateExecutionError, CoreError};

/// `aborting` or `cancelling`: propagates the category to the boundary
/// events of an activity and disarms a boundary event's timer.
pub struct UnwindingState {
    id: StateId,
    name: &'static str,
    category: StateCategory,
    activities: Arc<dyn ActivityInstanceService>,
}

impl UnwindingState {
    /// Unwinding after an interrupt
    pub fn aborting(activities: Arc<dyn ActivityInstanceService>) -> Self {
        Self {
            id: StateId::ABORTING,
            name: "aborting",
            category: StateCategory::Aborting,
            activities,
        }
    }

    /// Unwinding after a cancellation
    pub fn cancelling(activities: Arc<dyn ActivityInstanceService>) -> Self {
        Self {
            id: StateId::CANCELLING,
            name: "cancelling",
            category: StateCategory::Cancelling,
            activities,
        }
    }

    async fn unwind(
        &self,
        ctx: &mut ExecutionContext,
        instance: &FlowNodeInstance,
    ) -> Result<(), CoreError> {
        if instance.node_type == FlowNodeType::BoundaryEvent {
            if let Some(job_name) = &instance.timer_job_name {
                ctx.remove_timer(job_name.clone());
            }
            return Ok(());
        }

        if !instance.node_type.is_activity() {
            return Ok(());
        }

        for mut boundary in flow_nodes::attached_boundary_events(ctx, instance).await? {
            if Some(boundary.id) == instance.aborted_by_boundary {
                continue;
            }
            if self
                .activities
                .compare_and_set_state_category(
                    ctx.tx(),
                    &mut boundary,
                    StateCategory::Normal,
                    self.category,
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
impl FlowNodeState for UnwindingState {
    fn id(&self) -> StateId {
        self.id
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn should_execute_state(&self, _: &ProcessDefinition, instance: &FlowNodeInstance) -> bool {
        instance.state_id == self.id && instance.state_category == self.category
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        _definition: &ProcessDefinition,
        instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, ActivityStateExecutionError> {
        self.unwind(ctx, instance)
            .await
            .map_err(|e| ActivityStateExecutionError::new(instance.id, self.name, e))?;
        Ok(StateCode::Done)
    }

    fn is_stable(&self) -> bool {
        false
    }

    fn is_terminal(&self) -> bool {
        false
    }

    fn state_category(&self) -> StateCategory {
        self.category
    }
}

/// `aborted` or `cancelled`: the node ends without following its outgoing
/// transitions and closes the branch its token represented.
pub struct UnwoundState {
    id: StateId,
    name: &'static str,
    category: StateCategory,
    tokens: Arc<dyn TokenService>,
}

impl UnwoundState {
    /// Finished by an interrupt
    pub fn aborted(tokens: Arc<dyn TokenService>) -> Self {
        Self {
            id: StateId::ABORTED,
            name: "aborted",
            category: StateCategory::Aborting,
            tokens,
        }
    }

    /// Finished by a cancellation
    pub fn cancelled(tokens: Arc<dyn TokenService>) -> Self {
        Self {
            id: StateId::CANCELLED,
            name: "cancelled",
            category: StateCategory::Cancelling,
            tokens,
        }
    }

    async fn close_branch(
        &self,
        ctx: &mut ExecutionContext,
        instance: &FlowNodeInstance,
    ) -> Result<(), CoreError> {
        if instance.node_type == FlowNodeType::BoundaryEvent {
            return Ok(());
        }

        let held: Vec<u64> = match instance.token_ref_id {
            Some(ref_id) => vec![ref_id],
            None => instance.incoming_token_refs.clone(),
        };

        let process_instance_id = instance.parent_process_instance_id();
        for ref_id in held {
            match self
                .tokens
                .consume_token(ctx.tx(), process_instance_id, ref_id)
                .await
            {
                Ok(_) => {}
                Err(CoreError::TokenNotFound { .. }) => {
                    warn!(
                        flow_node_instance_id = %instance.id,
                        ref_id,
                        "No live token to consume for unwound flow node"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl FlowNodeState for UnwoundState {
    fn id(&self) -> StateId {
        self.id
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn should_execute_state(&self, _: &ProcessDefinition, instance: &FlowNodeInstance) -> bool {
        instance.state_id == self.id
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        _definition: &ProcessDefinition,
        instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, ActivityStateExecutionError> {
        self.close_branch(ctx, instance)
            .await
            .map_err(|e| ActivityStateExecutionError::new(instance.id, self.name, e))?;
        Ok(StateCode::Done)
    }

    fn is_stable(&self) -> bool {
        false
    }

    fn is_terminal(&self) -> bool {
        true
    }

    fn state_category(&self) -> StateCategory {
        self.category
    }
}
