use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::{FlowNodeState, StateCode, StateId};
use crate::application::activity_instance_service::ActivityInstanceService;
use crate::application::token_ledger::TokenService;
use crate::domain::flow_node_instance::{FlowNodeInstance, StateCategory};
use crate::domain::process_definition::ProcessDefinition;
use crate::domain::process_instance::FlowNodeInstanceId;
use crate::execution::context::ExecutionContext;
use crate::{ActivityStateExecutionError, CoreError};

/// A boundary event reacting to its trigger.
///
/// An interrupting event claims the watched activity by moving its category
/// from `Normal` to `Aborting`; only one claim can commit. Token creation
/// happens in the same transaction as the claim.
pub struct ExecutingBoundaryEventState {
    tokens: Arc<dyn TokenService>,
    activities: Arc<dyn ActivityInstanceService>,
}

impl ExecutingBoundaryEventState {
    /// Create the state
    pub fn new(
        tokens: Arc<dyn TokenService>,
        activities: Arc<dyn ActivityInstanceService>,
    ) -> Self {
        Self { tokens, activities }
    }

    async fn trigger(
        &self,
        ctx: &mut ExecutionContext,
        boundary: &mut FlowNodeInstance,
    ) -> Result<StateCode, CoreError> {
        let process_instance_id = boundary.parent_process_instance_id();
        let activity_id = boundary.activity_instance_id().ok_or_else(|| {
            CoreError::IllegalState(format!(
                "Boundary event {} is not attached to an activity",
                boundary.id
            ))
        })?;

        let activity = self
            .activities
            .find_activity_instance(ctx.tx(), activity_id)
            .await?;
        let mut activity = match activity {
            Some(activity)
                if !activity.terminal && activity.state_category == StateCategory::Normal =>
            {
                activity
            }
            _ => return self.lost_race(boundary, activity_id),
        };

        if boundary.is_interrupting() {
            let claimed = self
                .activities
                .compare_and_set_state_category(
                    ctx.tx(),
                    &mut activity,
                    StateCategory::Normal,
                    StateCategory::Aborting,
                )
                .await?;
            if !claimed {
                return self.lost_race(boundary, activity_id);
            }
            self.activities
                .set_aborted_by_boundary_event(ctx.tx(), &mut activity, boundary.id)
                .await?;
            if activity.stable || activity.state_executing {
                ctx.dispatch(&activity);
            }
            info!(
                flow_node_instance_id = %boundary.id,
                activity_instance_id = %activity.id,
                "Boundary event interrupts activity"
            );
        }

        let (ref_id, parent_ref_id) = if boundary.is_interrupting() {
            let activity_ref = activity.token_ref_id.ok_or_else(|| {
                CoreError::IllegalState(format!("Activity {} carries no token", activity.id))
            })?;
            let token = self
                .tokens
                .get_token(ctx.tx(), process_instance_id, activity_ref)
                .await?;
            (token.ref_id, token.parent_ref_id)
        } else {
            (boundary.id.0, None)
        };

        self.tokens
            .create_tokens(ctx.tx(), process_instance_id, ref_id, parent_ref_id, 1)
            .await?;
        boundary.token_ref_id = Some(ref_id);

        Ok(StateCode::Done)
    }

    /// The activity is gone or already unwinding: the event does nothing
    /// and unwinds itself.
    fn lost_race(
        &self,
        boundary: &mut FlowNodeInstance,
        activity_id: FlowNodeInstanceId,
    ) -> Result<StateCode, CoreError> {
        debug!(
            flow_node_instance_id = %boundary.id,
            activity_instance_id = %activity_id,
            "Activity no longer running, boundary event has no effect"
        );
        boundary.set_state_category(StateCategory::Aborting)?;
        Ok(StateCode::Done)
    }
}

#[async_trait]
impl FlowNodeState for ExecutingBoundaryEventState {
    fn id(&self) -> StateId {
        StateId::EXECUTING_BOUNDARY
    }

    fn name(&self) -> &'static str {
        "executing"
    }

    fn should_execute_state(&self, _: &ProcessDefinition, instance: &FlowNodeInstance) -> bool {
        instance.state_id == self.id()
            && instance.state_category == StateCategory::Normal
            && instance.token_ref_id.is_none()
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        _definition: &ProcessDefinition,
        instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, ActivityStateExecutionError> {
        let id = instance.id;
        self.trigger(ctx, instance)
            .await
            .map_err(|e| ActivityStateExecutionError::new(id, self.name(), e))
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
