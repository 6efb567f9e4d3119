use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{FlowNodeState, StateCode, StateId};
use crate::application::token_ledger::TokenService;
use crate::domain::flow_node_instance::{FlowNodeInstance, StateCategory};
use crate::domain::process_definition::{FlowNodeKind, FlowNodeType, ProcessDefinition};
use crate::execution::context::ExecutionContext;
use crate::execution::flow_nodes;
use crate::{ActivityStateExecutionError, CoreError};

/// Entry state of every flow node.
///
/// Tasks instantiate their boundary events here, boundary events arm their
/// timer, and joining gateways wait until every incoming branch arrived.
pub struct InitializingState {
    tokens: Arc<dyn TokenService>,
}

impl InitializingState {
    /// Create the state
    pub fn new(tokens: Arc<dyn TokenService>) -> Self {
        Self { tokens }
    }

    fn is_joining(definition: &ProcessDefinition, instance: &FlowNodeInstance) -> bool {
        instance.node_type == FlowNodeType::ParallelGateway
            && definition.incoming_count(&instance.name) > 1
    }

    async fn initialize(
        &self,
        ctx: &mut ExecutionContext,
        definition: &ProcessDefinition,
        instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, CoreError> {
        match instance.node_type {
            FlowNodeType::UserTask | FlowNodeType::AutomaticTask => {
                for boundary in definition.boundary_events_of(&instance.name) {
                    let interrupting = matches!(
                        boundary.kind,
                        FlowNodeKind::BoundaryEvent { interrupting: true, .. }
                    );
                    let mut event = flow_nodes::new_flow_node(
                        ctx,
                        definition,
                        boundary,
                        instance.parent_process_instance_id(),
                        instance.root_process_instance_id(),
                        None,
                    );
                    event.interrupting = interrupting;
                    event.logical_group.parent_activity_instance_id = Some(instance.id);
                    flow_nodes::insert_flow_node(ctx, &event).await?;
                    ctx.dispatch(&event);
                }
                Ok(StateCode::Done)
            }
            FlowNodeType::BoundaryEvent => {
                let delay = definition
                    .require_flow_node(&instance.name)?
                    .timer()
                    .ok_or_else(|| {
                        CoreError::ValidationError(format!(
                            "Boundary event {} has no timer",
                            instance.name
                        ))
                    })?;
                let job_name = format!("timer-boundary-{}", instance.id);
                instance.timer_job_name = Some(job_name.clone());
                ctx.schedule_timer(job_name, instance, delay);
                Ok(StateCode::Done)
            }
            FlowNodeType::ParallelGateway if Self::is_joining(definition, instance) => {
                let expected = definition.incoming_count(&instance.name);
                if instance.incoming_token_refs.len() < expected {
                    debug!(
                        flow_node_instance_id = %instance.id,
                        hits = instance.incoming_token_refs.len(),
                        expected,
                        "Joining gateway waits for more branches"
                    );
                    return Ok(StateCode::Executing);
                }
                self.merge(ctx, instance).await?;
                Ok(StateCode::Done)
            }
            _ => Ok(StateCode::Done),
        }
    }

    /// Consume the tokens of the joined branches and continue their parent
    async fn merge(
        &self,
        ctx: &mut ExecutionContext,
        instance: &mut FlowNodeInstance,
    ) -> Result<(), CoreError> {
        let process_instance_id = instance.parent_process_instance_id();
        let mut parents = Vec::with_capacity(instance.incoming_token_refs.len());
        for ref_id in &instance.incoming_token_refs {
            let token = self
                .tokens
                .consume_token(ctx.tx(), process_instance_id, *ref_id)
                .await?;
            parents.push(token.parent_ref_id);
        }

        let shared_parent = match parents.split_first() {
            Some((Some(first), rest)) if rest.iter().all(|p| *p == Some(*first)) => Some(*first),
            _ => None,
        };

        let (ref_id, parent_ref_id) = match shared_parent {
            Some(parent) => {
                let lineage = self
                    .tokens
                    .lineage(ctx.tx(), process_instance_id, parent)
                    .await?;
                (parent, lineage.first().and_then(|token| token.parent_ref_id))
            }
            None => (instance.id.0, None),
        };

        self.tokens
            .create_tokens(ctx.tx(), process_instance_id, ref_id, parent_ref_id, 1)
            .await?;
        instance.token_ref_id = Some(ref_id);
        Ok(())
    }
}

#[async_trait]
impl FlowNodeState for InitializingState {
    fn id(&self) -> StateId {
        StateId::INITIALIZING
    }

    fn name(&self) -> &'static str {
        "initializing"
    }

    fn should_execute_state(
        &self,
        _definition: &ProcessDefinition,
        instance: &FlowNodeInstance,
    ) -> bool {
        instance.state_id == self.id() && instance.state_category == StateCategory::Normal
    }

    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        definition: &ProcessDefinition,
        instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, ActivityStateExecutionError> {
        let id = instance.id;
        self.initialize(ctx, definition, instance)
            .await
            .map_err(|e| ActivityStateExecutionError::new(id, self.name(), e))
    }

    fn hit(
        &self,
        definition: &ProcessDefinition,
        _parent: &FlowNodeInstance,
        child: &FlowNodeInstance,
    ) -> bool {
        !Self::is_joining(definition, child)
            || child.incoming_token_refs.len() >= definition.incoming_count(&child.name)
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
