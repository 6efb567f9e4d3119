use std::sync::Arc;
use tracing::debug;

use super::context::ExecutionContext;
use super::flow_nodes;
use crate::application::token_ledger::TokenService;
use crate::domain::events::event_types;
use crate::domain::flow_node_instance::{FlowNodeInstance, StateCategory};
use crate::domain::process_definition::{FlowNodeDefinition, FlowNodeKind, ProcessDefinition};
use crate::domain::process_instance::ProcessInstanceId;
use crate::state::{StateId, StateRegistry};
use crate::CoreError;

/// Moves tokens along sequence flows and creates or hits the target nodes
pub struct TransitionEvaluator {
    tokens: Arc<dyn TokenService>,
}

impl TransitionEvaluator {
    /// Create an evaluator
    pub fn new(tokens: Arc<dyn TokenService>) -> Self {
        Self { tokens }
    }

    /// Mint the root token and create the start event of a new instance
    pub async fn start(
        &self,
        ctx: &mut ExecutionContext,
        definition: &ProcessDefinition,
        process_instance_id: ProcessInstanceId,
        root_process_instance_id: ProcessInstanceId,
    ) -> Result<FlowNodeInstance, CoreError> {
        let start_event = definition.start_event()?;
        let root_ref = process_instance_id.0;
        self.tokens
            .create_tokens(ctx.tx(), process_instance_id, root_ref, None, 1)
            .await?;

        let start = flow_nodes::new_flow_node(
            ctx,
            definition,
            start_event,
            process_instance_id,
            root_process_instance_id,
            Some(root_ref),
        );
        flow_nodes::insert_flow_node(ctx, &start).await?;
        ctx.dispatch(&start);
        Ok(start)
    }

    /// Follow the outgoing transitions of a node that completed normally
    pub async fn follow_outgoing(
        &self,
        ctx: &mut ExecutionContext,
        registry: &StateRegistry,
        definition: &ProcessDefinition,
        node: &FlowNodeInstance,
    ) -> Result<(), CoreError> {
        let process_instance_id = node.parent_process_instance_id();
        let targets = definition.outgoing(&node.name);
        let incoming_ref = node.token_ref_id;

        match targets.len() {
            0 => {
                if let Some(ref_id) = incoming_ref {
                    self.tokens
                        .consume_token(ctx.tx(), process_instance_id, ref_id)
                        .await?;
                }
            }
            1 => {
                self.hit(ctx, registry, definition, node, targets[0], incoming_ref)
                    .await?;
            }
            count => {
                if let Some(ref_id) = incoming_ref {
                    self.tokens
                        .consume_token(ctx.tx(), process_instance_id, ref_id)
                        .await?;
                }
                let fork_ref = node.id.0;
                self.tokens
                    .create_tokens(ctx.tx(), process_instance_id, fork_ref, incoming_ref, count)
                    .await?;
                for target in targets {
                    self.hit(ctx, registry, definition, node, target, Some(fork_ref))
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn hit(
        &self,
        ctx: &mut ExecutionContext,
        registry: &StateRegistry,
        definition: &ProcessDefinition,
        parent: &FlowNodeInstance,
        target: &FlowNodeDefinition,
        token_ref_id: Option<u64>,
    ) -> Result<(), CoreError> {
        let joining = target.kind == FlowNodeKind::ParallelGateway
            && definition.incoming_count(&target.name) > 1;

        let child = if joining {
            let ref_id = token_ref_id.ok_or_else(|| {
                CoreError::IllegalState(format!(
                    "Flow node {} reached joining gateway {} without a token",
                    parent.id, target.name
                ))
            })?;
            self.hit_joining_gateway(ctx, definition, parent, target, ref_id)
                .await?
        } else {
            let child = flow_nodes::new_flow_node(
                ctx,
                definition,
                target,
                parent.parent_process_instance_id(),
                parent.root_process_instance_id(),
                token_ref_id,
            );
            flow_nodes::insert_flow_node(ctx, &child).await?;
            child
        };

        if registry
            .state(child.state_id)?
            .hit(definition, parent, &child)
        {
            ctx.dispatch(&child);
        }
        Ok(())
    }

    async fn hit_joining_gateway(
        &self,
        ctx: &mut ExecutionContext,
        definition: &ProcessDefinition,
        parent: &FlowNodeInstance,
        target: &FlowNodeDefinition,
        ref_id: u64,
    ) -> Result<FlowNodeInstance, CoreError> {
        let process_instance_id = parent.parent_process_instance_id();
        let waiting = ctx
            .tx()
            .flow_node_instances_of(process_instance_id)
            .await?
            .into_iter()
            .find(|node| {
                node.name == target.name
                    && node.state_id == StateId::INITIALIZING
                    && node.state_category == StateCategory::Normal
            });

        match waiting {
            Some(mut gateway) => {
                gateway.incoming_token_refs.push(ref_id);
                flow_nodes::save_flow_node(ctx, &gateway, event_types::GATEWAY_HIT).await?;
                flow_nodes::touch_process_instance(ctx, process_instance_id).await?;
                debug!(
                    flow_node_instance_id = %gateway.id,
                    hits = gateway.incoming_token_refs.len(),
                    "Joining gateway hit"
                );
                Ok(gateway)
            }
            None => {
                let mut gateway = flow_nodes::new_flow_node(
                    ctx,
                    definition,
                    target,
                    process_instance_id,
                    parent.root_process_instance_id(),
                    None,
                );
                gateway.incoming_token_refs.push(ref_id);
                flow_nodes::insert_flow_node(ctx, &gateway).await?;
                Ok(gateway)
            }
        }
    }
}
