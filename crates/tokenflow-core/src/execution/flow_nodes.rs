//! Flow node record helpers shared by states and the executor.
//!
//! Every structural change of a process instance (a node created, a
//! joining gateway hit, a node archived) also updates the process instance
//! row. Concurrent structural changes of one instance therefore conflict at
//! commit and are applied one after the other.

use tracing::warn;

use super::context::ExecutionContext;
use crate::domain::events::{event_types, RecordEvent};
use crate::domain::flow_node_instance::{
    ArchivedFlowNodeInstance, FlowNodeInstance, LogicalGroup, StateCategory,
};
use crate::domain::process_definition::{FlowNodeDefinition, FlowNodeType, ProcessDefinition};
use crate::domain::process_instance::{FlowNodeInstanceId, ProcessInstanceId};
use crate::domain::repository::{Record, RecordKey};
use crate::CoreError;

/// Build a new flow node instance in `initializing`; nothing is written
pub fn new_flow_node(
    ctx: &mut ExecutionContext,
    definition: &ProcessDefinition,
    node: &FlowNodeDefinition,
    process_instance_id: ProcessInstanceId,
    root_process_instance_id: ProcessInstanceId,
    token_ref_id: Option<u64>,
) -> FlowNodeInstance {
    FlowNodeInstance::new(
        FlowNodeInstanceId(ctx.tx().next_id()),
        node.name.clone(),
        node.kind.node_type(),
        LogicalGroup {
            process_definition_id: definition.id,
            root_process_instance_id,
            parent_activity_instance_id: None,
            parent_process_instance_id: process_instance_id,
        },
        token_ref_id,
    )
}

/// Insert a new flow node instance
pub async fn insert_flow_node(
    ctx: &mut ExecutionContext,
    instance: &FlowNodeInstance,
) -> Result<(), CoreError> {
    let process_instance_id = instance.parent_process_instance_id();
    ctx.tx()
        .record_insert(
            Record::FlowNode(instance.clone()),
            RecordEvent::new(event_types::FLOWNODE_CREATED).for_process_instance(process_instance_id),
        )
        .await?;
    touch_process_instance(ctx, process_instance_id).await
}

/// Persist the current state of a flow node instance
pub async fn save_flow_node(
    ctx: &mut ExecutionContext,
    instance: &FlowNodeInstance,
    event_type: &str,
) -> Result<(), CoreError> {
    ctx.tx()
        .record_update(
            Record::FlowNode(instance.clone()),
            RecordEvent::new(event_type).for_process_instance(instance.parent_process_instance_id()),
        )
        .await?;
    Ok(())
}

/// Move a terminal flow node instance into the archive
pub async fn archive_flow_node(
    ctx: &mut ExecutionContext,
    instance: &FlowNodeInstance,
) -> Result<(), CoreError> {
    let process_instance_id = instance.parent_process_instance_id();
    ctx.tx()
        .record_delete(
            RecordKey::FlowNode(instance.id),
            RecordEvent::new(event_types::FLOWNODE_DELETED).for_process_instance(process_instance_id),
        )
        .await?;
    ctx.tx()
        .record_insert(
            Record::ArchivedFlowNode(ArchivedFlowNodeInstance::from(instance.clone())),
            RecordEvent::new(event_types::ARCHIVED).for_process_instance(process_instance_id),
        )
        .await?;
    touch_process_instance(ctx, process_instance_id).await
}

/// Bump the process instance row
pub async fn touch_process_instance(
    ctx: &mut ExecutionContext,
    process_instance_id: ProcessInstanceId,
) -> Result<(), CoreError> {
    match ctx.tx().process_instance(process_instance_id).await? {
        Some(mut process_instance) => {
            process_instance.touch();
            ctx.tx()
                .record_update(
                    Record::ProcessInstance(process_instance),
                    RecordEvent::new(event_types::PROCESSINSTANCE_UPDATED)
                        .for_process_instance(process_instance_id),
                )
                .await?;
        }
        None => {
            warn!(process_instance_id = %process_instance_id, "Process instance vanished");
        }
    }
    Ok(())
}

/// Live boundary events attached to `activity` that are still `Normal`
pub async fn attached_boundary_events(
    ctx: &mut ExecutionContext,
    activity: &FlowNodeInstance,
) -> Result<Vec<FlowNodeInstance>, CoreError> {
    Ok(ctx
        .tx()
        .flow_node_instances_of(activity.parent_process_instance_id())
        .await?
        .into_iter()
        .filter(|node| {
            node.node_type == FlowNodeType::BoundaryEvent
                && node.activity_instance_id() == Some(activity.id)
                && node.state_category == StateCategory::Normal
                && !node.terminal
        })
        .collect())
}
