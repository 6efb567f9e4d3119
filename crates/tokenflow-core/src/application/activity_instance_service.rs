use async_trait::async_trait;
use tracing::debug;

use crate::domain::events::{event_types, RecordEvent};
use crate::domain::flow_node_instance::{FlowNodeInstance, StateCategory};
use crate::domain::process_instance::FlowNodeInstanceId;
use crate::domain::repository::{Record, Transaction};
use crate::CoreError;

/// Activity instance reads and the mutations boundary events need.
///
/// Every operation runs in the caller's transaction so a category change
/// commits or rolls back together with the tokens created beside it.
#[async_trait]
pub trait ActivityInstanceService: Send + Sync {
    /// Read an activity instance, failing when it does not exist
    async fn get_activity_instance(
        &self,
        tx: &mut dyn Transaction,
        id: FlowNodeInstanceId,
    ) -> Result<FlowNodeInstance, CoreError>;

    /// Read an activity instance
    async fn find_activity_instance(
        &self,
        tx: &mut dyn Transaction,
        id: FlowNodeInstanceId,
    ) -> Result<Option<FlowNodeInstance>, CoreError>;

    /// Move the category forward and record it; returns whether it changed
    async fn set_state_category(
        &self,
        tx: &mut dyn Transaction,
        instance: &mut FlowNodeInstance,
        category: StateCategory,
    ) -> Result<bool, CoreError>;

    /// Move the category to `category` only if it currently is `expected`.
    /// Returns false, without writing anything, otherwise.
    async fn compare_and_set_state_category(
        &self,
        tx: &mut dyn Transaction,
        instance: &mut FlowNodeInstance,
        expected: StateCategory,
        category: StateCategory,
    ) -> Result<bool, CoreError>;

    /// Record which boundary event interrupted the activity
    async fn set_aborted_by_boundary_event(
        &self,
        tx: &mut dyn Transaction,
        instance: &mut FlowNodeInstance,
        boundary_event_id: FlowNodeInstanceId,
    ) -> Result<(), CoreError>;
}

/// Recorder-backed [`ActivityInstanceService`]
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderActivityInstanceService;

impl RecorderActivityInstanceService {
    /// Create the service
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ActivityInstanceService for RecorderActivityInstanceService {
    async fn get_activity_instance(
        &self,
        tx: &mut dyn Transaction,
        id: FlowNodeInstanceId,
    ) -> Result<FlowNodeInstance, CoreError> {
        self.find_activity_instance(tx, id)
            .await?
            .ok_or_else(|| CoreError::FlowNodeInstanceNotFound(id.to_string()))
    }

    async fn find_activity_instance(
        &self,
        tx: &mut dyn Transaction,
        id: FlowNodeInstanceId,
    ) -> Result<Option<FlowNodeInstance>, CoreError> {
        Ok(tx.flow_node_instance(id).await?)
    }

    async fn set_state_category(
        &self,
        tx: &mut dyn Transaction,
        instance: &mut FlowNodeInstance,
        category: StateCategory,
    ) -> Result<bool, CoreError> {
        if !instance.set_state_category(category)? {
            return Ok(false);
        }
        tx.record_update(
            Record::FlowNode(instance.clone()),
            RecordEvent::new(event_types::FLOWNODE_STATE_CATEGORY_UPDATED)
                .for_process_instance(instance.parent_process_instance_id()),
        )
        .await?;
        debug!(
            flow_node_instance_id = %instance.id,
            category = ?category,
            "State category updated"
        );
        Ok(true)
    }

    async fn compare_and_set_state_category(
        &self,
        tx: &mut dyn Transaction,
        instance: &mut FlowNodeInstance,
        expected: StateCategory,
        category: StateCategory,
    ) -> Result<bool, CoreError> {
        if instance.state_category != expected {
            return Ok(false);
        }
        self.set_state_category(tx, instance, category).await
    }

    async fn set_aborted_by_boundary_event(
        &self,
        tx: &mut dyn Transaction,
        instance: &mut FlowNodeInstance,
        boundary_event_id: FlowNodeInstanceId,
    ) -> Result<(), CoreError> {
        instance.aborted_by_boundary = Some(boundary_event_id);
        tx.record_update(
            Record::FlowNode(instance.clone()),
            RecordEvent::new(event_types::FLOWNODE_ABORTED_BY_BOUNDARY)
                .for_process_instance(instance.parent_process_instance_id()),
        )
        .await?;
        Ok(())
    }
}
