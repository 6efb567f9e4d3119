use std::time::Duration;
use tracing::warn;

use crate::domain::flow_node_instance::FlowNodeInstance;
use crate::domain::process_instance::{FlowNodeInstanceId, ProcessDefinitionId, ProcessInstanceId};
use crate::domain::repository::Transaction;
use crate::RecorderError;

/// Everything needed to re-enter the state machine for one flow node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowNodeDispatch {
    /// Definition of the node's process
    pub process_definition_id: ProcessDefinitionId,
    /// Container (process instance) owning the node
    pub container_id: ProcessInstanceId,
    /// Node to execute
    pub flow_node_instance_id: FlowNodeInstanceId,
    /// User on whose behalf the node runs; 0 for the engine
    pub executer_id: u64,
    /// User the executer substitutes; 0 for none
    pub executer_substitution_id: u64,
}

impl FlowNodeDispatch {
    /// Engine-initiated dispatch of `instance`
    pub fn for_instance(instance: &FlowNodeInstance) -> Self {
        Self {
            process_definition_id: instance.process_definition_id(),
            container_id: instance.parent_process_instance_id(),
            flow_node_instance_id: instance.id,
            executer_id: 0,
            executer_substitution_id: 0,
        }
    }
}

/// Work that may only happen once the transaction committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// Re-enter the state machine for a node
    Dispatch(FlowNodeDispatch),
    /// Arm the timer of a boundary event
    ScheduleTimer {
        /// Unique job name
        job_name: String,
        /// Boundary event to resume
        dispatch: FlowNodeDispatch,
        /// Delay before firing
        delay: Duration,
    },
    /// Disarm a boundary event timer
    RemoveTimer {
        /// Job name given when scheduling
        job_name: String,
    },
}

/// One transaction plus the side effects it will release on commit
pub struct ExecutionContext {
    tx: Box<dyn Transaction>,
    effects: Vec<SideEffect>,
}

impl ExecutionContext {
    /// Wrap a freshly begun transaction
    pub fn new(tx: Box<dyn Transaction>) -> Self {
        Self {
            tx,
            effects: Vec::new(),
        }
    }

    /// The underlying transaction
    #[inline]
    pub fn tx(&mut self) -> &mut dyn Transaction {
        self.tx.as_mut()
    }

    /// Dispatch `instance` after commit
    pub fn dispatch(&mut self, instance: &FlowNodeInstance) {
        let dispatch = SideEffect::Dispatch(FlowNodeDispatch::for_instance(instance));
        if !self.effects.contains(&dispatch) {
            self.effects.push(dispatch);
        }
    }

    /// Schedule the timer of a boundary event after commit
    pub fn schedule_timer(&mut self, job_name: String, boundary: &FlowNodeInstance, delay: Duration) {
        self.effects.push(SideEffect::ScheduleTimer {
            job_name,
            dispatch: FlowNodeDispatch::for_instance(boundary),
            delay,
        });
    }

    /// Remove a boundary event timer after commit
    pub fn remove_timer(&mut self, job_name: String) {
        self.effects.push(SideEffect::RemoveTimer { job_name });
    }

    /// Side effects recorded so far
    pub fn effects(&self) -> &[SideEffect] {
        &self.effects
    }

    /// Commit and hand back the side effects to release
    pub async fn commit(mut self) -> Result<Vec<SideEffect>, RecorderError> {
        self.tx.commit().await?;
        Ok(self.effects)
    }

    /// Roll back; the side effects are dropped
    pub async fn rollback(mut self) {
        if let Err(e) = self.tx.rollback().await {
            warn!(error = %e, "Rollback failed");
        }
    }
}
