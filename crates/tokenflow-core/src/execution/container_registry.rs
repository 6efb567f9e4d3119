use tokio::sync::mpsc;
use tracing::trace;

use super::context::FlowNodeDispatch;
use crate::domain::process_instance::{FlowNodeInstanceId, ProcessDefinitionId, ProcessInstanceId};
use crate::CoreError;

/// Entry point for re-entering the state machine of any flow node.
///
/// Callers never execute a node on their own stack: they queue a dispatch
/// and the runtime picks it up as a separate unit of work.
#[derive(Debug, Clone)]
pub struct ContainerRegistry {
    sender: mpsc::Sender<FlowNodeDispatch>,
}

impl ContainerRegistry {
    /// Create a registry and the receiving end the runtime drains
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<FlowNodeDispatch>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Queue one execution of a flow node
    pub async fn execute_flow_node(
        &self,
        process_definition_id: ProcessDefinitionId,
        container_id: ProcessInstanceId,
        flow_node_instance_id: FlowNodeInstanceId,
        executer_id: u64,
        executer_substitution_id: u64,
    ) -> Result<(), CoreError> {
        self.dispatch(FlowNodeDispatch {
            process_definition_id,
            container_id,
            flow_node_instance_id,
            executer_id,
            executer_substitution_id,
        })
        .await
    }

    /// Queue a prepared dispatch
    pub async fn dispatch(&self, dispatch: FlowNodeDispatch) -> Result<(), CoreError> {
        trace!(
            flow_node_instance_id = %dispatch.flow_node_instance_id,
            container_id = %dispatch.container_id,
            "Queueing flow node"
        );
        self.sender
            .send(dispatch)
            .await
            .map_err(|e| CoreError::DispatchError(format!("Dispatcher stopped: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_reaches_receiver() {
        let (registry, mut receiver) = ContainerRegistry::new(4);

        registry
            .execute_flow_node(
                ProcessDefinitionId(1),
                ProcessInstanceId(2),
                FlowNodeInstanceId(3),
                7,
                0,
            )
            .await
            .unwrap();

        let dispatch = receiver.recv().await.unwrap();
        assert_eq!(dispatch.flow_node_instance_id, FlowNodeInstanceId(3));
        assert_eq!(dispatch.container_id, ProcessInstanceId(2));
        assert_eq!(dispatch.executer_id, 7);
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_fails() {
        let (registry, receiver) = ContainerRegistry::new(1);
        drop(receiver);

        let result = registry
            .execute_flow_node(
                ProcessDefinitionId(1),
                ProcessInstanceId(2),
                FlowNodeInstanceId(3),
                0,
                0,
            )
            .await;
        assert!(matches!(result, Err(CoreError::DispatchError(_))));
    }
}
