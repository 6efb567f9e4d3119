use tracing::debug;

use super::model::{JobDescriptor, JobKind, JobParameter, ScheduledJob};
use crate::domain::process_instance::{FlowNodeInstanceId, ProcessDefinitionId, ProcessInstanceId};
use crate::execution::context::FlowNodeDispatch;
use crate::execution::executor::FlowNodeExecutor;
use crate::{CoreError, SchedulerError};

const PROCESS_DEFINITION_ID: &str = "processDefinitionId";
const CONTAINER_ID: &str = "containerId";
const FLOW_NODE_INSTANCE_ID: &str = "flowNodeInstanceId";

/// Resumes a waiting timer boundary event when its trigger fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerBoundaryTimerJob {
    dispatch: FlowNodeDispatch,
}

impl TriggerBoundaryTimerJob {
    /// Job for the boundary event `dispatch` points at
    pub fn new(dispatch: FlowNodeDispatch) -> Self {
        Self { dispatch }
    }

    /// The boundary event the job resumes
    pub fn dispatch(&self) -> FlowNodeDispatch {
        self.dispatch
    }

    /// Descriptor to persist for this job
    pub fn descriptor(&self, job_name: impl Into<String>) -> JobDescriptor {
        JobDescriptor {
            job_name: job_name.into(),
            description: format!(
                "Trigger timer boundary event {}",
                self.dispatch.flow_node_instance_id
            ),
            kind: JobKind::TriggerBoundaryTimer,
            disallow_concurrent_execution: true,
        }
    }

    /// Parameters to persist for this job
    pub fn parameters(&self) -> Vec<JobParameter> {
        vec![
            JobParameter::new(PROCESS_DEFINITION_ID, self.dispatch.process_definition_id.0),
            JobParameter::new(CONTAINER_ID, self.dispatch.container_id.0),
            JobParameter::new(FLOW_NODE_INSTANCE_ID, self.dispatch.flow_node_instance_id.0),
        ]
    }

    /// Rebuild the job from a persisted one
    pub fn from_job(job: &ScheduledJob) -> Result<Self, SchedulerError> {
        let read = |key: &str| {
            job.parameter(key).and_then(|value| value.as_u64()).ok_or_else(|| {
                SchedulerError::Executor(format!(
                    "Job {} is missing parameter {}",
                    job.descriptor.job_name, key
                ))
            })
        };

        Ok(Self::new(FlowNodeDispatch {
            process_definition_id: ProcessDefinitionId(read(PROCESS_DEFINITION_ID)?),
            container_id: ProcessInstanceId(read(CONTAINER_ID)?),
            flow_node_instance_id: FlowNodeInstanceId(read(FLOW_NODE_INSTANCE_ID)?),
            executer_id: 0,
            executer_substitution_id: 0,
        }))
    }

    /// Step the boundary event forward; returns once that step committed
    pub async fn execute(&self, executor: &FlowNodeExecutor) -> Result<(), CoreError> {
        debug!(
            flow_node_instance_id = %self.dispatch.flow_node_instance_id,
            "Timer fired for boundary event"
        );
        executor.step_forward(self.dispatch.flow_node_instance_id).await
    }
}
