//! Polling assertions over the engine API.
//!
//! Execution is asynchronous, so these helpers poll until the expected
//! state shows up or [`DEFAULT_TIMEOUT`] elapses. They read the tokio clock
//! and work with a paused runtime.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};

use tokenflow_core::{
    CoreError, FlowNodeInstance, Incident, ProcessApi, ProcessInstance, ProcessInstanceId,
    ProcessInstanceState, ProcessRuntime, StateCategory, StateId,
};
use tokenflow_state_inmemory::InMemoryIncidentService;

/// How long a wait lasts before it fails
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Error type for waits that did not succeed
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("Timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error(transparent)]
    Core(#[from] CoreError),
}

async fn poll<T, F, Fut>(what: String, mut check: F) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, CoreError>>,
{
    let started = Instant::now();
    loop {
        if let Some(found) = check().await? {
            return Ok(found);
        }
        let waited = started.elapsed();
        if waited >= DEFAULT_TIMEOUT {
            return Err(WaitError::Timeout { what, waited });
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Waits until the flow node `name` of the process instance is in `state`,
/// live or archived.
///
/// # Returns
///
/// * `Ok(FlowNodeInstance)` - The node as last seen in that state
/// * `Err(WaitError)` - If the state was not reached in time
pub async fn wait_for_flow_node_state(
    api: &dyn ProcessApi,
    process_instance_id: ProcessInstanceId,
    name: &str,
    state: StateId,
) -> Result<FlowNodeInstance, WaitError> {
    poll(
        format!("flow node {name} of process instance {process_instance_id} in state {state}"),
        move || async move {
            let live = api
                .flow_node_instances(process_instance_id)
                .await?
                .into_iter()
                .find(|node| node.name == name && node.state_id == state);
            if live.is_some() {
                return Ok(live);
            }
            Ok(api
                .archived_flow_node_instances(process_instance_id)
                .await?
                .into_iter()
                .map(|archived| archived.instance)
                .find(|node| node.name == name && node.state_id == state))
        },
    )
    .await
}

/// Waits until the user task `name` is ready to be executed
pub async fn wait_for_user_task(
    api: &dyn ProcessApi,
    process_instance_id: ProcessInstanceId,
    name: &str,
) -> Result<FlowNodeInstance, WaitError> {
    poll(
        format!("user task {name} of process instance {process_instance_id}"),
        move || async move {
            Ok(api
                .flow_node_instances(process_instance_id)
                .await?
                .into_iter()
                .find(|node| {
                    node.name == name
                        && node.state_id == StateId::READY
                        && node.state_category == StateCategory::Normal
                }))
        },
    )
    .await
}

/// Waits until the process instance is in `state`, live or archived
pub async fn wait_for_process_state(
    api: &dyn ProcessApi,
    process_instance_id: ProcessInstanceId,
    state: ProcessInstanceState,
) -> Result<ProcessInstance, WaitError> {
    poll(
        format!("process instance {process_instance_id} in state {state:?}"),
        move || async move {
            if let Some(archived) = api.get_archived_process_instance(process_instance_id).await? {
                return Ok((archived.instance.state == state).then_some(archived.instance));
            }
            Ok(api
                .get_process_instance(process_instance_id)
                .await?
                .filter(|instance| instance.state == state))
        },
    )
    .await
}

/// Waits until the runtime has no unit of work left
pub async fn wait_until_idle(runtime: &ProcessRuntime) -> Result<(), WaitError> {
    poll("an idle runtime".to_string(), move || async move {
        Ok((runtime.pending_work() == 0).then_some(()))
    })
    .await
}

/// Waits until an incident whose description starts with `prefix` is reported
pub async fn wait_for_incident(
    incidents: &InMemoryIncidentService,
    prefix: &str,
) -> Result<Incident, WaitError> {
    poll(format!("an incident starting with {prefix:?}"), move || async move {
        Ok(incidents
            .incidents()
            .into_iter()
            .find(|incident| incident.description.starts_with(prefix)))
    })
    .await
}
