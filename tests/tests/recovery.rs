//! Restarting the engine over the storage a previous run left behind

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use tokenflow_core::{
    JobDescriptor, JobKind, JobService, ProcessApi, ProcessInstanceId, ProcessInstanceState,
    Record, RecorderError, StateId,
};
use tokenflow_state_inmemory::{InMemoryEngineProvider, TriggerState};
use tokenflow_test_utils::fixtures::{
    automatic_process, timer_boundary_process, AFTER_INTERRUPT, INTERRUPT_TIMER,
    NON_INTERRUPT_TIMER, TASK_WITH_BOUNDARY,
};
use tokenflow_test_utils::{
    init_tracing, test_config, wait_for_flow_node_state, wait_for_incident,
    wait_for_process_state, wait_for_user_task, FaultInjectingTransactionService, TestEngine,
};

async fn archived_count(
    api: &dyn ProcessApi,
    pid: ProcessInstanceId,
    name: &str,
) -> anyhow::Result<usize> {
    Ok(api
        .archived_flow_node_instances(pid)
        .await?
        .iter()
        .filter(|archived| archived.instance.name == name)
        .count())
}

#[tokio::test(start_paused = true)]
async fn test_waiting_timer_fires_after_restart() -> anyhow::Result<()> {
    init_tracing();
    let engine = TestEngine::start().await?;
    let definition =
        timer_boundary_process(1, Duration::from_millis(500), Duration::from_secs(60))?;
    engine.api().deploy(definition.clone()).await?;
    let pid = engine.api().start_process(definition.id).await?;
    wait_for_user_task(engine.api(), pid, TASK_WITH_BOUNDARY).await?;
    let timer =
        wait_for_flow_node_state(engine.api(), pid, INTERRUPT_TIMER, StateId::WAITING).await?;
    assert!(engine
        .provider()
        .triggers()
        .state(timer.timer_job_name.as_deref().unwrap_or_default())
        .is_some());

    let engine = engine.restart().await?;
    let api = engine.api();

    wait_for_flow_node_state(api, pid, TASK_WITH_BOUNDARY, StateId::ABORTED).await?;
    wait_for_user_task(api, pid, AFTER_INTERRUPT).await?;
    assert_eq!(archived_count(api, pid, INTERRUPT_TIMER).await?, 1);

    api.delete_process_instance(pid).await?;
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_fired_trigger_never_fires_again() -> anyhow::Result<()> {
    init_tracing();
    let engine = TestEngine::start().await?;
    let api = engine.api();
    let definition =
        timer_boundary_process(1, Duration::from_millis(100), Duration::from_secs(60))?;
    api.deploy(definition.clone()).await?;
    let pid = api.start_process(definition.id).await?;

    let timer = wait_for_flow_node_state(api, pid, INTERRUPT_TIMER, StateId::COMPLETED).await?;
    wait_for_user_task(api, pid, AFTER_INTERRUPT).await?;
    let job_name = timer.timer_job_name.clone().unwrap_or_default();
    assert!(engine.provider().triggers().state(&job_name).is_none());
    assert!(!engine.provider().jobs().job_names().contains(&job_name));

    // recovery has nothing erroneous to reschedule for this timer
    api.recover().await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    let engine = engine.restart().await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let api = engine.api();
    assert_eq!(archived_count(api, pid, INTERRUPT_TIMER).await?, 1);
    assert_eq!(
        api.flow_node_instances(pid)
            .await?
            .iter()
            .filter(|node| node.name == AFTER_INTERRUPT)
            .count(),
        1
    );

    api.delete_process_instance(pid).await?;
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_restart_finishes_interrupted_work() -> anyhow::Result<()> {
    init_tracing();
    let engine = TestEngine::start().await?;
    let definition = automatic_process(1, 4)?;
    engine.api().deploy(definition.clone()).await?;
    let pid = engine.api().start_process(definition.id).await?;

    // stop before the dispatched work had a chance to run
    let engine = engine.restart().await?;
    let api = engine.api();

    wait_for_process_state(api, pid, ProcessInstanceState::Completed).await?;
    for name in ["start", "step1", "step2", "step3", "step4", "end"] {
        assert_eq!(archived_count(api, pid, name).await?, 1, "{name} ran once");
    }
    assert!(api.tokens(pid).await?.is_empty());
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_trigger_outlives_an_uncommitted_timer_step() -> anyhow::Result<()> {
    init_tracing();
    let provider = InMemoryEngineProvider::new();
    let faults = Arc::new(FaultInjectingTransactionService::new(
        provider.transaction_service(),
    ));
    let config = test_config();
    let engine =
        TestEngine::start_with_transactions(provider, config.clone(), faults.clone()).await?;
    let definition =
        timer_boundary_process(1, Duration::from_millis(500), Duration::from_secs(60))?;
    engine.api().deploy(definition.clone()).await?;
    let pid = engine.api().start_process(definition.id).await?;
    let timer =
        wait_for_flow_node_state(engine.api(), pid, INTERRUPT_TIMER, StateId::WAITING).await?;
    let job_name = timer.timer_job_name.clone().unwrap_or_default();

    // every attempt of the fired timer's step loses its commit
    faults.fail_commits_writing(
        config.max_work_retries as usize + 1,
        RecorderError::Backend("connection reset".to_string()),
        |record| match record {
            Record::FlowNode(node) => node.name == INTERRUPT_TIMER,
            Record::ArchivedFlowNode(archived) => archived.instance.name == INTERRUPT_TIMER,
            _ => false,
        },
    );
    let incident = wait_for_incident(engine.provider().incidents(), "Trigger timer").await?;
    assert!(incident.description.contains(&job_name));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the timer is still owed to the boundary
    assert_eq!(
        engine.provider().triggers().state(&job_name),
        Some(TriggerState::Error)
    );
    assert!(engine.provider().jobs().job_names().contains(&job_name));
    let waiting = engine
        .api()
        .flow_node_instances(pid)
        .await?
        .into_iter()
        .find(|node| node.name == INTERRUPT_TIMER)
        .expect("boundary still live");
    assert_eq!(waiting.state_id, StateId::WAITING);

    let engine = engine.restart().await?;
    let api = engine.api();

    wait_for_flow_node_state(api, pid, TASK_WITH_BOUNDARY, StateId::ABORTED).await?;
    wait_for_user_task(api, pid, AFTER_INTERRUPT).await?;
    assert_eq!(archived_count(api, pid, INTERRUPT_TIMER).await?, 1);
    assert!(engine.provider().triggers().state(&job_name).is_none());

    api.delete_process_instance(pid).await?;
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_restart_rearms_a_timer_whose_job_was_lost() -> anyhow::Result<()> {
    init_tracing();
    let engine = TestEngine::start().await?;
    let definition =
        timer_boundary_process(1, Duration::from_secs(2), Duration::from_secs(60))?;
    engine.api().deploy(definition.clone()).await?;
    let pid = engine.api().start_process(definition.id).await?;
    let timer =
        wait_for_flow_node_state(engine.api(), pid, INTERRUPT_TIMER, StateId::WAITING).await?;
    let job_name = timer.timer_job_name.clone().unwrap_or_default();

    // committed as waiting, but the job never made it to the scheduler
    assert!(engine.provider().jobs().delete_job(&job_name).await?);

    let engine = engine.restart().await?;
    let api = engine.api();
    assert!(engine.provider().jobs().job_names().contains(&job_name));
    assert_eq!(
        engine.provider().triggers().state(&job_name),
        Some(TriggerState::Waiting)
    );

    wait_for_flow_node_state(api, pid, TASK_WITH_BOUNDARY, StateId::ABORTED).await?;
    wait_for_user_task(api, pid, AFTER_INTERRUPT).await?;
    assert_eq!(archived_count(api, pid, INTERRUPT_TIMER).await?, 1);
    assert!(engine.provider().incidents().incidents().is_empty());

    api.delete_process_instance(pid).await?;
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unschedulable_timer_fails_its_boundary() -> anyhow::Result<()> {
    init_tracing();
    let provider = InMemoryEngineProvider::new();
    // every job name a boundary could get is taken
    for id in 1..=64 {
        provider
            .jobs()
            .create_job_descriptor(
                JobDescriptor {
                    job_name: format!("timer-boundary-{id}"),
                    description: "occupied".to_string(),
                    kind: JobKind::TriggerBoundaryTimer,
                    disallow_concurrent_execution: true,
                },
                vec![],
            )
            .await?;
    }
    let engine = TestEngine::start_on(provider, test_config()).await?;
    let api = engine.api();
    let definition =
        timer_boundary_process(1, Duration::from_millis(500), Duration::from_secs(60))?;
    api.deploy(definition.clone()).await?;
    let pid = api.start_process(definition.id).await?;

    let failed = wait_for_flow_node_state(api, pid, INTERRUPT_TIMER, StateId::FAILED).await?;
    wait_for_flow_node_state(api, pid, NON_INTERRUPT_TIMER, StateId::FAILED).await?;
    let incident = wait_for_incident(engine.provider().incidents(), "Schedule timer").await?;
    assert!(incident.recovery_procedure.contains(&pid.to_string()));
    assert!(engine.provider().triggers().is_empty());

    // nothing fires and recovery leaves failed boundaries alone
    tokio::time::sleep(Duration::from_secs(1)).await;
    api.recover().await?;
    assert!(engine.provider().triggers().is_empty());
    let task = wait_for_user_task(api, pid, TASK_WITH_BOUNDARY).await?;
    assert_eq!(archived_count(api, pid, AFTER_INTERRUPT).await?, 0);
    assert!(api
        .flow_node_instances(pid)
        .await?
        .iter()
        .any(|node| node.id == failed.id && node.state_id == StateId::FAILED));

    api.execute_user_task(task.id, 7).await?;
    wait_for_process_state(api, pid, ProcessInstanceState::Completed).await?;
    engine.shutdown().await?;
    Ok(())
}
