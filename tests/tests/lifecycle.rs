//! Process instance lifecycle through the public API

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use tokenflow_core::{
    ApiSession, CoreError, EngineConfig, FlowNodeInstanceId, ProcessApi, ProcessDefinitionId,
    ProcessInstanceId, ProcessInstanceState, StateId, TenantId, TenantScopedProcessApi,
};
use tokenflow_state_inmemory::InMemoryEngineProvider;
use tokenflow_test_utils::fixtures::{
    automatic_process, parallel_process, timer_boundary_process, user_task_process,
    INTERRUPT_TIMER, NON_INTERRUPT_TIMER, TASK_WITH_BOUNDARY,
};
use tokenflow_test_utils::{
    init_tracing, wait_for_flow_node_state, wait_for_process_state, wait_for_user_task,
    TestEngine,
};

#[tokio::test]
async fn test_automatic_process_runs_to_completion() -> anyhow::Result<()> {
    init_tracing();
    let engine = TestEngine::start().await?;
    let api = engine.api();
    let definition = automatic_process(1, 3)?;
    api.deploy(definition.clone()).await?;

    let pid = api.start_process(definition.id).await?;
    let finished = wait_for_process_state(api, pid, ProcessInstanceState::Completed).await?;

    assert_eq!(finished.id, pid);
    assert!(api.get_process_instance(pid).await?.is_none());
    let archived = api.archived_flow_node_instances(pid).await?;
    assert_eq!(archived.len(), 5);
    assert!(archived
        .iter()
        .all(|archived| archived.instance.state_id == StateId::COMPLETED));
    assert!(api.tokens(pid).await?.is_empty());
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_user_task_completes_when_executed() -> anyhow::Result<()> {
    init_tracing();
    let engine = TestEngine::start().await?;
    let api = engine.api();
    let definition = user_task_process(1, "approve")?;
    api.deploy(definition.clone()).await?;
    let pid = api.start_process(definition.id).await?;

    let task = wait_for_user_task(api, pid, "approve").await?;
    assert_eq!(task.token_ref_id, Some(pid.0));
    assert_eq!(api.tokens(pid).await?.len(), 1);

    api.execute_user_task(task.id, 42).await?;
    wait_for_process_state(api, pid, ProcessInstanceState::Completed).await?;
    wait_for_flow_node_state(api, pid, "approve", StateId::COMPLETED).await?;
    assert!(api.tokens(pid).await?.is_empty());
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_executing_a_task_twice_completes_it_once() -> anyhow::Result<()> {
    init_tracing();
    let engine = TestEngine::start().await?;
    let api = engine.api();
    let definition = user_task_process(1, "approve")?;
    api.deploy(definition.clone()).await?;
    let pid = api.start_process(definition.id).await?;
    let task = wait_for_user_task(api, pid, "approve").await?;

    api.execute_user_task(task.id, 42).await?;
    let second = api.execute_user_task(task.id, 42).await;
    assert!(matches!(
        second,
        Ok(()) | Err(CoreError::IllegalState(_)) | Err(CoreError::FlowNodeInstanceNotFound(_))
    ));

    wait_for_process_state(api, pid, ProcessInstanceState::Completed).await?;
    let ends = api
        .archived_flow_node_instances(pid)
        .await?
        .into_iter()
        .filter(|archived| archived.instance.name == "end")
        .count();
    assert_eq!(ends, 1);
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_only_ready_user_tasks_can_be_executed() -> anyhow::Result<()> {
    init_tracing();
    let engine = TestEngine::start().await?;
    let api = engine.api();
    let definition =
        timer_boundary_process(1, Duration::from_secs(60), Duration::from_secs(60))?;
    api.deploy(definition.clone()).await?;
    let pid = api.start_process(definition.id).await?;
    wait_for_user_task(api, pid, TASK_WITH_BOUNDARY).await?;

    let timer = wait_for_flow_node_state(api, pid, INTERRUPT_TIMER, StateId::WAITING).await?;
    assert!(matches!(
        api.execute_user_task(timer.id, 1).await,
        Err(CoreError::IllegalState(_))
    ));
    assert!(matches!(
        api.execute_user_task(FlowNodeInstanceId(999_999), 1).await,
        Err(CoreError::FlowNodeInstanceNotFound(_))
    ));

    api.delete_process_instance(pid).await?;
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_unknown_definition_cannot_be_started() -> anyhow::Result<()> {
    let engine = TestEngine::start().await?;

    let result = engine.api().start_process(ProcessDefinitionId(404)).await;

    assert!(matches!(result, Err(CoreError::ProcessDefinitionNotFound(_))));
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_parallel_branches_are_joined() -> anyhow::Result<()> {
    init_tracing();
    let engine = TestEngine::start().await?;
    let api = engine.api();
    let definition = parallel_process(1)?;
    api.deploy(definition.clone()).await?;
    let pid = api.start_process(definition.id).await?;

    let left = wait_for_user_task(api, pid, "left").await?;
    let right = wait_for_user_task(api, pid, "right").await?;
    let fork = wait_for_flow_node_state(api, pid, "fork", StateId::COMPLETED).await?;
    assert_eq!(left.token_ref_id, Some(fork.id.0));
    assert_eq!(right.token_ref_id, Some(fork.id.0));
    let tokens = api.tokens(pid).await?;
    assert_eq!(tokens.len(), 2);
    assert!(tokens.iter().all(|token| token.parent_ref_id == Some(pid.0)));

    api.execute_user_task(left.id, 1).await?;
    let waiting = wait_for_flow_node_state(api, pid, "join", StateId::INITIALIZING).await?;
    assert_eq!(waiting.incoming_token_refs.len(), 1);

    api.execute_user_task(right.id, 1).await?;
    wait_for_process_state(api, pid, ProcessInstanceState::Completed).await?;
    let join = wait_for_flow_node_state(api, pid, "join", StateId::COMPLETED).await?;
    assert_eq!(join.token_ref_id, Some(pid.0));
    assert!(api.tokens(pid).await?.is_empty());
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_unwinds_every_flow_node() -> anyhow::Result<()> {
    init_tracing();
    let engine = TestEngine::start().await?;
    let api = engine.api();
    let definition =
        timer_boundary_process(1, Duration::from_secs(5), Duration::from_secs(10))?;
    api.deploy(definition.clone()).await?;
    let pid = api.start_process(definition.id).await?;
    wait_for_user_task(api, pid, TASK_WITH_BOUNDARY).await?;
    wait_for_flow_node_state(api, pid, NON_INTERRUPT_TIMER, StateId::WAITING).await?;

    api.cancel_process_instance(pid).await?;
    // a second request while unwinding is accepted
    let again = api.cancel_process_instance(pid).await;
    assert!(matches!(again, Ok(()) | Err(CoreError::ProcessInstanceNotFound(_))));

    let cancelled = wait_for_process_state(api, pid, ProcessInstanceState::Cancelled).await?;
    assert!(cancelled.end_at.is_some());
    for name in [TASK_WITH_BOUNDARY, INTERRUPT_TIMER, NON_INTERRUPT_TIMER] {
        wait_for_flow_node_state(api, pid, name, StateId::CANCELLED).await?;
    }
    assert!(api.tokens(pid).await?.is_empty());
    assert!(engine.provider().jobs().is_empty());

    // the timers never fire
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(api.archived_flow_node_instances(pid).await?.len(), 4);

    assert!(matches!(
        api.cancel_process_instance(pid).await,
        Err(CoreError::ProcessInstanceNotFound(_))
    ));
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_delete_finished_process_instance() -> anyhow::Result<()> {
    init_tracing();
    let engine = TestEngine::start().await?;
    let api = engine.api();
    let definition = automatic_process(1, 2)?;
    api.deploy(definition.clone()).await?;
    let pid = api.start_process(definition.id).await?;
    wait_for_process_state(api, pid, ProcessInstanceState::Completed).await?;

    api.delete_process_instance(pid).await?;

    assert!(api.get_archived_process_instance(pid).await?.is_none());
    assert!(api.archived_flow_node_instances(pid).await?.is_empty());
    assert!(api.tokens(pid).await?.is_empty());
    assert!(engine.provider().store().records_of(pid).is_empty());
    assert!(matches!(
        api.delete_process_instance(pid).await,
        Err(CoreError::ProcessInstanceNotFound(_))
    ));
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_delete_unknown_process_instance() -> anyhow::Result<()> {
    let engine = TestEngine::start().await?;

    let result = engine
        .api()
        .delete_process_instance(ProcessInstanceId(123_456))
        .await;

    assert!(matches!(result, Err(CoreError::ProcessInstanceNotFound(_))));
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_tenant_scoped_session() -> anyhow::Result<()> {
    init_tracing();
    let engine = TestEngine::start().await?;
    let runtime: Arc<dyn ProcessApi> = engine.runtime().clone();

    let refused = TenantScopedProcessApi::new(
        runtime.clone(),
        ApiSession::new(TenantId(2), "helen.kelly"),
    );
    assert!(matches!(refused, Err(CoreError::IllegalState(_))));

    let session = ApiSession::new(TenantId(1), "walter.bates");
    let api = TenantScopedProcessApi::new(runtime, session.clone())?;
    assert_eq!(api.session(), &session);

    let definition = user_task_process(1, "approve")?;
    api.deploy(definition.clone()).await?;
    let pid = api.start_process(definition.id).await?;
    let task = wait_for_user_task(&api, pid, "approve").await?;
    api.execute_user_task(task.id, 1).await?;
    wait_for_process_state(&api, pid, ProcessInstanceState::Completed).await?;
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_runtime_configured_from_environment() -> anyhow::Result<()> {
    init_tracing();
    let provider = InMemoryEngineProvider::new();
    let runtime = provider.start_runtime_from_env().await?;
    assert_eq!(runtime.tenant_id(), TenantId(EngineConfig::load()?.tenant_id));

    let definition = automatic_process(1, 2)?;
    runtime.deploy(definition.clone()).await?;
    let pid = runtime.start_process(definition.id).await?;
    wait_for_process_state(runtime.as_ref(), pid, ProcessInstanceState::Completed).await?;

    runtime.shutdown().await?;
    Ok(())
}
