//! Interrupting and non-interrupting timers racing on the same user task

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::time::Instant;

use tokenflow_core::{
    FlowNodeInstance, ProcessApi, ProcessInstanceId, ProcessInstanceState, StateCategory, StateId,
};
use tokenflow_test_utils::fixtures::{
    timer_boundary_process, AFTER_INTERRUPT, AFTER_NON_INTERRUPT, INTERRUPT_TIMER,
    NON_INTERRUPT_TIMER, TASK_WITH_BOUNDARY,
};
use tokenflow_test_utils::{
    init_tracing, wait_for_flow_node_state, wait_for_process_state, wait_for_user_task,
    TestEngine,
};

async fn all_nodes(
    api: &dyn ProcessApi,
    pid: ProcessInstanceId,
) -> anyhow::Result<Vec<FlowNodeInstance>> {
    let mut nodes = api.flow_node_instances(pid).await?;
    nodes.extend(
        api.archived_flow_node_instances(pid)
            .await?
            .into_iter()
            .map(|archived| archived.instance),
    );
    Ok(nodes)
}

async fn count_named(api: &dyn ProcessApi, pid: ProcessInstanceId, name: &str) -> anyhow::Result<usize> {
    Ok(all_nodes(api, pid)
        .await?
        .iter()
        .filter(|node| node.name == name)
        .count())
}

async fn assert_deleted(engine: &TestEngine, pid: ProcessInstanceId) -> anyhow::Result<()> {
    let api = engine.api();
    assert!(api.get_process_instance(pid).await?.is_none());
    assert!(api.get_archived_process_instance(pid).await?.is_none());
    assert!(api.flow_node_instances(pid).await?.is_empty());
    assert!(api.archived_flow_node_instances(pid).await?.is_empty());
    assert!(api.tokens(pid).await?.is_empty());
    assert!(engine.provider().jobs().is_empty());
    assert!(engine.provider().triggers().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_interrupting_timer_after_non_interrupting() -> anyhow::Result<()> {
    init_tracing();
    let engine = TestEngine::start().await?;
    let api = engine.api();
    let definition =
        timer_boundary_process(1, Duration::from_millis(1000), Duration::from_millis(100))?;
    api.deploy(definition.clone()).await?;

    let started = Instant::now();
    let pid = api.start_process(definition.id).await?;
    let task = wait_for_user_task(api, pid, TASK_WITH_BOUNDARY).await?;

    // the non-interrupting path opens while the task keeps running
    let after_non_interrupt = wait_for_user_task(api, pid, AFTER_NON_INTERRUPT).await?;
    let running = api
        .flow_node_instances(pid)
        .await?
        .into_iter()
        .find(|node| node.id == task.id)
        .expect("task is still running");
    assert_eq!(running.state_id, StateId::READY);
    assert_eq!(running.state_category, StateCategory::Normal);

    let aborted = wait_for_flow_node_state(api, pid, TASK_WITH_BOUNDARY, StateId::ABORTED).await?;
    assert!(started.elapsed() >= Duration::from_millis(900));
    let interrupt_timer =
        wait_for_flow_node_state(api, pid, INTERRUPT_TIMER, StateId::COMPLETED).await?;
    assert_eq!(aborted.aborted_by_boundary, Some(interrupt_timer.id));
    let after_interrupt = wait_for_user_task(api, pid, AFTER_INTERRUPT).await?;

    // the interrupting branch continues the task's token, the other one is a new root
    let non_interrupt_timer =
        wait_for_flow_node_state(api, pid, NON_INTERRUPT_TIMER, StateId::COMPLETED).await?;
    assert_eq!(after_interrupt.token_ref_id, task.token_ref_id);
    assert_eq!(after_non_interrupt.token_ref_id, Some(non_interrupt_timer.id.0));
    let mut tokens = api.tokens(pid).await?;
    tokens.sort_by_key(|token| token.ref_id);
    let mut expected = vec![
        (pid.0, None),
        (non_interrupt_timer.id.0, None),
    ];
    expected.sort();
    assert_eq!(
        tokens
            .iter()
            .map(|token| (token.ref_id, token.parent_ref_id))
            .collect::<Vec<_>>(),
        expected
    );

    api.delete_process_instance(pid).await?;
    assert_deleted(&engine, pid).await?;
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_non_interrupting_timer_suppressed_by_interrupt() -> anyhow::Result<()> {
    init_tracing();
    let engine = TestEngine::start().await?;
    let api = engine.api();
    let definition =
        timer_boundary_process(2, Duration::from_millis(100), Duration::from_secs(30))?;
    api.deploy(definition.clone()).await?;

    let started = Instant::now();
    let pid = api.start_process(definition.id).await?;

    wait_for_flow_node_state(api, pid, TASK_WITH_BOUNDARY, StateId::ABORTED).await?;
    assert!(started.elapsed() < Duration::from_secs(30));
    let suppressed =
        wait_for_flow_node_state(api, pid, NON_INTERRUPT_TIMER, StateId::ABORTED).await?;
    assert_eq!(suppressed.token_ref_id, None);
    wait_for_user_task(api, pid, AFTER_INTERRUPT).await?;

    // well past the non-interrupting deadline nothing else happens
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(count_named(api, pid, AFTER_NON_INTERRUPT).await?, 0);
    assert_eq!(count_named(api, pid, AFTER_INTERRUPT).await?, 1);
    assert!(engine.provider().jobs().is_empty());
    assert_eq!(api.tokens(pid).await?.len(), 1);

    api.delete_process_instance(pid).await?;
    assert_deleted(&engine, pid).await?;
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_timers_with_the_same_deadline_interrupt_once() -> anyhow::Result<()> {
    init_tracing();
    let engine = TestEngine::start().await?;
    let api = engine.api();
    let definition =
        timer_boundary_process(3, Duration::from_millis(100), Duration::from_millis(100))?;
    api.deploy(definition.clone()).await?;
    let pid = api.start_process(definition.id).await?;

    let aborted = wait_for_flow_node_state(api, pid, TASK_WITH_BOUNDARY, StateId::ABORTED).await?;
    wait_for_user_task(api, pid, AFTER_INTERRUPT).await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let interrupt_timer =
        wait_for_flow_node_state(api, pid, INTERRUPT_TIMER, StateId::COMPLETED).await?;
    assert_eq!(aborted.aborted_by_boundary, Some(interrupt_timer.id));
    assert_eq!(count_named(api, pid, AFTER_INTERRUPT).await?, 1);
    // the non-interrupting timer either fired first or was aborted with the task
    let non_interrupt_paths = count_named(api, pid, AFTER_NON_INTERRUPT).await?;
    assert!(non_interrupt_paths <= 1);
    assert_eq!(api.tokens(pid).await?.len(), 1 + non_interrupt_paths);

    api.delete_process_instance(pid).await?;
    assert_deleted(&engine, pid).await?;
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_task_completed_before_any_timer() -> anyhow::Result<()> {
    init_tracing();
    let engine = TestEngine::start().await?;
    let api = engine.api();
    let definition =
        timer_boundary_process(4, Duration::from_secs(5), Duration::from_secs(10))?;
    api.deploy(definition.clone()).await?;
    let pid = api.start_process(definition.id).await?;

    let task = wait_for_user_task(api, pid, TASK_WITH_BOUNDARY).await?;
    api.execute_user_task(task.id, 7).await?;

    let finished = wait_for_process_state(api, pid, ProcessInstanceState::Completed).await?;
    assert!(finished.end_at.is_some());
    wait_for_flow_node_state(api, pid, INTERRUPT_TIMER, StateId::ABORTED).await?;
    wait_for_flow_node_state(api, pid, NON_INTERRUPT_TIMER, StateId::ABORTED).await?;

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(count_named(api, pid, AFTER_INTERRUPT).await?, 0);
    assert_eq!(count_named(api, pid, AFTER_NON_INTERRUPT).await?, 0);
    assert!(engine.provider().jobs().is_empty());
    assert!(api.tokens(pid).await?.is_empty());

    api.delete_process_instance(pid).await?;
    assert_deleted(&engine, pid).await?;
    engine.shutdown().await?;
    Ok(())
}
