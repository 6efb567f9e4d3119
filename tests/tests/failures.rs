//! Commit failures injected under a running engine

use std::sync::Arc;

use pretty_assertions::assert_eq;

use tokenflow_core::{
    CoreError, ProcessApi, ProcessInstanceState, Record, RecorderError, StateId,
};
use tokenflow_state_inmemory::InMemoryEngineProvider;
use tokenflow_test_utils::fixtures::{automatic_process, user_task_process};
use tokenflow_test_utils::{
    init_tracing, test_config, wait_for_flow_node_state, wait_for_process_state,
    FaultInjectingTransactionService, TestEngine,
};

async fn engine_with_faults() -> anyhow::Result<(TestEngine, Arc<FaultInjectingTransactionService>)>
{
    let provider = InMemoryEngineProvider::new();
    let faults = Arc::new(FaultInjectingTransactionService::new(
        provider.transaction_service(),
    ));
    let engine =
        TestEngine::start_with_transactions(provider, test_config(), faults.clone()).await?;
    Ok((engine, faults))
}

fn archives(name: &'static str) -> impl Fn(&Record) -> bool + Send + Sync + 'static {
    move |record: &Record| matches!(record, Record::ArchivedFlowNode(archived) if archived.instance.name == name)
}

#[tokio::test]
async fn test_transient_commit_failure_is_retried() -> anyhow::Result<()> {
    init_tracing();
    let (engine, faults) = engine_with_faults().await?;
    let api = engine.api();
    let definition = automatic_process(1, 3)?;
    api.deploy(definition.clone()).await?;
    faults.fail_commits_writing(
        2,
        RecorderError::Backend("connection reset".to_string()),
        archives("step2"),
    );

    let pid = api.start_process(definition.id).await?;
    wait_for_process_state(api, pid, ProcessInstanceState::Completed).await?;

    assert_eq!(faults.injected(), 2);
    let archived = api.archived_flow_node_instances(pid).await?;
    for name in ["start", "step1", "step2", "step3", "end"] {
        assert_eq!(
            archived
                .iter()
                .filter(|archived| archived.instance.name == name)
                .count(),
            1,
            "{name} archived once"
        );
    }
    assert!(api.tokens(pid).await?.is_empty());
    assert!(engine.provider().incidents().incidents().is_empty());
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_permanent_failure_marks_node_failed_and_reports_incident() -> anyhow::Result<()> {
    init_tracing();
    let (engine, faults) = engine_with_faults().await?;
    let api = engine.api();
    let definition = automatic_process(1, 3)?;
    api.deploy(definition.clone()).await?;
    faults.fail_commits_writing(
        1,
        RecorderError::Duplicate("unique constraint".to_string()),
        archives("step2"),
    );

    let pid = api.start_process(definition.id).await?;
    let failed = wait_for_flow_node_state(api, pid, "step2", StateId::FAILED).await?;
    assert!(failed.stable);

    let incidents = engine.provider().incidents().incidents();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].description, format!("Execute flow node {}", failed.id));
    assert!(incidents[0].recovery_procedure.contains(&pid.to_string()));

    // nothing past the failed node ran and its token is kept
    let instance = api.get_process_instance(pid).await?.expect("still running");
    assert_eq!(instance.state, ProcessInstanceState::Started);
    assert_eq!(api.tokens(pid).await?.len(), 1);
    assert!(api
        .flow_node_instances(pid)
        .await?
        .iter()
        .all(|node| node.name != "step3"));
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_failed_start_leaves_no_records() -> anyhow::Result<()> {
    init_tracing();
    let (engine, faults) = engine_with_faults().await?;
    let api = engine.api();
    let definition = user_task_process(1, "approve")?;
    api.deploy(definition.clone()).await?;
    faults.fail_next_commits(1, RecorderError::Duplicate("unique constraint".to_string()));

    let result = api.start_process(definition.id).await;

    assert!(matches!(
        result,
        Err(CoreError::Recorder(RecorderError::Duplicate(_)))
    ));
    assert_eq!(engine.provider().store().record_count(), 0);
    engine.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_transient_start_failure_is_retried() -> anyhow::Result<()> {
    init_tracing();
    let (engine, faults) = engine_with_faults().await?;
    let api = engine.api();
    let definition = user_task_process(1, "approve")?;
    api.deploy(definition.clone()).await?;
    faults.fail_next_commits(1, RecorderError::Backend("connection reset".to_string()));

    let pid = api.start_process(definition.id).await?;

    assert_eq!(faults.injected(), 1);
    let instance = api.get_process_instance(pid).await?.expect("started");
    assert_eq!(instance.state, ProcessInstanceState::Started);
    engine.shutdown().await?;
    Ok(())
}
