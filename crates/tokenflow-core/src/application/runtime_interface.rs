use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::application::activity_instance_service::{
    ActivityInstanceService, RecorderActivityInstanceService,
};
use crate::application::token_ledger::{TokenLedger, TokenService};
use crate::domain::events::{event_types, RecordEvent};
use crate::domain::flow_node_instance::{ArchivedFlowNodeInstance, FlowNodeInstance, StateCategory};
use crate::domain::process_definition::{FlowNodeType, ProcessDefinition};
use crate::domain::process_instance::{
    ArchivedProcessInstance, FlowNodeInstanceId, ProcessDefinitionId, ProcessInstance,
    ProcessInstanceId, TenantId,
};
use crate::domain::repository::{
    IncidentService, ProcessDefinitionRepository, Record, RecordKey, TransactionService,
};
use crate::domain::token::Token;
use crate::execution::{
    ContainerRegistry, ExecuteFlowNodeWork, FlowNodeContextWork, FlowNodeDispatch,
    FlowNodeExecutor, ProcessInstanceContextWork, TriggerBoundaryTimerWork, Work, WorkService,
};
use crate::scheduler::{FiredJob, JobId, JobKind, SchedulerService, TriggerBoundaryTimerJob};
use crate::state::{StateId, StateRegistry};
use crate::{CoreError, EngineConfig, SchedulerError};

/// Everything one tenant's engine needs, handed over explicitly
#[derive(Clone)]
pub struct TenantContext {
    /// Tenant served by this engine
    pub tenant_id: TenantId,
    /// Engine settings
    pub config: EngineConfig,
    /// Recorder transactions
    pub transactions: Arc<dyn TransactionService>,
    /// Deployed process definitions
    pub definitions: Arc<dyn ProcessDefinitionRepository>,
    /// Timer/job scheduler
    pub scheduler: SchedulerService,
    /// Receives failures of units of work
    pub incidents: Arc<dyn IncidentService>,
}

/// The API offered to callers of the engine
#[async_trait]
pub trait ProcessApi: Send + Sync {
    /// Tenant the API serves
    fn tenant_id(&self) -> TenantId;

    /// Validate and store a process definition
    async fn deploy(&self, definition: ProcessDefinition) -> Result<(), CoreError>;

    /// Create a process instance and dispatch its start event
    async fn start_process(
        &self,
        process_definition_id: ProcessDefinitionId,
    ) -> Result<ProcessInstanceId, CoreError>;

    /// Execute a user task waiting in `ready`
    async fn execute_user_task(
        &self,
        flow_node_instance_id: FlowNodeInstanceId,
        executer_id: u64,
    ) -> Result<(), CoreError>;

    /// Cancel every live flow node of a process instance
    async fn cancel_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<(), CoreError>;

    /// Remove a process instance with its flow nodes, tokens, archives and timers
    async fn delete_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<(), CoreError>;

    /// Live process instance
    async fn get_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Option<ProcessInstance>, CoreError>;

    /// Finished process instance
    async fn get_archived_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Option<ArchivedProcessInstance>, CoreError>;

    /// Live flow nodes of a process instance
    async fn flow_node_instances(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<FlowNodeInstance>, CoreError>;

    /// Finished flow nodes of a process instance
    async fn archived_flow_node_instances(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<ArchivedFlowNodeInstance>, CoreError>;

    /// Live tokens of a process instance
    async fn tokens(&self, process_instance_id: ProcessInstanceId) -> Result<Vec<Token>, CoreError>;

    /// Re-dispatch interrupted work after a restart and re-arm boundary
    /// timers whose schedule was lost; returns how many flow nodes were
    /// dispatched or re-armed
    async fn recover(&self) -> Result<usize, CoreError>;

    /// Stop executing work and firing timers
    async fn shutdown(&self) -> Result<(), CoreError>;
}

/// Engine runtime for one tenant.
///
/// Owns the dispatch loop (flow node dispatches become units of work) and
/// the job loop (fired triggers become dispatches).
pub struct ProcessRuntime {
    context: TenantContext,
    executor: Arc<FlowNodeExecutor>,
    containers: ContainerRegistry,
    tokens: Arc<dyn TokenService>,
    work: Arc<WorkService>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessRuntime {
    /// Wire the engine for `context` and start its loops and the scheduler.
    ///
    /// `fired_jobs` is the receiving end the scheduler executor hands fired
    /// triggers to.
    pub async fn start(
        context: TenantContext,
        fired_jobs: mpsc::Receiver<FiredJob>,
    ) -> Result<Arc<Self>, CoreError> {
        context.config.validate()?;

        let tokens: Arc<dyn TokenService> = Arc::new(TokenLedger::new());
        let activities: Arc<dyn ActivityInstanceService> =
            Arc::new(RecorderActivityInstanceService::new());
        let registry = Arc::new(StateRegistry::new(tokens.clone(), activities));
        let (containers, dispatches) =
            ContainerRegistry::new(context.config.dispatch_channel_capacity);
        let executor = Arc::new(FlowNodeExecutor::new(
            context.transactions.clone(),
            context.definitions.clone(),
            tokens.clone(),
            registry,
            containers.clone(),
            context.scheduler.clone(),
            context.incidents.clone(),
            context.tenant_id,
        ));
        let work = Arc::new(WorkService::new(context.config.clone()));

        let dispatch_loop = tokio::spawn(run_dispatch_loop(
            dispatches,
            executor.clone(),
            work.clone(),
            context.clone(),
        ));
        let job_loop = tokio::spawn(run_job_loop(
            fired_jobs,
            executor.clone(),
            work.clone(),
            context.clone(),
        ));

        context.scheduler.start().await?;
        info!(tenant_id = %context.tenant_id, "Process runtime started");

        Ok(Arc::new(Self {
            context,
            executor,
            containers,
            tokens,
            work,
            loops: Mutex::new(vec![dispatch_loop, job_loop]),
        }))
    }

    /// Number of units of work not finished yet
    pub fn pending_work(&self) -> usize {
        self.work.in_flight()
    }

    /// Run `op` again while it fails with a retryable error
    async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt < self.context.config.max_work_retries => {
                    attempt += 1;
                    debug!(attempt, error = %e, "Retrying API call");
                    tokio::time::sleep(self.context.config.retry_delay(attempt)).await;
                }
                outcome => return outcome,
            }
        }
    }

    async fn try_start_process(
        &self,
        definition: &ProcessDefinition,
    ) -> Result<ProcessInstanceId, CoreError> {
        let mut ctx = self.executor.begin().await?;
        let process_instance_id = ProcessInstanceId(ctx.tx().next_id());
        let mut process_instance = ProcessInstance::new(process_instance_id, definition.id);
        process_instance.start()?;

        let started = async {
            ctx.tx()
                .record_insert(
                    Record::ProcessInstance(process_instance),
                    RecordEvent::new(event_types::PROCESSINSTANCE_CREATED)
                        .for_process_instance(process_instance_id),
                )
                .await?;
            self.executor
                .evaluator()
                .start(&mut ctx, definition, process_instance_id, process_instance_id)
                .await
        }
        .await;

        match started {
            Ok(_) => {
                self.executor.commit(ctx).await?;
                Ok(process_instance_id)
            }
            Err(e) => {
                ctx.rollback().await;
                Err(e)
            }
        }
    }

    async fn try_cancel(&self, process_instance_id: ProcessInstanceId) -> Result<(), CoreError> {
        let mut ctx = self.executor.begin().await?;
        let Some(mut process_instance) = ctx.tx().process_instance(process_instance_id).await? else {
            ctx.rollback().await;
            return Err(CoreError::ProcessInstanceNotFound(process_instance_id.to_string()));
        };

        let requested = match process_instance.request_cancellation() {
            Ok(requested) => requested,
            Err(e) => {
                ctx.rollback().await;
                return Err(e);
            }
        };
        if !requested {
            ctx.rollback().await;
            debug!(process_instance_id = %process_instance_id, "Cancellation already requested");
            return Ok(());
        }

        let cancelled = async {
            ctx.tx()
                .record_update(
                    Record::ProcessInstance(process_instance),
                    RecordEvent::new(event_types::PROCESSINSTANCE_UPDATED)
                        .for_process_instance(process_instance_id),
                )
                .await?;
            let nodes = ctx.tx().flow_node_instances_of(process_instance_id).await?;
            let mut count = 0;
            for mut node in nodes {
                if node.terminal || node.state_category != StateCategory::Normal {
                    continue;
                }
                node.set_state_category(StateCategory::Cancelling)?;
                ctx.tx()
                    .record_update(
                        Record::FlowNode(node.clone()),
                        RecordEvent::new(event_types::FLOWNODE_STATE_CATEGORY_UPDATED)
                            .for_process_instance(process_instance_id),
                    )
                    .await?;
                ctx.dispatch(&node);
                count += 1;
            }
            Ok::<_, CoreError>(count)
        }
        .await;

        match cancelled {
            Ok(count) => {
                self.executor.commit(ctx).await?;
                info!(process_instance_id = %process_instance_id, flow_nodes = count, "Process instance cancelling");
                Ok(())
            }
            Err(e) => {
                ctx.rollback().await;
                Err(e)
            }
        }
    }

    /// Delete every record of a process instance; returns the timer jobs to drop
    async fn try_delete(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<String>, CoreError> {
        let mut ctx = self.executor.begin().await?;
        let deleted = async {
            let event = || RecordEvent::new(event_types::PROCESSINSTANCE_DELETED)
                .for_process_instance(process_instance_id);
            let archive_event = || RecordEvent::new(event_types::ARCHIVE_DELETED)
                .for_process_instance(process_instance_id);

            let live = ctx.tx().process_instance(process_instance_id).await?.is_some();
            let archived = ctx
                .tx()
                .archived_process_instance(process_instance_id)
                .await?
                .is_some();
            if !live && !archived {
                return Err(CoreError::ProcessInstanceNotFound(process_instance_id.to_string()));
            }

            let mut timers = Vec::new();
            for node in ctx.tx().flow_node_instances_of(process_instance_id).await? {
                if let Some(job_name) = node.timer_job_name {
                    timers.push(job_name);
                }
                ctx.tx()
                    .record_delete(
                        RecordKey::FlowNode(node.id),
                        RecordEvent::new(event_types::FLOWNODE_DELETED)
                            .for_process_instance(process_instance_id),
                    )
                    .await?;
            }
            for archived_node in ctx
                .tx()
                .archived_flow_node_instances_of(process_instance_id)
                .await?
            {
                if let Some(job_name) = archived_node.instance.timer_job_name {
                    timers.push(job_name);
                }
                ctx.tx()
                    .record_delete(
                        RecordKey::ArchivedFlowNode(archived_node.instance.id),
                        archive_event(),
                    )
                    .await?;
            }
            let tokens = self.tokens.delete_tokens(ctx.tx(), process_instance_id).await?;

            if live {
                ctx.tx()
                    .record_delete(RecordKey::ProcessInstance(process_instance_id), event())
                    .await?;
            }
            if archived {
                ctx.tx()
                    .record_delete(
                        RecordKey::ArchivedProcessInstance(process_instance_id),
                        archive_event(),
                    )
                    .await?;
            }
            debug!(process_instance_id = %process_instance_id, tokens, "Process instance records deleted");
            Ok(timers)
        }
        .await;

        match deleted {
            Ok(timers) => {
                self.executor.commit(ctx).await?;
                Ok(timers)
            }
            Err(e) => {
                ctx.rollback().await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ProcessApi for ProcessRuntime {
    fn tenant_id(&self) -> TenantId {
        self.context.tenant_id
    }

    async fn deploy(&self, definition: ProcessDefinition) -> Result<(), CoreError> {
        definition.validate()?;
        self.context.definitions.save(&definition).await?;
        info!(
            process_definition_id = %definition.id,
            name = %definition.name,
            version = %definition.version,
            "Process definition deployed"
        );
        Ok(())
    }

    async fn start_process(
        &self,
        process_definition_id: ProcessDefinitionId,
    ) -> Result<ProcessInstanceId, CoreError> {
        let definition = &self.executor.definition(process_definition_id).await?;
        let process_instance_id = self
            .with_retries(move || self.try_start_process(definition))
            .await?;
        info!(
            process_instance_id = %process_instance_id,
            process_definition_id = %process_definition_id,
            "Process instance started"
        );
        Ok(process_instance_id)
    }

    async fn execute_user_task(
        &self,
        flow_node_instance_id: FlowNodeInstanceId,
        executer_id: u64,
    ) -> Result<(), CoreError> {
        let mut ctx = self.executor.begin().await?;
        let task = ctx.tx().flow_node_instance(flow_node_instance_id).await;
        ctx.rollback().await;
        let task = task?
            .ok_or_else(|| CoreError::FlowNodeInstanceNotFound(flow_node_instance_id.to_string()))?;

        if task.node_type != FlowNodeType::UserTask
            || task.state_id != StateId::READY
            || task.state_category != StateCategory::Normal
        {
            return Err(CoreError::IllegalState(format!(
                "Flow node {} ({:?}) is in state {} and cannot be executed",
                task.id, task.node_type, task.state_name
            )));
        }

        self.containers
            .execute_flow_node(
                task.process_definition_id(),
                task.parent_process_instance_id(),
                task.id,
                executer_id,
                0,
            )
            .await
    }

    async fn cancel_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<(), CoreError> {
        self.with_retries(move || self.try_cancel(process_instance_id)).await
    }

    async fn delete_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<(), CoreError> {
        let timers = self
            .with_retries(move || self.try_delete(process_instance_id))
            .await?;
        for job_name in timers {
            if let Err(e) = self.context.scheduler.delete_job(&job_name).await {
                warn!(job_name = %job_name, error = %e, "Unable to delete timer job");
            }
        }
        info!(process_instance_id = %process_instance_id, "Process instance deleted");
        Ok(())
    }

    async fn get_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Option<ProcessInstance>, CoreError> {
        let mut ctx = self.executor.begin().await?;
        let instance = ctx.tx().process_instance(process_instance_id).await;
        ctx.rollback().await;
        Ok(instance?)
    }

    async fn get_archived_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Option<ArchivedProcessInstance>, CoreError> {
        let mut ctx = self.executor.begin().await?;
        let archived = ctx.tx().archived_process_instance(process_instance_id).await;
        ctx.rollback().await;
        Ok(archived?)
    }

    async fn flow_node_instances(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<FlowNodeInstance>, CoreError> {
        let mut ctx = self.executor.begin().await?;
        let nodes = ctx.tx().flow_node_instances_of(process_instance_id).await;
        ctx.rollback().await;
        Ok(nodes?)
    }

    async fn archived_flow_node_instances(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<ArchivedFlowNodeInstance>, CoreError> {
        let mut ctx = self.executor.begin().await?;
        let nodes = ctx
            .tx()
            .archived_flow_node_instances_of(process_instance_id)
            .await;
        ctx.rollback().await;
        Ok(nodes?)
    }

    async fn tokens(&self, process_instance_id: ProcessInstanceId) -> Result<Vec<Token>, CoreError> {
        let mut ctx = self.executor.begin().await?;
        let tokens = self.tokens.tokens_of(ctx.tx(), process_instance_id).await;
        ctx.rollback().await;
        tokens
    }

    async fn recover(&self) -> Result<usize, CoreError> {
        let mut ctx = self.executor.begin().await?;
        let nodes = ctx.tx().all_flow_node_instances().await;
        ctx.rollback().await;
        let nodes = nodes?;

        let mut dispatched = 0;
        let mut waiting = Vec::new();
        for node in nodes {
            if node.terminal {
                continue;
            }
            if node.stable && node.state_category == StateCategory::Normal {
                if node.state_id == StateId::WAITING && node.timer_job_name.is_some() {
                    waiting.push(node.id);
                }
                continue;
            }
            self.containers
                .dispatch(FlowNodeDispatch::for_instance(&node))
                .await?;
            dispatched += 1;
        }

        let rescheduled = self.context.scheduler.reschedule_erroneous_triggers().await?;
        let mut rearmed = 0;
        for id in waiting {
            if self.executor.rearm_timer(id).await? {
                rearmed += 1;
            }
        }
        info!(
            flow_nodes = dispatched,
            triggers = rescheduled,
            timers = rearmed,
            "Recovery finished"
        );
        Ok(dispatched + rearmed)
    }

    async fn shutdown(&self) -> Result<(), CoreError> {
        self.work.stop();
        let scheduler = self.context.scheduler.shutdown().await;
        for handle in self.loops.lock().drain(..) {
            handle.abort();
        }
        scheduler?;
        info!(tenant_id = %self.context.tenant_id, "Process runtime stopped");
        Ok(())
    }
}

/// Wrap a flow node work with its diagnostic context
fn with_context(
    work: Box<dyn Work>,
    dispatch: FlowNodeDispatch,
    context: &TenantContext,
) -> Box<dyn Work> {
    let with_flow_node = FlowNodeContextWork::new(
        work,
        dispatch.flow_node_instance_id,
        context.transactions.clone(),
    );
    Box::new(ProcessInstanceContextWork::new(
        Box::new(with_flow_node),
        dispatch.container_id,
        context.transactions.clone(),
    ))
}

async fn run_dispatch_loop(
    mut dispatches: mpsc::Receiver<FlowNodeDispatch>,
    executor: Arc<FlowNodeExecutor>,
    work: Arc<WorkService>,
    context: TenantContext,
) {
    while let Some(dispatch) = dispatches.recv().await {
        let flow_node_work = ExecuteFlowNodeWork::new(
            executor.clone(),
            context.incidents.clone(),
            dispatch,
            context.tenant_id,
        );

        if let Err(e) = work.submit(with_context(Box::new(flow_node_work), dispatch, &context)) {
            warn!(
                flow_node_instance_id = %dispatch.flow_node_instance_id,
                error = %e,
                "Dropping dispatch"
            );
        }
    }
    debug!("Dispatch loop stopped");
}

/// Runs every fired job to completion before answering the scheduler, so a
/// trigger is only released once the job's transaction committed
async fn run_job_loop(
    mut fired_jobs: mpsc::Receiver<FiredJob>,
    executor: Arc<FlowNodeExecutor>,
    work: Arc<WorkService>,
    context: TenantContext,
) {
    while let Some(fired) = fired_jobs.recv().await {
        let executor = executor.clone();
        let work = work.clone();
        let context = context.clone();
        tokio::spawn(async move {
            let outcome = run_job(&executor, &work, &context, &fired.job_id).await;
            if let Err(e) = &outcome {
                error!(job_name = %fired.job_name, error = %e, "Fired job failed");
            }
            if fired.ack.send(outcome.map_err(|e| e.to_string())).is_err() {
                warn!(job_name = %fired.job_name, "Scheduler stopped waiting for job outcome");
            }
        });
    }
    debug!("Job loop stopped");
}

async fn run_job(
    executor: &Arc<FlowNodeExecutor>,
    work: &WorkService,
    context: &TenantContext,
    job_id: &JobId,
) -> Result<(), CoreError> {
    let job = context
        .scheduler
        .get_job(job_id)
        .await?
        .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
    match job.descriptor.kind {
        JobKind::TriggerBoundaryTimer => {
            let timer_job = TriggerBoundaryTimerJob::from_job(&job)?;
            let dispatch = timer_job.dispatch();
            let timer_work = TriggerBoundaryTimerWork::new(
                executor.clone(),
                context.incidents.clone(),
                timer_job,
                job.descriptor.job_name.clone(),
                context.tenant_id,
            );
            work.execute(with_context(Box::new(timer_work), dispatch, context))
                .await
                .map_err(|e| e.cause)
        }
    }
}

/// Caller identity attached to API calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSession {
    /// Session identifier
    pub id: Uuid,
    /// Tenant the session was opened on
    pub tenant_id: TenantId,
    /// Logged-in user
    pub user_name: String,
    /// Session creation
    pub created_at: DateTime<Utc>,
}

impl ApiSession {
    /// Open a session for `user_name` on `tenant_id`
    pub fn new(tenant_id: TenantId, user_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            user_name: user_name.into(),
            created_at: Utc::now(),
        }
    }
}

/// [`ProcessApi`] bound to one session: every call runs inside a span
/// carrying the tenant and session, and a session of another tenant is
/// refused up front.
pub struct TenantScopedProcessApi {
    inner: Arc<dyn ProcessApi>,
    session: ApiSession,
}

impl TenantScopedProcessApi {
    /// Bind `inner` to `session`
    pub fn new(inner: Arc<dyn ProcessApi>, session: ApiSession) -> Result<Self, CoreError> {
        if session.tenant_id != inner.tenant_id() {
            return Err(CoreError::IllegalState(format!(
                "Session {} belongs to tenant {}, not tenant {}",
                session.id,
                session.tenant_id,
                inner.tenant_id()
            )));
        }
        Ok(Self { inner, session })
    }

    /// The bound session
    pub fn session(&self) -> &ApiSession {
        &self.session
    }

    fn span(&self, method: &'static str) -> Span {
        info_span!(
            "process_api",
            method,
            tenant_id = %self.session.tenant_id,
            session_id = %self.session.id,
            user = %self.session.user_name
        )
    }
}

#[async_trait]
impl ProcessApi for TenantScopedProcessApi {
    fn tenant_id(&self) -> TenantId {
        self.session.tenant_id
    }

    async fn deploy(&self, definition: ProcessDefinition) -> Result<(), CoreError> {
        self.inner.deploy(definition).instrument(self.span("deploy")).await
    }

    async fn start_process(
        &self,
        process_definition_id: ProcessDefinitionId,
    ) -> Result<ProcessInstanceId, CoreError> {
        self.inner
            .start_process(process_definition_id)
            .instrument(self.span("start_process"))
            .await
    }

    async fn execute_user_task(
        &self,
        flow_node_instance_id: FlowNodeInstanceId,
        executer_id: u64,
    ) -> Result<(), CoreError> {
        self.inner
            .execute_user_task(flow_node_instance_id, executer_id)
            .instrument(self.span("execute_user_task"))
            .await
    }

    async fn cancel_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<(), CoreError> {
        self.inner
            .cancel_process_instance(process_instance_id)
            .instrument(self.span("cancel_process_instance"))
            .await
    }

    async fn delete_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<(), CoreError> {
        self.inner
            .delete_process_instance(process_instance_id)
            .instrument(self.span("delete_process_instance"))
            .await
    }

    async fn get_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Option<ProcessInstance>, CoreError> {
        self.inner
            .get_process_instance(process_instance_id)
            .instrument(self.span("get_process_instance"))
            .await
    }

    async fn get_archived_process_instance(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Option<ArchivedProcessInstance>, CoreError> {
        self.inner
            .get_archived_process_instance(process_instance_id)
            .instrument(self.span("get_archived_process_instance"))
            .await
    }

    async fn flow_node_instances(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<FlowNodeInstance>, CoreError> {
        self.inner
            .flow_node_instances(process_instance_id)
            .instrument(self.span("flow_node_instances"))
            .await
    }

    async fn archived_flow_node_instances(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<ArchivedFlowNodeInstance>, CoreError> {
        self.inner
            .archived_flow_node_instances(process_instance_id)
            .instrument(self.span("archived_flow_node_instances"))
            .await
    }

    async fn tokens(&self, process_instance_id: ProcessInstanceId) -> Result<Vec<Token>, CoreError> {
        self.inner
            .tokens(process_instance_id)
            .instrument(self.span("tokens"))
            .await
    }

    async fn recover(&self) -> Result<usize, CoreError> {
        self.inner.recover().instrument(self.span("recover")).await
    }

    async fn shutdown(&self) -> Result<(), CoreError> {
        self.inner.shutdown().instrument(self.span("shutdown")).await
    }
}
