use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::container_registry::ContainerRegistry;
use super::context::{ExecutionContext, FlowNodeDispatch, SideEffect};
use super::flow_nodes;
use super::transition::TransitionEvaluator;
use crate::application::token_ledger::TokenService;
use crate::domain::events::{event_types, RecordEvent};
use crate::domain::flow_node_instance::{FlowNodeInstance, StateCategory};
use crate::domain::process_definition::{FlowNodeType, ProcessDefinition};
use crate::domain::process_instance::{
    ArchivedProcessInstance, FlowNodeInstanceId, ProcessDefinitionId, ProcessInstanceId, TenantId,
};
use crate::domain::repository::{
    Incident, IncidentService, ProcessDefinitionRepository, Record, RecordKey, TransactionService,
};
use crate::scheduler::{SchedulerService, Trigger, TriggerBoundaryTimerJob};
use crate::state::{FlowNodeState, StateCode, StateId, StateRegistry};
use crate::{CoreError, SchedulerError, WorkError};

const MARK_FAILED_ATTEMPTS: u32 = 3;

/// Runs flow nodes through their states, one transaction per step
pub struct FlowNodeExecutor {
    transactions: Arc<dyn TransactionService>,
    definitions: Arc<dyn ProcessDefinitionRepository>,
    tokens: Arc<dyn TokenService>,
    registry: Arc<StateRegistry>,
    evaluator: TransitionEvaluator,
    containers: ContainerRegistry,
    scheduler: SchedulerService,
    incidents: Arc<dyn IncidentService>,
    tenant_id: TenantId,
}

impl FlowNodeExecutor {
    /// Create an executor
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transactions: Arc<dyn TransactionService>,
        definitions: Arc<dyn ProcessDefinitionRepository>,
        tokens: Arc<dyn TokenService>,
        registry: Arc<StateRegistry>,
        containers: ContainerRegistry,
        scheduler: SchedulerService,
        incidents: Arc<dyn IncidentService>,
        tenant_id: TenantId,
    ) -> Self {
        Self {
            transactions,
            definitions,
            evaluator: TransitionEvaluator::new(tokens.clone()),
            tokens,
            registry,
            containers,
            scheduler,
            incidents,
            tenant_id,
        }
    }

    /// Open a transaction wrapped in an execution context
    pub async fn begin(&self) -> Result<ExecutionContext, CoreError> {
        Ok(ExecutionContext::new(self.transactions.begin().await?))
    }

    /// The transition evaluator
    pub fn evaluator(&self) -> &TransitionEvaluator {
        &self.evaluator
    }

    /// Load a deployed definition
    pub async fn definition(&self, id: ProcessDefinitionId) -> Result<ProcessDefinition, CoreError> {
        self.definitions
            .find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::ProcessDefinitionNotFound(id.to_string()))
    }

    /// Advance a flow node until it reaches a stable or terminal state.
    ///
    /// A missing or terminal node is a no-op. A stable `Normal` node other
    /// than a failed one moves to its next state; a node whose category
    /// changed enters the matching unwinding state.
    pub async fn step_forward(&self, id: FlowNodeInstanceId) -> Result<(), CoreError> {
        let mut ctx = self.begin().await?;
        match self.advance(&mut ctx, id).await {
            Ok(()) => {
                let effects = ctx.commit().await?;
                self.release(effects).await;
                Ok(())
            }
            Err(e) => {
                ctx.rollback().await;
                Err(e)
            }
        }
    }

    /// Commit a context and release its side effects
    pub async fn commit(&self, ctx: ExecutionContext) -> Result<(), CoreError> {
        let effects = ctx.commit().await?;
        self.release(effects).await;
        Ok(())
    }

    async fn advance(
        &self,
        ctx: &mut ExecutionContext,
        id: FlowNodeInstanceId,
    ) -> Result<(), CoreError> {
        let mut instance = match ctx.tx().flow_node_instance(id).await? {
            Some(instance) if !instance.terminal => instance,
            _ => {
                debug!(flow_node_instance_id = %id, "Flow node already finished");
                return Ok(());
            }
        };
        let definition = self.definition(instance.process_definition_id()).await?;

        let current = self.registry.state(instance.state_id)?;
        if current.state_category() != instance.state_category {
            let entry = self.registry.next_state(&instance)?.clone();
            self.enter(&mut instance, entry.as_ref());
        } else if instance.stable && instance.state_category == StateCategory::Normal {
            if instance.state_id == StateId::FAILED {
                debug!(flow_node_instance_id = %id, "Failed flow node needs a manual retry");
                return Ok(());
            }
            let next = self.registry.next_state(&instance)?.clone();
            self.enter(&mut instance, next.as_ref());
        }

        loop {
            let state = self.registry.state(instance.state_id)?.clone();

            if state.should_execute_state(&definition, &instance) {
                let code = state.execute(ctx, &definition, &mut instance).await?;
                if code == StateCode::Executing {
                    flow_nodes::save_flow_node(ctx, &instance, event_types::FLOWNODE_STATE_UPDATED)
                        .await?;
                    return Ok(());
                }
            }

            if state.is_terminal() {
                return self.terminate(ctx, &definition, instance).await;
            }

            if state.is_stable() && state.state_category() == instance.state_category {
                flow_nodes::save_flow_node(ctx, &instance, event_types::FLOWNODE_STATE_UPDATED)
                    .await?;
                return Ok(());
            }

            let next = self.registry.next_state(&instance)?.clone();
            self.enter(&mut instance, next.as_ref());
        }
    }

    fn enter(&self, instance: &mut FlowNodeInstance, state: &dyn FlowNodeState) {
        debug!(
            flow_node_instance_id = %instance.id,
            from = %instance.state_name,
            to = state.name(),
            "Flow node state change"
        );
        instance.enter_state(state.id(), state.name(), state.is_stable(), state.is_terminal());
    }

    async fn terminate(
        &self,
        ctx: &mut ExecutionContext,
        definition: &ProcessDefinition,
        instance: FlowNodeInstance,
    ) -> Result<(), CoreError> {
        if instance.state_id == StateId::COMPLETED {
            self.evaluator
                .follow_outgoing(ctx, &self.registry, definition, &instance)
                .await?;
            // fired one-shot timer: drop its job descriptor
            if let Some(job_name) = &instance.timer_job_name {
                ctx.remove_timer(job_name.clone());
            }
        }
        flow_nodes::archive_flow_node(ctx, &instance).await?;
        info!(
            flow_node_instance_id = %instance.id,
            name = %instance.name,
            state = %instance.state_name,
            "Flow node finished"
        );
        self.complete_process_if_idle(ctx, instance.parent_process_instance_id())
            .await
    }

    /// Archive the process instance once no live flow node remains
    async fn complete_process_if_idle(
        &self,
        ctx: &mut ExecutionContext,
        process_instance_id: ProcessInstanceId,
    ) -> Result<(), CoreError> {
        if !ctx
            .tx()
            .flow_node_instances_of(process_instance_id)
            .await?
            .is_empty()
        {
            return Ok(());
        }
        let Some(mut process_instance) = ctx.tx().process_instance(process_instance_id).await? else {
            return Ok(());
        };

        let stray = self.tokens.tokens_of(ctx.tx(), process_instance_id).await?;
        if !stray.is_empty() {
            warn!(
                process_instance_id = %process_instance_id,
                count = stray.len(),
                "Purging tokens left behind by a finished process instance"
            );
            for token in stray {
                self.tokens
                    .consume_token(ctx.tx(), process_instance_id, token.ref_id)
                    .await?;
            }
        }

        process_instance.finish();
        ctx.tx()
            .record_delete(
                RecordKey::ProcessInstance(process_instance_id),
                RecordEvent::new(event_types::PROCESSINSTANCE_DELETED)
                    .for_process_instance(process_instance_id),
            )
            .await?;
        let state = process_instance.state;
        ctx.tx()
            .record_insert(
                Record::ArchivedProcessInstance(ArchivedProcessInstance::from(process_instance)),
                RecordEvent::new(event_types::ARCHIVED).for_process_instance(process_instance_id),
            )
            .await?;
        info!(process_instance_id = %process_instance_id, state = ?state, "Process instance finished");
        Ok(())
    }

    /// Move a node whose work failed for good into `failed`
    pub async fn mark_failed(&self, id: FlowNodeInstanceId) -> Result<(), CoreError> {
        let mut ctx = self.begin().await?;
        let Some(mut instance) = ctx.tx().flow_node_instance(id).await? else {
            ctx.rollback().await;
            return Ok(());
        };
        if instance.terminal {
            ctx.rollback().await;
            return Ok(());
        }
        let failed = self.registry.state(StateId::FAILED)?.clone();
        self.enter(&mut instance, failed.as_ref());
        flow_nodes::save_flow_node(&mut ctx, &instance, event_types::FLOWNODE_STATE_UPDATED).await?;
        self.commit(ctx).await?;
        warn!(flow_node_instance_id = %id, name = %instance.name, "Flow node failed");
        Ok(())
    }

    /// Release side effects of a committed transaction
    pub async fn release(&self, effects: Vec<SideEffect>) {
        for effect in effects {
            match effect {
                SideEffect::Dispatch(dispatch) => {
                    if let Err(e) = self.containers.dispatch(dispatch).await {
                        warn!(
                            flow_node_instance_id = %dispatch.flow_node_instance_id,
                            error = %e,
                            "Unable to dispatch flow node"
                        );
                    }
                }
                SideEffect::ScheduleTimer {
                    job_name,
                    dispatch,
                    delay,
                } => {
                    if let Err(e) = self.schedule_timer(&job_name, dispatch, delay).await {
                        self.timer_not_armed(dispatch, &job_name, e).await;
                    }
                }
                SideEffect::RemoveTimer { job_name } => {
                    if let Err(e) = self.scheduler.delete_job(&job_name).await {
                        warn!(job_name = %job_name, error = %e, "Unable to remove boundary timer");
                    }
                }
            }
        }
    }

    async fn schedule_timer(
        &self,
        job_name: &str,
        dispatch: FlowNodeDispatch,
        delay: Duration,
    ) -> Result<(), SchedulerError> {
        let job = TriggerBoundaryTimerJob::new(dispatch);
        let trigger = Trigger::one_shot(job_name, delay);
        self.scheduler
            .schedule(job.descriptor(job_name), job.parameters(), Some(trigger))
            .await?;
        Ok(())
    }

    /// A boundary event whose timer cannot be armed is failed and reported
    async fn timer_not_armed(&self, dispatch: FlowNodeDispatch, job_name: &str, cause: SchedulerError) {
        let id = dispatch.flow_node_instance_id;
        if matches!(cause, SchedulerError::NotStarted) {
            warn!(flow_node_instance_id = %id, job_name, "Scheduler stopped, timer left for recovery");
            return;
        }
        // armed meanwhile by a concurrent recovery
        if let Ok(true) = self.scheduler.is_armed(job_name).await {
            debug!(flow_node_instance_id = %id, job_name, "Boundary timer already armed");
            return;
        }
        error!(flow_node_instance_id = %id, job_name, error = %cause, "Unable to schedule boundary timer");

        let mut error = WorkError::new(cause);
        error.add_context("PROCESS_INSTANCE_ID", dispatch.container_id);
        error.add_context("FLOW_NODE_INSTANCE_ID", id);
        error.add_context("JOB_NAME", job_name);
        let mut attempts = 0;
        while let Err(e) = Box::pin(self.mark_failed(id)).await {
            attempts += 1;
            if !e.is_retryable() || attempts >= MARK_FAILED_ATTEMPTS {
                error.add_context("MARK_FAILED_ERROR", e);
                break;
            }
        }
        self.incidents
            .report(Incident {
                tenant_id: self.tenant_id,
                description: format!("Schedule timer {} of boundary event {}", job_name, id),
                cause: error.to_string(),
                recovery_procedure: format!(
                    "Retry flow node {} of process instance {}",
                    id, dispatch.container_id
                ),
            })
            .await;
    }

    /// Arm again the timer of a waiting boundary event whose job or trigger
    /// is gone; returns whether it had to.
    ///
    /// The timer keeps its original deadline, counted from the moment the
    /// boundary event started waiting.
    pub async fn rearm_timer(&self, id: FlowNodeInstanceId) -> Result<bool, CoreError> {
        let waiting = |instance: &FlowNodeInstance| {
            instance.node_type == FlowNodeType::BoundaryEvent
                && instance.state_id == StateId::WAITING
                && instance.state_category == StateCategory::Normal
        };

        let mut ctx = self.begin().await?;
        let instance = ctx.tx().flow_node_instance(id).await;
        ctx.rollback().await;
        let Some(instance) = instance?.filter(|instance| waiting(instance)) else {
            return Ok(false);
        };
        let Some(job_name) = instance.timer_job_name.clone() else {
            return Ok(false);
        };
        if self.scheduler.is_armed(&job_name).await? {
            return Ok(false);
        }

        // a trigger that fired in between has already moved the node on
        let mut ctx = self.begin().await?;
        let current = ctx.tx().flow_node_instance(id).await;
        ctx.rollback().await;
        let Some(instance) = current?.filter(|instance| waiting(instance)) else {
            return Ok(false);
        };

        let definition = self.definition(instance.process_definition_id()).await?;
        let timer = definition
            .flow_node(&instance.name)
            .and_then(|node| node.timer())
            .ok_or_else(|| {
                CoreError::IllegalState(format!("Boundary event {} has no timer", instance.name))
            })?;
        let due = instance.reached_state_at
            + chrono::Duration::from_std(timer).unwrap_or_else(|_| chrono::Duration::zero());
        let delay = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        // leftover half of the lost schedule
        self.scheduler.delete_job(&job_name).await?;
        warn!(flow_node_instance_id = %id, job_name = %job_name, delay_ms = delay.as_millis() as u64, "Re-arming lost boundary timer");
        let dispatch = FlowNodeDispatch::for_instance(&instance);
        if let Err(e) = self.schedule_timer(&job_name, dispatch, delay).await {
            self.timer_not_armed(dispatch, &job_name, e).await;
        }
        Ok(true)
    }
}
