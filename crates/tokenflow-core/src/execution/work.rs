//! Units of work and the service that runs them

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use super::context::FlowNodeDispatch;
use super::executor::FlowNodeExecutor;
use crate::domain::process_instance::TenantId;
use crate::domain::repository::{Incident, IncidentService};
use crate::scheduler::TriggerBoundaryTimerJob;
use crate::{CoreError, EngineConfig, WorkError};

/// One asynchronous, retryable piece of engine work
#[async_trait]
pub trait Work: Send + Sync + fmt::Display {
    /// Human-readable description
    fn description(&self) -> String;

    /// How an operator can replay the work after a failure
    fn recovery_procedure(&self) -> String;

    /// Tenant the work runs for
    fn tenant_id(&self) -> TenantId;

    /// Run the work
    async fn work(&self) -> Result<(), WorkError>;

    /// Called once the work failed for good
    async fn handle_failure(&self, error: &mut WorkError);
}

/// Executes one flow node step
pub struct ExecuteFlowNodeWork {
    executor: Arc<FlowNodeExecutor>,
    incidents: Arc<dyn IncidentService>,
    dispatch: FlowNodeDispatch,
    tenant_id: TenantId,
}

impl ExecuteFlowNodeWork {
    /// Create the work
    pub fn new(
        executor: Arc<FlowNodeExecutor>,
        incidents: Arc<dyn IncidentService>,
        dispatch: FlowNodeDispatch,
        tenant_id: TenantId,
    ) -> Self {
        Self {
            executor,
            incidents,
            dispatch,
            tenant_id,
        }
    }
}

impl fmt::Display for ExecuteFlowNodeWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ExecuteFlowNodeWork(flowNodeInstanceId={}, containerId={})",
            self.dispatch.flow_node_instance_id, self.dispatch.container_id
        )
    }
}

#[async_trait]
impl Work for ExecuteFlowNodeWork {
    fn description(&self) -> String {
        format!("Execute flow node {}", self.dispatch.flow_node_instance_id)
    }

    fn recovery_procedure(&self) -> String {
        format!(
            "Retry flow node {} of process instance {}",
            self.dispatch.flow_node_instance_id, self.dispatch.container_id
        )
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    async fn work(&self) -> Result<(), WorkError> {
        self.executor
            .step_forward(self.dispatch.flow_node_instance_id)
            .await
            .map_err(WorkError::new)
    }

    async fn handle_failure(&self, error: &mut WorkError) {
        if let Err(e) = self
            .executor
            .mark_failed(self.dispatch.flow_node_instance_id)
            .await
        {
            error.add_context("MARK_FAILED_ERROR", e);
        }
        self.incidents
            .report(Incident {
                tenant_id: self.tenant_id,
                description: self.description(),
                cause: error.to_string(),
                recovery_procedure: self.recovery_procedure(),
            })
            .await;
    }
}

/// Runs a fired boundary timer job.
///
/// The scheduler is only answered once this work returns, so the trigger
/// outlives any failure or crash before the boundary event's step commits.
/// A final failure leaves the trigger erroneous instead of failing the node.
pub struct TriggerBoundaryTimerWork {
    executor: Arc<FlowNodeExecutor>,
    incidents: Arc<dyn IncidentService>,
    job: TriggerBoundaryTimerJob,
    job_name: String,
    tenant_id: TenantId,
}

impl TriggerBoundaryTimerWork {
    /// Create the work
    pub fn new(
        executor: Arc<FlowNodeExecutor>,
        incidents: Arc<dyn IncidentService>,
        job: TriggerBoundaryTimerJob,
        job_name: impl Into<String>,
        tenant_id: TenantId,
    ) -> Self {
        Self {
            executor,
            incidents,
            job,
            job_name: job_name.into(),
            tenant_id,
        }
    }
}

impl fmt::Display for TriggerBoundaryTimerWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TriggerBoundaryTimerWork(jobName={}, flowNodeInstanceId={})",
            self.job_name,
            self.job.dispatch().flow_node_instance_id
        )
    }
}

#[async_trait]
impl Work for TriggerBoundaryTimerWork {
    fn description(&self) -> String {
        format!(
            "Trigger timer {} of boundary event {}",
            self.job_name,
            self.job.dispatch().flow_node_instance_id
        )
    }

    fn recovery_procedure(&self) -> String {
        format!("Reschedule erroneous triggers of tenant {}", self.tenant_id)
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    async fn work(&self) -> Result<(), WorkError> {
        self.job.execute(&self.executor).await.map_err(WorkError::new)
    }

    async fn handle_failure(&self, error: &mut WorkError) {
        error.add_context("JOB_NAME", &self.job_name);
        self.incidents
            .report(Incident {
                tenant_id: self.tenant_id,
                description: self.description(),
                cause: error.to_string(),
                recovery_procedure: self.recovery_procedure(),
            })
            .await;
    }
}

/// Runs units of work on the tokio runtime with bounded concurrency.
///
/// Failures with a retryable cause are retried with exponential backoff;
/// any other failure, or running out of attempts, calls `handle_failure`.
pub struct WorkService {
    semaphore: Arc<Semaphore>,
    config: EngineConfig,
    in_flight: Arc<AtomicUsize>,
}

impl WorkService {
    /// Create a work service
    pub fn new(config: EngineConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.work_concurrency)),
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue a unit of work
    pub fn submit(&self, work: Box<dyn Work>) -> Result<(), CoreError> {
        if self.semaphore.is_closed() {
            return Err(CoreError::IllegalState("Work service is stopped".to_string()));
        }

        let semaphore = self.semaphore.clone();
        let in_flight = self.in_flight.clone();
        let config = self.config.clone();
        in_flight.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            if let Ok(_permit) = semaphore.acquire_owned().await {
                let _ = run(work.as_ref(), &config).await;
            } else {
                debug!(work = %work, "Work service stopped before work ran");
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    /// Run a unit of work, including its retries, and wait for the outcome.
    ///
    /// `handle_failure` has already been called when an error comes back.
    pub async fn execute(&self, work: Box<dyn Work>) -> Result<(), WorkError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = match self.semaphore.acquire().await {
            Ok(_permit) => run(work.as_ref(), &self.config).await,
            Err(_) => Err(WorkError::new(CoreError::IllegalState(
                "Work service is stopped".to_string(),
            ))),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    /// Number of submitted works that have not finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Refuse new work; works waiting for a slot are dropped
    pub fn stop(&self) {
        self.semaphore.close();
    }

    /// Whether `stop` was called
    pub fn is_stopped(&self) -> bool {
        self.semaphore.is_closed()
    }
}

async fn run(work: &dyn Work, config: &EngineConfig) -> Result<(), WorkError> {
    let mut attempt = 0;
    loop {
        match work.work().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < config.max_work_retries => {
                attempt += 1;
                let delay = config.retry_delay(attempt);
                debug!(work = %work, attempt, error = %e, "Retrying work");
                tokio::time::sleep(delay).await;
            }
            Err(mut e) => {
                if e.is_retryable() {
                    warn!(work = %work, attempts = attempt + 1, "Giving up on work");
                }
                work.handle_failure(&mut e).await;
                error!(work = %work, error = %e, "Work failed");
                return Err(e);
            }
        }
    }
}
