//! Timer/job scheduler façade
//!
//! [`SchedulerService`] persists job descriptors through a [`JobService`]
//! and hands triggers to a [`SchedulerExecutor`], the primitive that actually
//! fires them. Fired triggers come back to the engine as [`FiredJob`]s.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::SchedulerError;

pub mod jobs;
pub mod model;

pub use jobs::TriggerBoundaryTimerJob;
pub use model::{
    FiredJob, JobDescriptor, JobId, JobKind, JobParameter, MisfirePolicy, ScheduledJob, Trigger,
};

/// Underlying timer-firing primitive
#[async_trait]
pub trait SchedulerExecutor: Send + Sync {
    /// Start firing triggers; resumes persisted ones
    async fn start(&self) -> Result<(), SchedulerError>;

    /// Stop firing triggers; persisted ones survive
    async fn shutdown(&self) -> Result<(), SchedulerError>;

    /// Whether the executor runs
    fn is_started(&self) -> bool;

    /// Whether the executor was shut down
    fn is_shutdown(&self) -> bool;

    /// Register a trigger for a job
    async fn schedule(
        &self,
        job_id: JobId,
        job_name: String,
        trigger: Trigger,
    ) -> Result<(), SchedulerError>;

    /// Drop the trigger of a job; returns whether one existed
    async fn unschedule(&self, job_name: &str) -> Result<bool, SchedulerError>;

    /// Whether a trigger exists for the job, in any state
    async fn is_scheduled(&self, job_name: &str) -> Result<bool, SchedulerError>;

    /// Re-submit triggers marked erroneous; returns how many
    async fn reschedule_erroneous_triggers(&self) -> Result<usize, SchedulerError>;
}

/// Persistence of job descriptors and parameters
#[async_trait]
pub trait JobService: Send + Sync {
    /// Persist a job
    async fn create_job_descriptor(
        &self,
        descriptor: JobDescriptor,
        parameters: Vec<JobParameter>,
    ) -> Result<ScheduledJob, SchedulerError>;

    /// Find a job by ID
    async fn get_job(&self, job_id: &JobId) -> Result<Option<ScheduledJob>, SchedulerError>;

    /// Find a job by name
    async fn find_job_by_name(&self, job_name: &str)
        -> Result<Option<ScheduledJob>, SchedulerError>;

    /// Delete a job; returns whether it existed
    async fn delete_job(&self, job_name: &str) -> Result<bool, SchedulerError>;
}

/// Scheduler façade used by the engine
#[derive(Clone)]
pub struct SchedulerService {
    executor: Arc<dyn SchedulerExecutor>,
    jobs: Arc<dyn JobService>,
}

impl SchedulerService {
    /// Create the façade
    pub fn new(executor: Arc<dyn SchedulerExecutor>, jobs: Arc<dyn JobService>) -> Self {
        Self { executor, jobs }
    }

    /// Start the executor
    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.executor.start().await?;
        info!("Scheduler started");
        Ok(())
    }

    /// Stop the executor
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.executor.shutdown().await?;
        info!("Scheduler stopped");
        Ok(())
    }

    /// Whether the executor runs
    pub fn is_started(&self) -> bool {
        self.executor.is_started()
    }

    /// Whether the executor was shut down
    pub fn is_stopped(&self) -> bool {
        self.executor.is_shutdown()
    }

    /// Persist a job and register its trigger
    pub async fn schedule(
        &self,
        descriptor: JobDescriptor,
        parameters: Vec<JobParameter>,
        trigger: Option<Trigger>,
    ) -> Result<JobId, SchedulerError> {
        let trigger = trigger.ok_or_else(|| SchedulerError::NullTrigger(descriptor.job_name.clone()))?;

        let job = self
            .jobs
            .create_job_descriptor(descriptor, parameters)
            .await
            .map_err(|e| match e {
                SchedulerError::JobDescriptorCreation(_) => e,
                other => SchedulerError::JobDescriptorCreation(other.to_string()),
            })?;

        debug!(job_name = %job.descriptor.job_name, start_at = %trigger.start_at, "Scheduling job");
        self.executor
            .schedule(job.id.clone(), job.descriptor.job_name.clone(), trigger)
            .await?;
        Ok(job.id)
    }

    /// Drop a job and its trigger; returns whether the job existed
    pub async fn delete_job(&self, job_name: &str) -> Result<bool, SchedulerError> {
        self.executor.unschedule(job_name).await?;
        self.jobs.delete_job(job_name).await
    }

    /// Whether a job with this name is persisted
    pub async fn is_existing_job(&self, job_name: &str) -> Result<bool, SchedulerError> {
        Ok(self.jobs.find_job_by_name(job_name).await?.is_some())
    }

    /// Whether the job is persisted and its trigger is still held by the executor
    pub async fn is_armed(&self, job_name: &str) -> Result<bool, SchedulerError> {
        Ok(self.is_existing_job(job_name).await? && self.executor.is_scheduled(job_name).await?)
    }

    /// Look up a persisted job
    pub async fn get_job(&self, job_id: &JobId) -> Result<Option<ScheduledJob>, SchedulerError> {
        self.jobs.get_job(job_id).await
    }

    /// Re-submit triggers that failed to fire
    pub async fn reschedule_erroneous_triggers(&self) -> Result<usize, SchedulerError> {
        let count = self.executor.reschedule_erroneous_triggers().await?;
        if count > 0 {
            info!(count, "Rescheduled erroneous triggers");
        }
        Ok(count)
    }
}
