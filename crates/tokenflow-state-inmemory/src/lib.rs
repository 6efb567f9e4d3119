//! In-memory collaborators for the Tokenflow engine
//!
//! This crate provides in-memory implementations of the traits the
//! tokenflow-core crate depends on: a versioned transactional record store,
//! job and trigger storage with a tokio-timer scheduler executor, a process
//! definition repository and an incident log. It is primarily useful for
//! development, testing, and single-process deployments.

use std::sync::Arc;
use tokio::sync::mpsc;

pub mod repositories;
pub use repositories::{
    InMemoryIncidentService, InMemoryJobService, InMemoryProcessDefinitionRepository,
};

pub mod scheduler;
pub use scheduler::{StoredTrigger, TokioSchedulerExecutor, TriggerState, TriggerStore};

pub mod store;
pub use store::{
    InMemoryStore, InMemoryTransaction, InMemoryTransactionService, DEFAULT_EVENT_CAPACITY,
};

use tokenflow_core::{
    CoreError, EngineConfig, FiredJob, ProcessRuntime, SchedulerService, TenantContext, TenantId,
    TransactionService,
};

/// Provider for in-memory engine collaborators.
///
/// Everything the provider holds plays the part of durable storage: a
/// runtime started from the same provider after another one was shut down
/// sees the records, jobs and triggers the first one left behind.
#[derive(Clone, Default)]
pub struct InMemoryEngineProvider {
    store: Arc<InMemoryStore>,
    definitions: Arc<InMemoryProcessDefinitionRepository>,
    jobs: Arc<InMemoryJobService>,
    triggers: Arc<TriggerStore>,
    incidents: Arc<InMemoryIncidentService>,
}

impl InMemoryEngineProvider {
    /// Create a provider with empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Record store
    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }

    /// Deployed definitions
    pub fn definitions(&self) -> &Arc<InMemoryProcessDefinitionRepository> {
        &self.definitions
    }

    /// Persisted jobs
    pub fn jobs(&self) -> &Arc<InMemoryJobService> {
        &self.jobs
    }

    /// Persisted triggers
    pub fn triggers(&self) -> &Arc<TriggerStore> {
        &self.triggers
    }

    /// Reported incidents
    pub fn incidents(&self) -> &Arc<InMemoryIncidentService> {
        &self.incidents
    }

    /// Transaction service over the record store
    pub fn transaction_service(&self) -> Arc<InMemoryTransactionService> {
        Arc::new(InMemoryTransactionService::new(self.store.clone()))
    }

    /// Tenant context over this provider's storage with a fresh scheduler
    /// executor, plus the receiver its fired jobs arrive on
    pub fn tenant_context(&self, config: EngineConfig) -> (TenantContext, mpsc::Receiver<FiredJob>) {
        self.tenant_context_with(config, self.transaction_service())
    }

    /// Like [`Self::tenant_context`] with a custom transaction service
    pub fn tenant_context_with(
        &self,
        config: EngineConfig,
        transactions: Arc<dyn TransactionService>,
    ) -> (TenantContext, mpsc::Receiver<FiredJob>) {
        let (executor, fired_jobs) = TokioSchedulerExecutor::with_channel(
            self.triggers.clone(),
            config.dispatch_channel_capacity,
        );
        let scheduler = SchedulerService::new(Arc::new(executor), self.jobs.clone());
        let context = TenantContext {
            tenant_id: TenantId(config.tenant_id),
            config,
            transactions,
            definitions: self.definitions.clone(),
            scheduler,
            incidents: self.incidents.clone(),
        };
        (context, fired_jobs)
    }

    /// Start a runtime over this provider's storage
    pub async fn start_runtime(&self, config: EngineConfig) -> Result<Arc<ProcessRuntime>, CoreError> {
        let (context, fired_jobs) = self.tenant_context(config);
        ProcessRuntime::start(context, fired_jobs).await
    }

    /// Start a runtime configured from `TOKENFLOW_*` environment variables
    pub async fn start_runtime_from_env(&self) -> Result<Arc<ProcessRuntime>, CoreError> {
        self.start_runtime(EngineConfig::load()?).await
    }
}

