//! A process runtime over in-memory storage

use std::sync::Arc;

use tokenflow_core::{
    CoreError, EngineConfig, ProcessApi, ProcessRuntime, TransactionService,
};
use tokenflow_state_inmemory::InMemoryEngineProvider;

/// Settings with short retry delays
pub fn test_config() -> EngineConfig {
    EngineConfig {
        work_concurrency: 4,
        retry_backoff_ms: 1,
        max_retry_backoff_ms: 20,
        ..EngineConfig::default()
    }
}

/// A running engine plus the storage it runs on.
///
/// [`TestEngine::restart`] stops the runtime and starts a fresh one over
/// the same storage, like a node coming back after a crash.
pub struct TestEngine {
    provider: InMemoryEngineProvider,
    config: EngineConfig,
    transactions: Option<Arc<dyn TransactionService>>,
    runtime: Arc<ProcessRuntime>,
}

impl TestEngine {
    /// Start an engine on empty storage
    pub async fn start() -> Result<Self, CoreError> {
        Self::start_on(InMemoryEngineProvider::new(), test_config()).await
    }

    /// Start an engine on existing storage
    pub async fn start_on(
        provider: InMemoryEngineProvider,
        config: EngineConfig,
    ) -> Result<Self, CoreError> {
        let runtime = provider.start_runtime(config.clone()).await?;
        Ok(Self {
            provider,
            config,
            transactions: None,
            runtime,
        })
    }

    /// Start an engine whose transactions go through `transactions`
    pub async fn start_with_transactions(
        provider: InMemoryEngineProvider,
        config: EngineConfig,
        transactions: Arc<dyn TransactionService>,
    ) -> Result<Self, CoreError> {
        let (context, fired_jobs) = provider.tenant_context_with(config.clone(), transactions.clone());
        let runtime = ProcessRuntime::start(context, fired_jobs).await?;
        Ok(Self {
            provider,
            config,
            transactions: Some(transactions),
            runtime,
        })
    }

    /// Stop this runtime, start a new one on the same storage and recover
    pub async fn restart(self) -> Result<Self, CoreError> {
        self.runtime.shutdown().await?;
        let restarted = match self.transactions {
            Some(transactions) => {
                Self::start_with_transactions(self.provider, self.config, transactions).await?
            }
            None => Self::start_on(self.provider, self.config).await?,
        };
        restarted.runtime.recover().await?;
        Ok(restarted)
    }

    /// The engine API
    pub fn api(&self) -> &dyn ProcessApi {
        self.runtime.as_ref()
    }

    /// The runtime
    pub fn runtime(&self) -> &Arc<ProcessRuntime> {
        &self.runtime
    }

    /// Storage behind the engine
    pub fn provider(&self) -> &InMemoryEngineProvider {
        &self.provider
    }

    /// Stop the runtime
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        self.runtime.shutdown().await
    }
}
