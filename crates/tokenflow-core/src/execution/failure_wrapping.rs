//! Decorators enriching work failures with diagnostic context
//!
//! They never retry or swallow anything: the wrapped work still decides
//! what a failure means.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::work::Work;
use crate::domain::process_instance::{FlowNodeInstanceId, ProcessInstanceId, TenantId};
use crate::domain::repository::TransactionService;
use crate::{CoreError, WorkError};

/// Adds `PROCESS_INSTANCE_ID` and `ROOT_PROCESS_INSTANCE_ID` to failures
pub struct ProcessInstanceContextWork {
    wrapped: Box<dyn Work>,
    process_instance_id: ProcessInstanceId,
    root_process_instance_id: Option<ProcessInstanceId>,
    transactions: Option<Arc<dyn TransactionService>>,
}

impl ProcessInstanceContextWork {
    /// Wrap `wrapped`; the root id is looked up on failure
    pub fn new(
        wrapped: Box<dyn Work>,
        process_instance_id: ProcessInstanceId,
        transactions: Arc<dyn TransactionService>,
    ) -> Self {
        Self {
            wrapped,
            process_instance_id,
            root_process_instance_id: None,
            transactions: Some(transactions),
        }
    }

    /// Wrap `wrapped` with a known root id
    pub fn with_root(
        wrapped: Box<dyn Work>,
        process_instance_id: ProcessInstanceId,
        root_process_instance_id: ProcessInstanceId,
    ) -> Self {
        Self {
            wrapped,
            process_instance_id,
            root_process_instance_id: Some(root_process_instance_id),
            transactions: None,
        }
    }

    /// The decorated work
    pub fn wrapped_work(&self) -> &dyn Work {
        self.wrapped.as_ref()
    }

    async fn root_process_instance_id(&self) -> Option<ProcessInstanceId> {
        if self.root_process_instance_id.is_some() {
            return self.root_process_instance_id;
        }
        let transactions = self.transactions.as_ref()?;
        match lookup_root(transactions.as_ref(), self.process_instance_id).await {
            Ok(root) => root,
            Err(e) => {
                debug!(process_instance_id = %self.process_instance_id, error = %e, "Root lookup failed");
                None
            }
        }
    }
}

async fn lookup_root(
    transactions: &dyn TransactionService,
    process_instance_id: ProcessInstanceId,
) -> Result<Option<ProcessInstanceId>, CoreError> {
    let mut tx = transactions.begin().await?;
    let root = match tx.process_instance(process_instance_id).await? {
        Some(instance) => Some(instance.root_process_instance_id),
        None => tx
            .archived_process_instance(process_instance_id)
            .await?
            .map(|archived| archived.instance.root_process_instance_id),
    };
    tx.rollback().await?;
    Ok(root)
}

impl fmt::Display for ProcessInstanceContextWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wrapped)
    }
}

#[async_trait]
impl Work for ProcessInstanceContextWork {
    fn description(&self) -> String {
        self.wrapped.description()
    }

    fn recovery_procedure(&self) -> String {
        self.wrapped.recovery_procedure()
    }

    fn tenant_id(&self) -> TenantId {
        self.wrapped.tenant_id()
    }

    async fn work(&self) -> Result<(), WorkError> {
        self.wrapped.work().await
    }

    async fn handle_failure(&self, error: &mut WorkError) {
        error.add_context("PROCESS_INSTANCE_ID", self.process_instance_id);
        if let Some(root) = self.root_process_instance_id().await {
            error.add_context("ROOT_PROCESS_INSTANCE_ID", root);
        }
        self.wrapped.handle_failure(error).await;
    }
}

/// Adds `FLOW_NODE_DEFINITION_NAME` and `FLOW_NODE_INSTANCE_ID` to failures
pub struct FlowNodeContextWork {
    wrapped: Box<dyn Work>,
    flow_node_instance_id: FlowNodeInstanceId,
    flow_node_name: Option<String>,
    transactions: Option<Arc<dyn TransactionService>>,
}

impl FlowNodeContextWork {
    /// Wrap `wrapped`; the node name is looked up on failure
    pub fn new(
        wrapped: Box<dyn Work>,
        flow_node_instance_id: FlowNodeInstanceId,
        transactions: Arc<dyn TransactionService>,
    ) -> Self {
        Self {
            wrapped,
            flow_node_instance_id,
            flow_node_name: None,
            transactions: Some(transactions),
        }
    }

    /// Wrap `wrapped` with a known node name
    pub fn with_name(
        wrapped: Box<dyn Work>,
        flow_node_instance_id: FlowNodeInstanceId,
        flow_node_name: impl Into<String>,
    ) -> Self {
        Self {
            wrapped,
            flow_node_instance_id,
            flow_node_name: Some(flow_node_name.into()),
            transactions: None,
        }
    }

    /// The decorated work
    pub fn wrapped_work(&self) -> &dyn Work {
        self.wrapped.as_ref()
    }

    async fn flow_node_name(&self) -> Option<String> {
        if self.flow_node_name.is_some() {
            return self.flow_node_name.clone();
        }
        let transactions = self.transactions.as_ref()?;
        let lookup = async {
            let mut tx = transactions.begin().await?;
            let name = match tx.flow_node_instance(self.flow_node_instance_id).await? {
                Some(instance) => Some(instance.name),
                None => tx
                    .archived_flow_node_instance(self.flow_node_instance_id)
                    .await?
                    .map(|archived| archived.instance.name),
            };
            tx.rollback().await?;
            Ok::<_, CoreError>(name)
        };
        lookup.await.unwrap_or_else(|e| {
            debug!(flow_node_instance_id = %self.flow_node_instance_id, error = %e, "Flow node lookup failed");
            None
        })
    }
}

impl fmt::Display for FlowNodeContextWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wrapped)
    }
}

#[async_trait]
impl Work for FlowNodeContextWork {
    fn description(&self) -> String {
        self.wrapped.description()
    }

    fn recovery_procedure(&self) -> String {
        self.wrapped.recovery_procedure()
    }

    fn tenant_id(&self) -> TenantId {
        self.wrapped.tenant_id()
    }

    async fn work(&self) -> Result<(), WorkError> {
        self.wrapped.work().await
    }

    async fn handle_failure(&self, error: &mut WorkError) {
        if let Some(name) = self.flow_node_name().await {
            error.add_context("FLOW_NODE_DEFINITION_NAME", name);
        }
        error.add_context("FLOW_NODE_INSTANCE_ID", self.flow_node_instance_id);
        self.wrapped.handle_failure(error).await;
    }
}
