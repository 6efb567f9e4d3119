//! Commit failure injection

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

use tokenflow_core::{
    ArchivedFlowNodeInstance, ArchivedProcessInstance, ArchivedToken, FlowNodeInstance,
    FlowNodeInstanceId, ProcessInstance, ProcessInstanceId, Record, RecordEvent, RecordKey,
    RecorderError, Token, Transaction, TransactionService,
};

type RecordMatcher = Box<dyn Fn(&Record) -> bool + Send + Sync>;

struct FaultRule {
    remaining: usize,
    error: RecorderError,
    matches: RecordMatcher,
}

#[derive(Default)]
struct Faults {
    rules: Mutex<Vec<FaultRule>>,
    injected: AtomicUsize,
}

impl Faults {
    /// Error for a commit that wrote `written`, consuming one use of the rule
    fn take(&self, written: &[Record]) -> Option<RecorderError> {
        let mut rules = self.rules.lock();
        let position = rules.iter().position(|rule| {
            rule.remaining > 0 && written.iter().any(|record| (rule.matches)(record))
        })?;
        let rule = &mut rules[position];
        rule.remaining -= 1;
        let error = rule.error.clone();
        if rule.remaining == 0 {
            rules.remove(position);
        }
        self.injected.fetch_add(1, Ordering::SeqCst);
        Some(error)
    }
}

/// [`TransactionService`] whose commits can be made to fail.
///
/// A failing commit rolls the wrapped transaction back and returns the
/// configured error, as a crashed or disconnected store would.
pub struct FaultInjectingTransactionService {
    inner: Arc<dyn TransactionService>,
    faults: Arc<Faults>,
}

impl FaultInjectingTransactionService {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn TransactionService>) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults::default()),
        }
    }

    /// Fail the next `times` commits that inserted or updated a record
    pub fn fail_next_commits(&self, times: usize, error: RecorderError) {
        self.fail_commits_writing(times, error, |_| true);
    }

    /// Fail the next `times` commits that wrote a record accepted by `matches`
    pub fn fail_commits_writing<F>(&self, times: usize, error: RecorderError, matches: F)
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.faults.rules.lock().push(FaultRule {
            remaining: times,
            error,
            matches: Box::new(matches),
        });
    }

    /// Number of commits failed so far
    pub fn injected(&self) -> usize {
        self.faults.injected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionService for FaultInjectingTransactionService {
    async fn begin(&self) -> Result<Box<dyn Transaction>, RecorderError> {
        Ok(Box::new(FaultInjectingTransaction {
            inner: self.inner.begin().await?,
            faults: self.faults.clone(),
            written: Vec::new(),
        }))
    }
}

struct FaultInjectingTransaction {
    inner: Box<dyn Transaction>,
    faults: Arc<Faults>,
    written: Vec<Record>,
}

#[async_trait]
impl Transaction for FaultInjectingTransaction {
    async fn process_instance(
        &mut self,
        id: ProcessInstanceId,
    ) -> Result<Option<ProcessInstance>, RecorderError> {
        self.inner.process_instance(id).await
    }

    async fn archived_process_instance(
        &mut self,
        id: ProcessInstanceId,
    ) -> Result<Option<ArchivedProcessInstance>, RecorderError> {
        self.inner.archived_process_instance(id).await
    }

    async fn flow_node_instance(
        &mut self,
        id: FlowNodeInstanceId,
    ) -> Result<Option<FlowNodeInstance>, RecorderError> {
        self.inner.flow_node_instance(id).await
    }

    async fn archived_flow_node_instance(
        &mut self,
        id: FlowNodeInstanceId,
    ) -> Result<Option<ArchivedFlowNodeInstance>, RecorderError> {
        self.inner.archived_flow_node_instance(id).await
    }

    async fn flow_node_instances_of(
        &mut self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<FlowNodeInstance>, RecorderError> {
        self.inner.flow_node_instances_of(process_instance_id).await
    }

    async fn all_flow_node_instances(&mut self) -> Result<Vec<FlowNodeInstance>, RecorderError> {
        self.inner.all_flow_node_instances().await
    }

    async fn archived_flow_node_instances_of(
        &mut self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<ArchivedFlowNodeInstance>, RecorderError> {
        self.inner
            .archived_flow_node_instances_of(process_instance_id)
            .await
    }

    async fn tokens_of(
        &mut self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<Token>, RecorderError> {
        self.inner.tokens_of(process_instance_id).await
    }

    async fn archived_tokens_of(
        &mut self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<ArchivedToken>, RecorderError> {
        self.inner.archived_tokens_of(process_instance_id).await
    }

    async fn record_insert(
        &mut self,
        record: Record,
        event: RecordEvent,
    ) -> Result<(), RecorderError> {
        self.written.push(record.clone());
        self.inner.record_insert(record, event).await
    }

    async fn record_update(
        &mut self,
        record: Record,
        event: RecordEvent,
    ) -> Result<(), RecorderError> {
        self.written.push(record.clone());
        self.inner.record_update(record, event).await
    }

    async fn record_delete(
        &mut self,
        key: RecordKey,
        event: RecordEvent,
    ) -> Result<(), RecorderError> {
        self.inner.record_delete(key, event).await
    }

    fn next_id(&mut self) -> u64 {
        self.inner.next_id()
    }

    async fn commit(&mut self) -> Result<(), RecorderError> {
        if let Some(error) = self.faults.take(&self.written) {
            warn!(error = %error, "Injecting commit failure");
            self.inner.rollback().await?;
            return Err(error);
        }
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> Result<(), RecorderError> {
        self.inner.rollback().await
    }
}
