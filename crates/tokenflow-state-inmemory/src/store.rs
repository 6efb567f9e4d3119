//! Versioned in-memory record store
//!
//! Every row carries the version of the commit that last wrote it. A
//! transaction buffers its writes in an overlay and remembers the version of
//! every row it observed; commit re-checks those versions for the rows it
//! updates or deletes, so the first committer wins.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use tokenflow_core::domain::flow_node_instance::{ArchivedFlowNodeInstance, FlowNodeInstance};
use tokenflow_core::domain::process_instance::{
    ArchivedProcessInstance, FlowNodeInstanceId, ProcessInstance, ProcessInstanceId,
};
use tokenflow_core::domain::token::{ArchivedToken, Token};
use tokenflow_core::{
    Record, RecordEvent, RecordKey, RecorderError, Transaction, TransactionService,
};

#[derive(Debug, Clone)]
struct Row {
    version: u64,
    record: Record,
}

#[derive(Debug, Default)]
struct Tables {
    rows: HashMap<RecordKey, Row>,
    version: u64,
    events: VecDeque<RecordEvent>,
}

/// Record events kept by [`InMemoryStore::new`]
pub const DEFAULT_EVENT_CAPACITY: usize = 10_000;

/// Shared record storage.
///
/// Committed record events are kept in a bounded log; the oldest are
/// dropped once it is full.
#[derive(Debug)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    sequence: AtomicU64,
    event_capacity: usize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store keeping at most `event_capacity` record events
    pub fn with_event_capacity(event_capacity: usize) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            sequence: AtomicU64::new(0),
            event_capacity,
        }
    }

    /// Next value of the id sequence
    pub fn next_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Retained committed record events, in commit order
    pub fn events(&self) -> Vec<RecordEvent> {
        self.tables.read().events.iter().cloned().collect()
    }

    /// Committed record events of one process instance
    pub fn events_of(&self, process_instance_id: ProcessInstanceId) -> Vec<RecordEvent> {
        self.tables
            .read()
            .events
            .iter()
            .filter(|event| event.process_instance_id == Some(process_instance_id))
            .cloned()
            .collect()
    }

    /// Committed records, live and archived, of one process instance
    pub fn records_of(&self, process_instance_id: ProcessInstanceId) -> Vec<Record> {
        self.tables
            .read()
            .rows
            .values()
            .filter(|row| row.record.process_instance_id() == process_instance_id)
            .map(|row| row.record.clone())
            .collect()
    }

    /// Number of committed records
    pub fn record_count(&self) -> usize {
        self.tables.read().rows.len()
    }

    fn row(&self, key: &RecordKey) -> Option<Row> {
        self.tables.read().rows.get(key).cloned()
    }

    fn rows_matching(&self, matches: &dyn Fn(&Record) -> bool) -> Vec<(RecordKey, Row)> {
        self.tables
            .read()
            .rows
            .iter()
            .filter(|(_, row)| matches(&row.record))
            .map(|(key, row)| (*key, row.clone()))
            .collect()
    }

    fn apply(
        &self,
        observed: &HashMap<RecordKey, u64>,
        pending: HashMap<RecordKey, Pending>,
        events: Vec<RecordEvent>,
    ) -> Result<u64, RecorderError> {
        let mut tables = self.tables.write();

        for (key, change) in &pending {
            let current = tables.rows.get(key).map(|row| row.version);
            match change {
                Pending::Insert(_) => {
                    if current.is_some() {
                        return Err(RecorderError::Conflict(format!("{:?}", key)));
                    }
                }
                Pending::Update(_) | Pending::Delete => {
                    if current.is_none() || current != observed.get(key).copied() {
                        return Err(RecorderError::Conflict(format!("{:?}", key)));
                    }
                }
            }
        }

        tables.version += 1;
        let version = tables.version;
        for (key, change) in pending {
            match change {
                Pending::Insert(record) | Pending::Update(record) => {
                    tables.rows.insert(key, Row { version, record });
                }
                Pending::Delete => {
                    tables.rows.remove(&key);
                }
            }
        }
        tables.events.extend(events);
        let overflow = tables.events.len().saturating_sub(self.event_capacity);
        if overflow > 0 {
            tables.events.drain(..overflow);
            trace!(dropped = overflow, "Record event log trimmed");
        }
        Ok(version)
    }
}

#[derive(Debug, Clone)]
enum Pending {
    Insert(Record),
    Update(Record),
    Delete,
}

/// Transaction over an [`InMemoryStore`]
pub struct InMemoryTransaction {
    store: Arc<InMemoryStore>,
    observed: HashMap<RecordKey, u64>,
    pending: HashMap<RecordKey, Pending>,
    events: Vec<RecordEvent>,
    closed: bool,
}

impl InMemoryTransaction {
    /// Begin a transaction
    pub fn new(store: Arc<InMemoryStore>) -> Self {
        Self {
            store,
            observed: HashMap::new(),
            pending: HashMap::new(),
            events: Vec::new(),
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), RecorderError> {
        if self.closed {
            return Err(RecorderError::TransactionClosed);
        }
        Ok(())
    }

    fn get(&mut self, key: RecordKey) -> Option<Record> {
        match self.pending.get(&key) {
            Some(Pending::Insert(record)) | Some(Pending::Update(record)) => {
                return Some(record.clone())
            }
            Some(Pending::Delete) => return None,
            None => {}
        }
        let row = self.store.row(&key)?;
        self.observed.entry(key).or_insert(row.version);
        Some(row.record)
    }

    fn scan(&mut self, matches: impl Fn(&Record) -> bool) -> Vec<Record> {
        let mut found: HashMap<RecordKey, Record> = HashMap::new();
        for (key, row) in self.store.rows_matching(&matches) {
            self.observed.entry(key).or_insert(row.version);
            found.insert(key, row.record);
        }
        for (key, change) in &self.pending {
            match change {
                Pending::Insert(record) | Pending::Update(record) if matches(record) => {
                    found.insert(*key, record.clone());
                }
                _ => {
                    found.remove(key);
                }
            }
        }
        found.into_values().collect()
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn process_instance(
        &mut self,
        id: ProcessInstanceId,
    ) -> Result<Option<ProcessInstance>, RecorderError> {
        self.ensure_open()?;
        Ok(match self.get(RecordKey::ProcessInstance(id)) {
            Some(Record::ProcessInstance(instance)) => Some(instance),
            _ => None,
        })
    }

    async fn archived_process_instance(
        &mut self,
        id: ProcessInstanceId,
    ) -> Result<Option<ArchivedProcessInstance>, RecorderError> {
        self.ensure_open()?;
        Ok(match self.get(RecordKey::ArchivedProcessInstance(id)) {
            Some(Record::ArchivedProcessInstance(archived)) => Some(archived),
            _ => None,
        })
    }

    async fn flow_node_instance(
        &mut self,
        id: FlowNodeInstanceId,
    ) -> Result<Option<FlowNodeInstance>, RecorderError> {
        self.ensure_open()?;
        Ok(match self.get(RecordKey::FlowNode(id)) {
            Some(Record::FlowNode(instance)) => Some(instance),
            _ => None,
        })
    }

    async fn archived_flow_node_instance(
        &mut self,
        id: FlowNodeInstanceId,
    ) -> Result<Option<ArchivedFlowNodeInstance>, RecorderError> {
        self.ensure_open()?;
        Ok(match self.get(RecordKey::ArchivedFlowNode(id)) {
            Some(Record::ArchivedFlowNode(archived)) => Some(archived),
            _ => None,
        })
    }

    async fn flow_node_instances_of(
        &mut self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<FlowNodeInstance>, RecorderError> {
        self.ensure_open()?;
        let mut nodes: Vec<FlowNodeInstance> = self
            .scan(|record| {
                matches!(record, Record::FlowNode(node)
                    if node.parent_process_instance_id() == process_instance_id)
            })
            .into_iter()
            .filter_map(|record| match record {
                Record::FlowNode(node) => Some(node),
                _ => None,
            })
            .collect();
        nodes.sort_by_key(|node| node.id);
        Ok(nodes)
    }

    async fn all_flow_node_instances(&mut self) -> Result<Vec<FlowNodeInstance>, RecorderError> {
        self.ensure_open()?;
        let mut nodes: Vec<FlowNodeInstance> = self
            .scan(|record| matches!(record, Record::FlowNode(_)))
            .into_iter()
            .filter_map(|record| match record {
                Record::FlowNode(node) => Some(node),
                _ => None,
            })
            .collect();
        nodes.sort_by_key(|node| node.id);
        Ok(nodes)
    }

    async fn archived_flow_node_instances_of(
        &mut self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<ArchivedFlowNodeInstance>, RecorderError> {
        self.ensure_open()?;
        let mut nodes: Vec<ArchivedFlowNodeInstance> = self
            .scan(|record| {
                matches!(record, Record::ArchivedFlowNode(archived)
                    if archived.instance.parent_process_instance_id() == process_instance_id)
            })
            .into_iter()
            .filter_map(|record| match record {
                Record::ArchivedFlowNode(archived) => Some(archived),
                _ => None,
            })
            .collect();
        nodes.sort_by_key(|archived| archived.instance.id);
        Ok(nodes)
    }

    async fn tokens_of(
        &mut self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<Token>, RecorderError> {
        self.ensure_open()?;
        let mut tokens: Vec<Token> = self
            .scan(|record| {
                matches!(record, Record::Token(token)
                    if token.process_instance_id == process_instance_id)
            })
            .into_iter()
            .filter_map(|record| match record {
                Record::Token(token) => Some(token),
                _ => None,
            })
            .collect();
        tokens.sort_by_key(|token| token.id);
        Ok(tokens)
    }

    async fn archived_tokens_of(
        &mut self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<ArchivedToken>, RecorderError> {
        self.ensure_open()?;
        let mut tokens: Vec<ArchivedToken> = self
            .scan(|record| {
                matches!(record, Record::ArchivedToken(archived)
                    if archived.token.process_instance_id == process_instance_id)
            })
            .into_iter()
            .filter_map(|record| match record {
                Record::ArchivedToken(archived) => Some(archived),
                _ => None,
            })
            .collect();
        tokens.sort_by_key(|archived| archived.token.id);
        Ok(tokens)
    }

    async fn record_insert(
        &mut self,
        record: Record,
        event: RecordEvent,
    ) -> Result<(), RecorderError> {
        self.ensure_open()?;
        let key = record.key();
        if self.get(key).is_some() {
            return Err(RecorderError::Duplicate(format!("{:?}", key)));
        }
        let change = match self.pending.get(&key) {
            // deleted then re-inserted in this transaction
            Some(Pending::Delete) => Pending::Update(record),
            _ => Pending::Insert(record),
        };
        trace!(key = ?key, event_type = %event.event_type, "Insert");
        self.pending.insert(key, change);
        self.events.push(event);
        Ok(())
    }

    async fn record_update(
        &mut self,
        record: Record,
        event: RecordEvent,
    ) -> Result<(), RecorderError> {
        self.ensure_open()?;
        let key = record.key();
        if self.get(key).is_none() {
            return Err(RecorderError::NotFound(format!("{:?}", key)));
        }
        let change = match self.pending.get(&key) {
            Some(Pending::Insert(_)) => Pending::Insert(record),
            _ => Pending::Update(record),
        };
        trace!(key = ?key, event_type = %event.event_type, "Update");
        self.pending.insert(key, change);
        self.events.push(event);
        Ok(())
    }

    async fn record_delete(
        &mut self,
        key: RecordKey,
        event: RecordEvent,
    ) -> Result<(), RecorderError> {
        self.ensure_open()?;
        if self.get(key).is_none() {
            return Err(RecorderError::NotFound(format!("{:?}", key)));
        }
        match self.pending.remove(&key) {
            Some(Pending::Insert(_)) => {}
            _ => {
                self.pending.insert(key, Pending::Delete);
            }
        }
        trace!(key = ?key, event_type = %event.event_type, "Delete");
        self.events.push(event);
        Ok(())
    }

    fn next_id(&mut self) -> u64 {
        self.store.next_id()
    }

    async fn commit(&mut self) -> Result<(), RecorderError> {
        self.ensure_open()?;
        self.closed = true;
        let pending = std::mem::take(&mut self.pending);
        let events = std::mem::take(&mut self.events);
        let writes = pending.len();
        let version = self.store.apply(&self.observed, pending, events)?;
        debug!(version, writes, "Transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), RecorderError> {
        self.ensure_open()?;
        self.closed = true;
        self.pending.clear();
        self.events.clear();
        Ok(())
    }
}

/// Opens [`InMemoryTransaction`]s on a shared store
#[derive(Debug, Clone)]
pub struct InMemoryTransactionService {
    store: Arc<InMemoryStore>,
}

impl InMemoryTransactionService {
    /// Create a service over `store`
    pub fn new(store: Arc<InMemoryStore>) -> Self {
        Self { store }
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }
}

#[async_trait]
impl TransactionService for InMemoryTransactionService {
    async fn begin(&self) -> Result<Box<dyn Transaction>, RecorderError> {
        Ok(Box::new(InMemoryTransaction::new(self.store.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenflow_core::event_types;
    use tokenflow_core::{ProcessDefinitionId, TokenId};

    fn process_instance(id: u64) -> ProcessInstance {
        ProcessInstance::new(ProcessInstanceId(id), ProcessDefinitionId(1))
    }

    fn token(id: u64, pid: u64) -> Token {
        Token {
            id: TokenId(id),
            ref_id: pid,
            parent_ref_id: None,
            process_instance_id: ProcessInstanceId(pid),
        }
    }

    fn event() -> RecordEvent {
        RecordEvent::new(event_types::PROCESSINSTANCE_UPDATED)
    }

    async fn seed(service: &InMemoryTransactionService) {
        let mut tx = service.begin().await.unwrap();
        tx.record_insert(Record::ProcessInstance(process_instance(1)), event())
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_reads_see_own_writes_only_until_commit() {
        let service = InMemoryTransactionService::new(Arc::new(InMemoryStore::new()));
        let mut writer = service.begin().await.unwrap();
        let mut reader = service.begin().await.unwrap();

        writer
            .record_insert(Record::Token(token(5, 1)), RecordEvent::new(event_types::TOKEN_CREATED))
            .await
            .unwrap();

        assert_eq!(writer.tokens_of(ProcessInstanceId(1)).await.unwrap().len(), 1);
        assert!(reader.tokens_of(ProcessInstanceId(1)).await.unwrap().is_empty());

        writer.commit().await.unwrap();
        let mut later = service.begin().await.unwrap();
        assert_eq!(later.tokens_of(ProcessInstanceId(1)).await.unwrap(), vec![token(5, 1)]);
    }

    #[tokio::test]
    async fn test_first_committer_wins() {
        let service = InMemoryTransactionService::new(Arc::new(InMemoryStore::new()));
        seed(&service).await;

        let mut first = service.begin().await.unwrap();
        let mut second = service.begin().await.unwrap();
        for tx in [&mut first, &mut second] {
            let mut instance = tx.process_instance(ProcessInstanceId(1)).await.unwrap().unwrap();
            instance.touch();
            tx.record_update(Record::ProcessInstance(instance), event())
                .await
                .unwrap();
        }

        first.commit().await.unwrap();
        let result = second.commit().await;
        assert!(matches!(result, Err(RecorderError::Conflict(_))));
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_rolled_back_writes_are_discarded() {
        let store = Arc::new(InMemoryStore::new());
        let service = InMemoryTransactionService::new(store.clone());
        seed(&service).await;

        let mut tx = service.begin().await.unwrap();
        tx.record_delete(RecordKey::ProcessInstance(ProcessInstanceId(1)), event())
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.record_count(), 1);
        assert_eq!(tx.commit().await, Err(RecorderError::TransactionClosed));
    }

    #[tokio::test]
    async fn test_insert_then_delete_leaves_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let service = InMemoryTransactionService::new(store.clone());

        let mut tx = service.begin().await.unwrap();
        tx.record_insert(Record::Token(token(3, 1)), event()).await.unwrap();
        tx.record_delete(RecordKey::Token(TokenId(3)), event()).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.record_count(), 0);
        assert_eq!(store.events().len(), 2);
    }

    #[tokio::test]
    async fn test_event_log_keeps_the_newest_events() {
        let store = Arc::new(InMemoryStore::with_event_capacity(3));
        let service = InMemoryTransactionService::new(store.clone());

        for id in 1..=5 {
            let mut tx = service.begin().await.unwrap();
            tx.record_insert(
                Record::ProcessInstance(process_instance(id)),
                RecordEvent::new(event_types::PROCESSINSTANCE_CREATED)
                    .for_process_instance(ProcessInstanceId(id)),
            )
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }

        let kept: Vec<_> = store
            .events()
            .into_iter()
            .filter_map(|event| event.process_instance_id)
            .collect();
        assert_eq!(
            kept,
            vec![ProcessInstanceId(3), ProcessInstanceId(4), ProcessInstanceId(5)]
        );
        assert!(store.events_of(ProcessInstanceId(1)).is_empty());
        assert_eq!(store.record_count(), 5);
    }

    #[tokio::test]
    async fn test_update_of_missing_record_fails() {
        let service = InMemoryTransactionService::new(Arc::new(InMemoryStore::new()));
        let mut tx = service.begin().await.unwrap();

        let result = tx
            .record_update(Record::ProcessInstance(process_instance(8)), event())
            .await;
        assert!(matches!(result, Err(RecorderError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_insert_fails() {
        let service = InMemoryTransactionService::new(Arc::new(InMemoryStore::new()));
        seed(&service).await;

        let mut tx = service.begin().await.unwrap();
        let result = tx
            .record_insert(Record::ProcessInstance(process_instance(1)), event())
            .await;
        assert!(matches!(result, Err(RecorderError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_delete_conflicts_with_concurrent_update() {
        let service = InMemoryTransactionService::new(Arc::new(InMemoryStore::new()));
        seed(&service).await;

        let mut deleter = service.begin().await.unwrap();
        deleter
            .record_delete(RecordKey::ProcessInstance(ProcessInstanceId(1)), event())
            .await
            .unwrap();

        let mut updater = service.begin().await.unwrap();
        let mut instance = updater
            .process_instance(ProcessInstanceId(1))
            .await
            .unwrap()
            .unwrap();
        instance.touch();
        updater
            .record_update(Record::ProcessInstance(instance), event())
            .await
            .unwrap();
        updater.commit().await.unwrap();

        assert!(matches!(
            deleter.commit().await,
            Err(RecorderError::Conflict(_))
        ));
    }
}
