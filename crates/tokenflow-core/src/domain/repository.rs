//! Collaborator traits for the Tokenflow core
//!
//! The core never owns persistence. Every mutation goes through a
//! [`Transaction`] obtained from a [`TransactionService`]; a unit of work
//! either commits all of its inserts, updates and deletes or none of them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::events::RecordEvent;
use super::flow_node_instance::{ArchivedFlowNodeInstance, FlowNodeInstance};
use super::process_definition::ProcessDefinition;
use super::process_instance::{
    ArchivedProcessInstance, FlowNodeInstanceId, ProcessDefinitionId, ProcessInstance,
    ProcessInstanceId, TenantId,
};
use super::token::{ArchivedToken, Token, TokenId};
use crate::{CoreError, RecorderError};

/// Identity of a persisted record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKey {
    /// Live process instance
    ProcessInstance(ProcessInstanceId),
    /// Live flow node instance
    FlowNode(FlowNodeInstanceId),
    /// Live token
    Token(TokenId),
    /// Archived process instance
    ArchivedProcessInstance(ProcessInstanceId),
    /// Archived flow node instance
    ArchivedFlowNode(FlowNodeInstanceId),
    /// Consumed token
    ArchivedToken(TokenId),
}

/// A persisted record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Record {
    /// Live process instance
    ProcessInstance(ProcessInstance),
    /// Live flow node instance
    FlowNode(FlowNodeInstance),
    /// Live token
    Token(Token),
    /// Archived process instance
    ArchivedProcessInstance(ArchivedProcessInstance),
    /// Archived flow node instance
    ArchivedFlowNode(ArchivedFlowNodeInstance),
    /// Consumed token
    ArchivedToken(ArchivedToken),
}

impl Record {
    /// Key the record is stored under
    pub fn key(&self) -> RecordKey {
        match self {
            Record::ProcessInstance(r) => RecordKey::ProcessInstance(r.id),
            Record::FlowNode(r) => RecordKey::FlowNode(r.id),
            Record::Token(r) => RecordKey::Token(r.id),
            Record::ArchivedProcessInstance(r) => RecordKey::ArchivedProcessInstance(r.instance.id),
            Record::ArchivedFlowNode(r) => RecordKey::ArchivedFlowNode(r.instance.id),
            Record::ArchivedToken(r) => RecordKey::ArchivedToken(r.token.id),
        }
    }

    /// Process instance the record belongs to
    pub fn process_instance_id(&self) -> ProcessInstanceId {
        match self {
            Record::ProcessInstance(r) => r.id,
            Record::FlowNode(r) => r.parent_process_instance_id(),
            Record::Token(r) => r.process_instance_id,
            Record::ArchivedProcessInstance(r) => r.instance.id,
            Record::ArchivedFlowNode(r) => r.instance.parent_process_instance_id(),
            Record::ArchivedToken(r) => r.token.process_instance_id,
        }
    }
}

/// One unit of work against the recorder.
///
/// Reads observe the transaction's own pending writes. `commit` fails with
/// [`RecorderError::Conflict`] when a record this transaction updated or
/// deleted was changed by another transaction that committed first.
#[async_trait]
pub trait Transaction: Send {
    /// Read a live process instance
    async fn process_instance(
        &mut self,
        id: ProcessInstanceId,
    ) -> Result<Option<ProcessInstance>, RecorderError>;

    /// Read an archived process instance
    async fn archived_process_instance(
        &mut self,
        id: ProcessInstanceId,
    ) -> Result<Option<ArchivedProcessInstance>, RecorderError>;

    /// Read a live flow node instance
    async fn flow_node_instance(
        &mut self,
        id: FlowNodeInstanceId,
    ) -> Result<Option<FlowNodeInstance>, RecorderError>;

    /// Read an archived flow node instance
    async fn archived_flow_node_instance(
        &mut self,
        id: FlowNodeInstanceId,
    ) -> Result<Option<ArchivedFlowNodeInstance>, RecorderError>;

    /// Live flow node instances of a process instance, ordered by id
    async fn flow_node_instances_of(
        &mut self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<FlowNodeInstance>, RecorderError>;

    /// Every live flow node instance, ordered by id
    async fn all_flow_node_instances(&mut self) -> Result<Vec<FlowNodeInstance>, RecorderError>;

    /// Archived flow node instances of a process instance, ordered by id
    async fn archived_flow_node_instances_of(
        &mut self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<ArchivedFlowNodeInstance>, RecorderError>;

    /// Live tokens of a process instance, ordered by id
    async fn tokens_of(
        &mut self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<Token>, RecorderError>;

    /// Consumed tokens of a process instance, ordered by id
    async fn archived_tokens_of(
        &mut self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<ArchivedToken>, RecorderError>;

    /// Insert a new record
    async fn record_insert(&mut self, record: Record, event: RecordEvent)
        -> Result<(), RecorderError>;

    /// Replace an existing record
    async fn record_update(&mut self, record: Record, event: RecordEvent)
        -> Result<(), RecorderError>;

    /// Delete an existing record
    async fn record_delete(&mut self, key: RecordKey, event: RecordEvent)
        -> Result<(), RecorderError>;

    /// Allocate an identifier from the store sequence
    fn next_id(&mut self) -> u64;

    /// Make every pending write visible atomically
    async fn commit(&mut self) -> Result<(), RecorderError>;

    /// Discard every pending write
    async fn rollback(&mut self) -> Result<(), RecorderError>;
}

/// Opens transactions
#[async_trait]
pub trait TransactionService: Send + Sync {
    /// Begin a new transaction
    async fn begin(&self) -> Result<Box<dyn Transaction>, RecorderError>;
}

/// Repository for deployed process definitions
#[async_trait]
pub trait ProcessDefinitionRepository: Send + Sync {
    /// Find a process definition by ID
    async fn find_by_id(
        &self,
        id: ProcessDefinitionId,
    ) -> Result<Option<ProcessDefinition>, CoreError>;

    /// Save a process definition
    async fn save(&self, definition: &ProcessDefinition) -> Result<(), CoreError>;

    /// Delete a process definition
    async fn delete(&self, id: ProcessDefinitionId) -> Result<(), CoreError>;

    /// List all deployed definition ids
    async fn list_definitions(&self) -> Result<Vec<ProcessDefinitionId>, CoreError>;
}

/// A unit of work failed for good
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    /// Tenant the work ran for
    pub tenant_id: TenantId,
    /// Description of the failed work
    pub description: String,
    /// Enriched failure message
    pub cause: String,
    /// How an operator can replay the work
    pub recovery_procedure: String,
}

/// Receives incidents for operator diagnosis
#[async_trait]
pub trait IncidentService: Send + Sync {
    /// Record one incident
    async fn report(&self, incident: Incident);
}
