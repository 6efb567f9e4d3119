//!
//! Tokenflow Core - process-instance execution kernel
//!
//! This crate advances running process instances through their flow nodes
//! using a token-passing model. Boundary events and the timer scheduler race
//! against normal execution; the state machine, the token ledger and the
//! dispatcher together keep token semantics exactly-once under those races.
//!
//! Persistence, job storage and incident reporting are collaborators: the
//! core only depends on the traits in [`domain::repository`] and
//! [`scheduler`]. `tokenflow-state-inmemory` provides implementations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - process model, instances, tokens and collaborator traits
pub mod domain;

/// Application services - token ledger, activity instances, runtime API
pub mod application;

/// Flow node states and the state transition table
pub mod state;

/// Unit-of-work execution, dispatching and failure wrapping
pub mod execution;

/// Timer/job scheduler façade
pub mod scheduler;

/// Engine configuration
pub mod config;

/// Error types
pub mod error;

// Re-export key types
pub use config::EngineConfig;
pub use error::{ActivityStateExecutionError, CoreError, RecorderError, SchedulerError, WorkError};

pub use domain::events::{event_types, RecordEvent};
pub use domain::flow_node_instance::{
    ArchivedFlowNodeInstance, FlowNodeInstance, LogicalGroup, StateCategory,
};
pub use domain::process_definition::{
    FlowNodeDefinition, FlowNodeKind, FlowNodeType, ProcessDefinition, ProcessDefinitionBuilder,
};
pub use domain::process_instance::{
    ArchivedProcessInstance, FlowNodeInstanceId, ProcessDefinitionId, ProcessInstance, ProcessInstanceId,
    ProcessInstanceState, TenantId,
};
pub use domain::repository::{
    Incident, IncidentService, ProcessDefinitionRepository, Record, RecordKey, Transaction,
    TransactionService,
};
pub use domain::token::{ArchivedToken, Token, TokenId};

pub use application::runtime_interface::{
    ApiSession, ProcessApi, ProcessRuntime, TenantContext, TenantScopedProcessApi,
};
pub use application::activity_instance_service::{
    ActivityInstanceService, RecorderActivityInstanceService,
};
pub use application::token_ledger::{TokenLedger, TokenService};
pub use execution::{
    ContainerRegistry, ExecutionContext, FlowNodeDispatch, FlowNodeExecutor, SideEffect,
    TriggerBoundaryTimerWork, Work, WorkService,
};
pub use scheduler::{
    FiredJob, JobDescriptor, JobId, JobKind, JobParameter, JobService, MisfirePolicy, ScheduledJob,
    SchedulerExecutor, SchedulerService, Trigger, TriggerBoundaryTimerJob,
};
pub use state::{StateCode, StateId, StateRegistry};
