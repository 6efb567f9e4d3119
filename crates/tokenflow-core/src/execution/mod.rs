/// Dispatch queue into the state machine
pub mod container_registry;

/// Transaction plus deferred side effects
pub mod context;

/// Step-by-step flow node execution
pub mod executor;

/// Failure context decorators
pub mod failure_wrapping;

/// Flow node record helpers
pub mod flow_nodes;

/// Sequence flow evaluation
pub mod transition;

/// Units of work and the work service
pub mod work;

pub use container_registry::ContainerRegistry;
pub use context::{ExecutionContext, FlowNodeDispatch, SideEffect};
pub use executor::FlowNodeExecutor;
pub use failure_wrapping::{FlowNodeContextWork, ProcessInstanceContextWork};
pub use transition::TransitionEvaluator;
pub use work::{ExecuteFlowNodeWork, TriggerBoundaryTimerWork, Work, WorkService};
