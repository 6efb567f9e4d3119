//! Flow node states
//!
//! Each state is a flat implementation of [`FlowNodeState`], looked up by its
//! numeric id in a [`StateRegistry`]. The registry also knows, for every kind
//! of flow node, which state follows which.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::application::activity_instance_service::ActivityInstanceService;
use crate::application::token_ledger::TokenService;
use crate::domain::flow_node_instance::{FlowNodeInstance, StateCategory};
use crate::domain::process_definition::{FlowNodeType, ProcessDefinition};
use crate::execution::context::ExecutionContext;
use crate::{ActivityStateExecutionError, CoreError};

mod boundary;
mod completed;
mod executing;
mod initializing;
mod stable;
mod unwind;

pub use boundary::ExecutingBoundaryEventState;
pub use completed::CompletedState;
pub use executing::ExecutingState;
pub use initializing::InitializingState;
pub use stable::StableState;
pub use unwind::{UnwindingState, UnwoundState};

/// Stable numeric identifier of a flow node state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateId(pub u32);

impl StateId {
    /// Created, not yet executed
    pub const INITIALIZING: StateId = StateId(0);
    /// Task doing its work
    pub const EXECUTING: StateId = StateId(1);
    /// Finished normally
    pub const COMPLETED: StateId = StateId(2);
    /// Work failed for good
    pub const FAILED: StateId = StateId(3);
    /// User task waiting to be executed
    pub const READY: StateId = StateId(4);
    /// Boundary event waiting for its trigger
    pub const WAITING: StateId = StateId(10);
    /// Unwinding after an interrupt
    pub const ABORTING: StateId = StateId(13);
    /// Unwinding after a cancellation
    pub const CANCELLING: StateId = StateId(14);
    /// Finished by cancellation
    pub const CANCELLED: StateId = StateId(15);
    /// Finished by an interrupt
    pub const ABORTED: StateId = StateId(16);
    /// Boundary event reacting to its trigger
    pub const EXECUTING_BOUNDARY: StateId = StateId(65);
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of [`FlowNodeState::execute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateCode {
    /// The state finished; the node may move to its next state
    Done,
    /// The state must be re-entered by a later dispatch
    Executing,
}

/// Behaviour of one flow node state
#[async_trait]
pub trait FlowNodeState: Send + Sync {
    /// Stable numeric id
    fn id(&self) -> StateId;

    /// Human-readable name
    fn name(&self) -> &'static str;

    /// Whether `execute` has work left for this instance. Returns false once
    /// the instance is past this state's effects.
    fn should_execute_state(&self, definition: &ProcessDefinition, instance: &FlowNodeInstance)
        -> bool;

    /// Perform the state's work inside the context's transaction
    async fn execute(
        &self,
        ctx: &mut ExecutionContext,
        definition: &ProcessDefinition,
        instance: &mut FlowNodeInstance,
    ) -> Result<StateCode, ActivityStateExecutionError>;

    /// Called when `parent` transfers control into `child`, which currently
    /// sits in this state. Returns whether `child` should be dispatched now.
    fn hit(
        &self,
        _definition: &ProcessDefinition,
        _parent: &FlowNodeInstance,
        _child: &FlowNodeInstance,
    ) -> bool {
        true
    }

    /// Whether entering this state unwinds the node
    fn is_interrupting(&self) -> bool {
        self.state_category() != StateCategory::Normal
    }

    /// Whether the node waits here for an external trigger
    fn is_stable(&self) -> bool;

    /// Whether the node ends here
    fn is_terminal(&self) -> bool;

    /// Category of nodes this state serves
    fn state_category(&self) -> StateCategory;
}

/// Dispatch table from state id to behaviour
pub struct StateRegistry {
    states: HashMap<StateId, Arc<dyn FlowNodeState>>,
}

impl StateRegistry {
    /// Register every built-in state
    pub fn new(
        tokens: Arc<dyn TokenService>,
        activities: Arc<dyn ActivityInstanceService>,
    ) -> Self {
        let states: Vec<Arc<dyn FlowNodeState>> = vec![
            Arc::new(InitializingState::new(tokens.clone())),
            Arc::new(StableState::ready()),
            Arc::new(StableState::waiting()),
            Arc::new(StableState::failed()),
            Arc::new(ExecutingState),
            Arc::new(ExecutingBoundaryEventState::new(
                tokens.clone(),
                activities.clone(),
            )),
            Arc::new(CompletedState::new(activities.clone())),
            Arc::new(UnwindingState::aborting(activities.clone())),
            Arc::new(UnwindingState::cancelling(activities)),
            Arc::new(UnwoundState::aborted(tokens.clone())),
            Arc::new(UnwoundState::cancelled(tokens)),
        ];

        Self {
            states: states.into_iter().map(|state| (state.id(), state)).collect(),
        }
    }

    /// Look up a state by id
    pub fn state(&self, id: StateId) -> Result<&Arc<dyn FlowNodeState>, CoreError> {
        self.states
            .get(&id)
            .ok_or_else(|| CoreError::InvalidStateTransition(format!("Unknown state id {}", id)))
    }

    /// State following the instance's current one, given its category
    pub fn next_state(&self, instance: &FlowNodeInstance) -> Result<&Arc<dyn FlowNodeState>, CoreError> {
        if instance.terminal {
            return Err(CoreError::InvalidStateTransition(format!(
                "Flow node {} is already in terminal state {}",
                instance.id, instance.state_name
            )));
        }

        let next = match instance.state_category {
            StateCategory::Aborting if instance.state_id == StateId::ABORTING => StateId::ABORTED,
            StateCategory::Aborting => StateId::ABORTING,
            StateCategory::Cancelling if instance.state_id == StateId::CANCELLING => {
                StateId::CANCELLED
            }
            StateCategory::Cancelling => StateId::CANCELLING,
            StateCategory::Normal => {
                let chain = normal_chain(instance.node_type);
                chain
                    .iter()
                    .position(|id| *id == instance.state_id)
                    .and_then(|pos| chain.get(pos + 1))
                    .copied()
                    .ok_or_else(|| {
                        CoreError::InvalidStateTransition(format!(
                            "No state follows {} for {:?} {}",
                            instance.state_name, instance.node_type, instance.id
                        ))
                    })?
            }
        };

        self.state(next)
    }
}

fn normal_chain(node_type: FlowNodeType) -> &'static [StateId] {
    match node_type {
        FlowNodeType::StartEvent | FlowNodeType::EndEvent | FlowNodeType::ParallelGateway => {
            &[StateId::INITIALIZING, StateId::COMPLETED]
        }
        FlowNodeType::AutomaticTask => &[
            StateId::INITIALIZING,
            StateId::EXECUTING,
            StateId::COMPLETED,
        ],
        FlowNodeType::UserTask => &[
            StateId::INITIALIZING,
            StateId::READY,
            StateId::EXECUTING,
            StateId::COMPLETED,
        ],
        FlowNodeType::BoundaryEvent => &[
            StateId::INITIALIZING,
            StateId::WAITING,
            StateId::EXECUTING_BOUNDARY,
            StateId::COMPLETED,
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::activity_instance_service::RecorderActivityInstanceService;
    use crate::application::token_ledger::TokenLedger;
    use crate::domain::flow_node_instance::LogicalGroup;
    use crate::domain::process_instance::{FlowNodeInstanceId, ProcessDefinitionId, ProcessInstanceId};
    use pretty_assertions::assert_eq;

    fn registry() -> StateRegistry {
        StateRegistry::new(
            Arc::new(TokenLedger::new()),
            Arc::new(RecorderActivityInstanceService::new()),
        )
    }

    fn node(node_type: FlowNodeType) -> FlowNodeInstance {
        FlowNodeInstance::new(
            FlowNodeInstanceId(5),
            "node",
            node_type,
            LogicalGroup {
                process_definition_id: ProcessDefinitionId(1),
                root_process_instance_id: ProcessInstanceId(2),
                parent_activity_instance_id: None,
                parent_process_instance_id: ProcessInstanceId(2),
            },
            Some(2),
        )
    }

    fn walk(registry: &StateRegistry, mut instance: FlowNodeInstance) -> Vec<u32> {
        let mut visited = vec![instance.state_id.0];
        while !instance.terminal {
            let next = registry.next_state(&instance).unwrap();
            instance.enter_state(next.id(), next.name(), next.is_stable(), next.is_terminal());
            visited.push(instance.state_id.0);
        }
        visited
    }

    #[test]
    fn test_normal_chains() {
        let registry = registry();

        assert_eq!(walk(&registry, node(FlowNodeType::UserTask)), vec![0, 4, 1, 2]);
        assert_eq!(walk(&registry, node(FlowNodeType::AutomaticTask)), vec![0, 1, 2]);
        assert_eq!(walk(&registry, node(FlowNodeType::BoundaryEvent)), vec![0, 10, 65, 2]);
        assert_eq!(walk(&registry, node(FlowNodeType::ParallelGateway)), vec![0, 2]);
        assert_eq!(walk(&registry, node(FlowNodeType::EndEvent)), vec![0, 2]);
    }

    #[test]
    fn test_unwinding_chains_follow_category() {
        let registry = registry();

        let mut aborting = node(FlowNodeType::UserTask);
        aborting.enter_state(StateId::READY, "ready", true, false);
        aborting.set_state_category(StateCategory::Aborting).unwrap();
        assert_eq!(walk(&registry, aborting), vec![4, 13, 16]);

        let mut cancelling = node(FlowNodeType::BoundaryEvent);
        cancelling.enter_state(StateId::WAITING, "waiting", true, false);
        cancelling.set_state_category(StateCategory::Cancelling).unwrap();
        assert_eq!(walk(&registry, cancelling), vec![10, 14, 15]);
    }

    #[test]
    fn test_state_classification() {
        let registry = registry();
        let expectations = [
            (StateId::INITIALIZING, "initializing", StateCategory::Normal, false, false),
            (StateId::READY, "ready", StateCategory::Normal, true, false),
            (StateId::EXECUTING, "executing", StateCategory::Normal, false, false),
            (StateId::WAITING, "waiting", StateCategory::Normal, true, false),
            (StateId::EXECUTING_BOUNDARY, "executing", StateCategory::Normal, false, false),
            (StateId::COMPLETED, "completed", StateCategory::Normal, false, true),
            (StateId::FAILED, "failed", StateCategory::Normal, true, false),
            (StateId::ABORTING, "aborting", StateCategory::Aborting, false, false),
            (StateId::ABORTED, "aborted", StateCategory::Aborting, false, true),
            (StateId::CANCELLING, "cancelling", StateCategory::Cancelling, false, false),
            (StateId::CANCELLED, "cancelled", StateCategory::Cancelling, false, true),
        ];

        for (id, name, category, stable, terminal) in expectations {
            let state = registry.state(id).unwrap();
            assert_eq!(state.name(), name);
            assert_eq!(state.state_category(), category);
            assert_eq!(state.is_stable(), stable, "stable flag of {}", name);
            assert_eq!(state.is_terminal(), terminal, "terminal flag of {}", name);
            assert_eq!(state.is_interrupting(), category != StateCategory::Normal);
        }
    }

    #[test]
    fn test_no_state_after_terminal_or_failed() {
        let registry = registry();

        let mut completed = node(FlowNodeType::AutomaticTask);
        completed.enter_state(StateId::COMPLETED, "completed", false, true);
        assert!(registry.next_state(&completed).is_err());

        let mut failed = node(FlowNodeType::AutomaticTask);
        failed.enter_state(StateId::FAILED, "failed", true, false);
        assert!(registry.next_state(&failed).is_err());
    }
}
