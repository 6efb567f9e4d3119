use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::process_instance::ProcessDefinitionId;
use crate::CoreError;

/// Kind of a flow node, without its configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowNodeType {
    /// Entry point of the process
    StartEvent,
    /// Consumes the token reaching it
    EndEvent,
    /// Waits in `ready` until a user executes it
    UserTask,
    /// Executes without waiting
    AutomaticTask,
    /// Forks on several outgoing transitions, joins on several incoming ones
    ParallelGateway,
    /// Timer attached to a task
    BoundaryEvent,
}

impl FlowNodeType {
    /// Tasks are the only nodes boundary events can attach to
    #[inline]
    pub fn is_activity(self) -> bool {
        matches!(self, FlowNodeType::UserTask | FlowNodeType::AutomaticTask)
    }
}

/// Kind of a flow node with its configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowNodeKind {
    /// Entry point of the process
    StartEvent,
    /// Consumes the token reaching it
    EndEvent,
    /// Waits in `ready` until a user executes it
    UserTask,
    /// Executes without waiting
    AutomaticTask,
    /// Forks and joins branches
    ParallelGateway,
    /// Timer attached to a task
    BoundaryEvent {
        /// Name of the task the event watches
        attached_to: String,
        /// Abort the task when the timer fires
        interrupting: bool,
        /// Delay after the task starts
        timer_ms: u64,
    },
}

impl FlowNodeKind {
    /// Configuration-free kind
    pub fn node_type(&self) -> FlowNodeType {
        match self {
            FlowNodeKind::StartEvent => FlowNodeType::StartEvent,
            FlowNodeKind::EndEvent => FlowNodeType::EndEvent,
            FlowNodeKind::UserTask => FlowNodeType::UserTask,
            FlowNodeKind::AutomaticTask => FlowNodeType::AutomaticTask,
            FlowNodeKind::ParallelGateway => FlowNodeType::ParallelGateway,
            FlowNodeKind::BoundaryEvent { .. } => FlowNodeType::BoundaryEvent,
        }
    }
}

/// Represents a node of the process graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowNodeDefinition {
    /// Unique name within the process
    pub name: String,
    /// Kind and configuration
    pub kind: FlowNodeKind,
}

impl FlowNodeDefinition {
    /// Timer delay of a boundary event
    pub fn timer(&self) -> Option<Duration> {
        match &self.kind {
            FlowNodeKind::BoundaryEvent { timer_ms, .. } => Some(Duration::from_millis(*timer_ms)),
            _ => None,
        }
    }
}

/// Represents a sequence flow between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionDefinition {
    /// Source node name
    pub source: String,
    /// Target node name
    pub target: String,
}

/// The execution model of a deployed process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// ID of the process definition
    pub id: ProcessDefinitionId,

    /// Human-readable name of the process
    pub name: String,

    /// The process version
    pub version: String,

    /// Nodes of the graph
    pub flow_nodes: Vec<FlowNodeDefinition>,

    /// Sequence flows of the graph
    pub transitions: Vec<TransitionDefinition>,
}

impl ProcessDefinition {
    /// Find a node by name
    pub fn flow_node(&self, name: &str) -> Option<&FlowNodeDefinition> {
        self.flow_nodes.iter().find(|node| node.name == name)
    }

    /// Find a node by name or fail
    pub fn require_flow_node(&self, name: &str) -> Result<&FlowNodeDefinition, CoreError> {
        self.flow_node(name).ok_or_else(|| {
            CoreError::ValidationError(format!(
                "Process definition {} has no flow node named {}",
                self.id, name
            ))
        })
    }

    /// The unique start event
    pub fn start_event(&self) -> Result<&FlowNodeDefinition, CoreError> {
        self.flow_nodes
            .iter()
            .find(|node| node.kind == FlowNodeKind::StartEvent)
            .ok_or_else(|| {
                CoreError::ValidationError(format!(
                    "Process definition {} has no start event",
                    self.id
                ))
            })
    }

    /// Targets of the transitions leaving `name`
    pub fn outgoing(&self, name: &str) -> Vec<&FlowNodeDefinition> {
        self.transitions
            .iter()
            .filter(|transition| transition.source == name)
            .filter_map(|transition| self.flow_node(&transition.target))
            .collect()
    }

    /// Number of transitions entering `name`
    pub fn incoming_count(&self, name: &str) -> usize {
        self.transitions
            .iter()
            .filter(|transition| transition.target == name)
            .count()
    }

    /// Boundary events attached to the task `activity`
    pub fn boundary_events_of(&self, activity: &str) -> Vec<&FlowNodeDefinition> {
        self.flow_nodes
            .iter()
            .filter(|node| {
                matches!(&node.kind, FlowNodeKind::BoundaryEvent { attached_to, .. } if attached_to == activity)
            })
            .collect()
    }

    /// Validate the process definition
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.flow_nodes.is_empty() {
            return Err(CoreError::ValidationError(
                "Process must have at least one flow node".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for node in &self.flow_nodes {
            if !names.insert(node.name.as_str()) {
                return Err(CoreError::ValidationError(format!(
                    "Duplicate flow node name: {}",
                    node.name
                )));
            }
        }

        let start_events = self
            .flow_nodes
            .iter()
            .filter(|node| node.kind == FlowNodeKind::StartEvent)
            .count();
        if start_events != 1 {
            return Err(CoreError::ValidationError(format!(
                "Process must have exactly one start event, found {}",
                start_events
            )));
        }

        for transition in &self.transitions {
            for end in [&transition.source, &transition.target] {
                if !names.contains(end.as_str()) {
                    return Err(CoreError::ValidationError(format!(
                        "Transition {} -> {} references non-existent flow node: {}",
                        transition.source, transition.target, end
                    )));
                }
            }
        }

        for node in &self.flow_nodes {
            if let FlowNodeKind::BoundaryEvent { attached_to, .. } = &node.kind {
                let attached = self.flow_node(attached_to).ok_or_else(|| {
                    CoreError::ValidationError(format!(
                        "Boundary event {} is attached to non-existent flow node: {}",
                        node.name, attached_to
                    ))
                })?;
                if !attached.kind.node_type().is_activity() {
                    return Err(CoreError::ValidationError(format!(
                        "Boundary event {} must be attached to a task, not {}",
                        node.name, attached.name
                    )));
                }
                if self.incoming_count(&node.name) != 0 {
                    return Err(CoreError::ValidationError(format!(
                        "Boundary event {} cannot have incoming transitions",
                        node.name
                    )));
                }
                if self.outgoing(&node.name).len() != 1 {
                    return Err(CoreError::ValidationError(format!(
                        "Boundary event {} must have exactly one outgoing transition",
                        node.name
                    )));
                }
            }
        }

        self.check_for_cycles()?;

        Ok(())
    }

    /// Check for cycles in the transition graph
    fn check_for_cycles(&self) -> Result<(), CoreError> {
        let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
        for transition in &self.transitions {
            successors
                .entry(transition.source.as_str())
                .or_default()
                .push(transition.target.as_str());
        }

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        for node in &self.flow_nodes {
            if Self::is_cyclic(node.name.as_str(), &successors, &mut visited, &mut rec_stack) {
                return Err(CoreError::ValidationError(format!(
                    "Cycle detected in transitions involving flow node: {}",
                    node.name
                )));
            }
        }

        Ok(())
    }

    fn is_cyclic<'a>(
        name: &'a str,
        successors: &HashMap<&'a str, Vec<&'a str>>,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
    ) -> bool {
        if visited.insert(name) {
            rec_stack.insert(name);

            if let Some(targets) = successors.get(name) {
                for &target in targets {
                    if rec_stack.contains(target)
                        || (!visited.contains(target)
                            && Self::is_cyclic(target, successors, visited, rec_stack))
                    {
                        return true;
                    }
                }
            }
        }

        rec_stack.remove(name);
        false
    }
}

/// Assembles definitions for tests and fixtures
#[derive(Debug, Clone)]
pub struct ProcessDefinitionBuilder {
    definition: ProcessDefinition,
}

impl ProcessDefinitionBuilder {
    /// Start a definition
    pub fn new(id: u64, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            definition: ProcessDefinition {
                id: ProcessDefinitionId(id),
                name: name.into(),
                version: version.into(),
                flow_nodes: Vec::new(),
                transitions: Vec::new(),
            },
        }
    }

    fn node(mut self, name: &str, kind: FlowNodeKind) -> Self {
        self.definition.flow_nodes.push(FlowNodeDefinition {
            name: name.to_string(),
            kind,
        });
        self
    }

    /// Add the start event
    pub fn start_event(self, name: &str) -> Self {
        self.node(name, FlowNodeKind::StartEvent)
    }

    /// Add an end event
    pub fn end_event(self, name: &str) -> Self {
        self.node(name, FlowNodeKind::EndEvent)
    }

    /// Add a user task
    pub fn user_task(self, name: &str) -> Self {
        self.node(name, FlowNodeKind::UserTask)
    }

    /// Add an automatic task
    pub fn automatic_task(self, name: &str) -> Self {
        self.node(name, FlowNodeKind::AutomaticTask)
    }

    /// Add a parallel gateway
    pub fn parallel_gateway(self, name: &str) -> Self {
        self.node(name, FlowNodeKind::ParallelGateway)
    }

    /// Attach a timer boundary event to `attached_to`
    pub fn timer_boundary_event(
        self,
        name: &str,
        attached_to: &str,
        interrupting: bool,
        timer: Duration,
    ) -> Self {
        self.node(
            name,
            FlowNodeKind::BoundaryEvent {
                attached_to: attached_to.to_string(),
                interrupting,
                timer_ms: timer.as_millis() as u64,
            },
        )
    }

    /// Add a sequence flow
    pub fn transition(mut self, source: &str, target: &str) -> Self {
        self.definition.transitions.push(TransitionDefinition {
            source: source.to_string(),
            target: target.to_string(),
        });
        self
    }

    /// Validate and return the definition
    pub fn build(self) -> Result<ProcessDefinition, CoreError> {
        self.definition.validate()?;
        Ok(self.definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boundary_process() -> ProcessDefinitionBuilder {
        ProcessDefinitionBuilder::new(1, "timers", "1.0")
            .start_event("start")
            .user_task("taskWithBoundary")
            .timer_boundary_event("interruptTimer", "taskWithBoundary", true, Duration::from_millis(100))
            .user_task("exceptionTask")
            .end_event("end")
            .transition("start", "taskWithBoundary")
            .transition("taskWithBoundary", "end")
            .transition("interruptTimer", "exceptionTask")
    }

    #[test]
    fn test_valid_definition_builds() {
        let definition = boundary_process().build().unwrap();

        assert_eq!(definition.start_event().unwrap().name, "start");
        assert_eq!(definition.boundary_events_of("taskWithBoundary").len(), 1);
        assert_eq!(
            definition.flow_node("interruptTimer").unwrap().timer(),
            Some(Duration::from_millis(100))
        );
        assert_eq!(definition.outgoing("start")[0].name, "taskWithBoundary");
        assert_eq!(definition.incoming_count("end"), 1);
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let result = boundary_process().user_task("exceptionTask").build();
        assert!(matches!(result, Err(CoreError::ValidationError(msg)) if msg.contains("Duplicate")));
    }

    #[test]
    fn test_boundary_without_outgoing_is_rejected() {
        let result = ProcessDefinitionBuilder::new(1, "p", "1.0")
            .start_event("start")
            .user_task("task")
            .timer_boundary_event("timer", "task", false, Duration::from_millis(5))
            .transition("start", "task")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_boundary_on_gateway_is_rejected() {
        let result = ProcessDefinitionBuilder::new(1, "p", "1.0")
            .start_event("start")
            .parallel_gateway("gw")
            .user_task("after")
            .timer_boundary_event("timer", "gw", true, Duration::from_millis(5))
            .transition("start", "gw")
            .transition("timer", "after")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_cycles_are_rejected() {
        let result = ProcessDefinitionBuilder::new(1, "p", "1.0")
            .start_event("start")
            .automatic_task("a")
            .automatic_task("b")
            .transition("start", "a")
            .transition("a", "b")
            .transition("b", "a")
            .build();
        assert!(matches!(result, Err(CoreError::ValidationError(msg)) if msg.contains("Cycle")));
    }

    #[test]
    fn test_exactly_one_start_event() {
        let result = ProcessDefinitionBuilder::new(1, "p", "1.0")
            .start_event("s1")
            .start_event("s2")
            .build();
        assert!(result.is_err());
    }
}
