//! Process definitions shared by the scenario tests

use std::time::Duration;

use tokenflow_core::{CoreError, ProcessDefinition, ProcessDefinitionBuilder};

/// Activity both timers are attached to
pub const TASK_WITH_BOUNDARY: &str = "taskWithBoundary";
/// Interrupting timer boundary event
pub const INTERRUPT_TIMER: &str = "interruptTimer";
/// Non-interrupting timer boundary event
pub const NON_INTERRUPT_TIMER: &str = "nonInterruptTimer";
/// User task on the interrupting exception flow
pub const AFTER_INTERRUPT: &str = "afterInterrupt";
/// User task on the non-interrupting exception flow
pub const AFTER_NON_INTERRUPT: &str = "afterNonInterrupt";

/// A user task watched by an interrupting and a non-interrupting timer,
/// each leading to its own user task.
pub fn timer_boundary_process(
    id: u64,
    interrupt_after: Duration,
    non_interrupt_after: Duration,
) -> Result<ProcessDefinition, CoreError> {
    ProcessDefinitionBuilder::new(id, "timer-boundaries", "1.0")
        .start_event("start")
        .user_task(TASK_WITH_BOUNDARY)
        .timer_boundary_event(INTERRUPT_TIMER, TASK_WITH_BOUNDARY, true, interrupt_after)
        .timer_boundary_event(NON_INTERRUPT_TIMER, TASK_WITH_BOUNDARY, false, non_interrupt_after)
        .user_task(AFTER_INTERRUPT)
        .user_task(AFTER_NON_INTERRUPT)
        .end_event("end")
        .end_event("interruptEnd")
        .end_event("nonInterruptEnd")
        .transition("start", TASK_WITH_BOUNDARY)
        .transition(TASK_WITH_BOUNDARY, "end")
        .transition(INTERRUPT_TIMER, AFTER_INTERRUPT)
        .transition(AFTER_INTERRUPT, "interruptEnd")
        .transition(NON_INTERRUPT_TIMER, AFTER_NON_INTERRUPT)
        .transition(AFTER_NON_INTERRUPT, "nonInterruptEnd")
        .build()
}

/// start -> user task -> end
pub fn user_task_process(id: u64, task: &str) -> Result<ProcessDefinition, CoreError> {
    ProcessDefinitionBuilder::new(id, "single-task", "1.0")
        .start_event("start")
        .user_task(task)
        .end_event("end")
        .transition("start", task)
        .transition(task, "end")
        .build()
}

/// A fork into two user tasks, `left` and `right`, joined before the end
pub fn parallel_process(id: u64) -> Result<ProcessDefinition, CoreError> {
    ProcessDefinitionBuilder::new(id, "fork-join", "1.0")
        .start_event("start")
        .parallel_gateway("fork")
        .user_task("left")
        .user_task("right")
        .parallel_gateway("join")
        .end_event("end")
        .transition("start", "fork")
        .transition("fork", "left")
        .transition("fork", "right")
        .transition("left", "join")
        .transition("right", "join")
        .transition("join", "end")
        .build()
}

/// start -> automatic steps -> end
pub fn automatic_process(id: u64, steps: usize) -> Result<ProcessDefinition, CoreError> {
    let names: Vec<String> = (1..=steps).map(|i| format!("step{i}")).collect();
    let mut builder = ProcessDefinitionBuilder::new(id, "automatic", "1.0")
        .start_event("start")
        .end_event("end");
    let mut previous = "start".to_string();
    for name in &names {
        builder = builder.automatic_task(name).transition(&previous, name);
        previous = name.clone();
    }
    builder.transition(&previous, "end").build()
}
