//! Testing utilities for the Tokenflow engine.
//!
//! This crate provides process fixtures, an engine wired over in-memory
//! storage, polling assertions over the [`tokenflow_core::ProcessApi`], a
//! transaction service that injects commit failures, and a tracing setup
//! for tests.

pub mod assertions;
pub mod engine;
pub mod faults;
pub mod fixtures;

/// Re-export commonly used types for convenience
pub use mockall;

pub use assertions::{
    wait_for_flow_node_state, wait_for_incident, wait_for_process_state, wait_for_user_task,
    wait_until_idle, WaitError, DEFAULT_TIMEOUT,
};
pub use engine::{test_config, TestEngine};
pub use faults::FaultInjectingTransactionService;

/// Initialize tracing for tests; later calls are no-ops
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_test_writer()
        .try_init();
}
