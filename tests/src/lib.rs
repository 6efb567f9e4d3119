//! Tokenflow scenario tests
//!
//! The suites live under `tests/`:
//!
//! - `timer_boundaries`: interrupting and non-interrupting timers racing on one task
//! - `lifecycle`: start, user tasks, cancellation, deletion, tenant sessions
//! - `failures`: injected commit failures, retries and incidents
//! - `recovery`: restarting the engine over the same storage
