use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Value object: Job ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Jobs the engine knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    /// Resume a waiting timer boundary event
    TriggerBoundaryTimer,
}

/// What to run when a trigger fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Unique job name
    pub job_name: String,
    /// Human-readable description
    pub description: String,
    /// Job implementation
    pub kind: JobKind,
    /// Never run two fires of this job at the same time
    pub disallow_concurrent_execution: bool,
}

/// One named argument of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameter {
    /// Parameter name
    pub key: String,
    /// Parameter value
    pub value: serde_json::Value,
}

impl JobParameter {
    /// Create a parameter
    pub fn new(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// What to do with a trigger whose fire time passed while the executor was down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MisfirePolicy {
    /// Fire as soon as the executor runs again
    FireNow,
    /// Drop the fire
    Ignore,
}

/// When a job fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Trigger name, equal to the job name for one-shot triggers
    pub name: String,
    /// Earliest fire time
    pub start_at: DateTime<Utc>,
    /// Behaviour on a missed fire time
    pub misfire_policy: MisfirePolicy,
}

impl Trigger {
    /// Fire once, `delay` from now
    pub fn one_shot(name: impl Into<String>, delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            name: name.into(),
            start_at: Utc::now() + delay,
            misfire_policy: MisfirePolicy::FireNow,
        }
    }
}

/// A persisted job descriptor with its parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Job identifier
    pub id: JobId,
    /// What to run
    pub descriptor: JobDescriptor,
    /// Arguments
    pub parameters: Vec<JobParameter>,
}

impl ScheduledJob {
    /// Parameter value by key
    pub fn parameter(&self, key: &str) -> Option<&serde_json::Value> {
        self.parameters
            .iter()
            .find(|parameter| parameter.key == key)
            .map(|parameter| &parameter.value)
    }
}

/// A trigger that fired, handed from the executor to the engine.
///
/// The engine answers on `ack`; an error or a dropped sender marks the
/// trigger erroneous so it can be rescheduled.
#[derive(Debug)]
pub struct FiredJob {
    /// Job to run
    pub job_id: JobId,
    /// Job name
    pub job_name: String,
    /// Outcome of the run
    pub ack: oneshot::Sender<Result<(), String>>,
}
