use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::process_instance::ProcessInstanceId;

/// Event types carried by recorder mutations
pub mod event_types {
    /// A process instance was created
    pub const PROCESSINSTANCE_CREATED: &str = "PROCESSINSTANCE_CREATED";
    /// A process instance changed state or was touched by a flow node transition
    pub const PROCESSINSTANCE_UPDATED: &str = "PROCESSINSTANCE_UPDATED";
    /// A process instance was removed from the live records
    pub const PROCESSINSTANCE_DELETED: &str = "PROCESSINSTANCE_DELETED";
    /// A flow node instance was created
    pub const FLOWNODE_CREATED: &str = "FLOWNODE_CREATED";
    /// A flow node instance entered a new state
    pub const FLOWNODE_STATE_UPDATED: &str = "FLOWNODE_STATE_UPDATED";
    /// A flow node instance changed state category
    pub const FLOWNODE_STATE_CATEGORY_UPDATED: &str = "FLOWNODE_STATE_CATEGORY_UPDATED";
    /// A boundary event interrupted an activity
    pub const FLOWNODE_ABORTED_BY_BOUNDARY: &str = "FLOWNODE_ABORTED_BY_BOUNDARY";
    /// A joining gateway received a hit
    pub const GATEWAY_HIT: &str = "GATEWAY_HIT";
    /// A flow node instance was removed from the live records
    pub const FLOWNODE_DELETED: &str = "FLOWNODE_DELETED";
    /// A token was created
    pub const TOKEN_CREATED: &str = "TOKEN_CREATED";
    /// A token was consumed
    pub const TOKEN_DELETED: &str = "TOKEN_DELETED";
    /// A record was copied into the archive
    pub const ARCHIVED: &str = "ARCHIVED";
    /// An archived record was purged
    pub const ARCHIVE_DELETED: &str = "ARCHIVE_DELETED";
}

/// Event attached to every insert, update and delete handed to the recorder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEvent {
    /// One of [`event_types`]
    pub event_type: String,

    /// Process instance the mutated record belongs to
    pub process_instance_id: Option<ProcessInstanceId>,

    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

impl RecordEvent {
    /// Create an event of the given type
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            process_instance_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the owning process instance
    pub fn for_process_instance(mut self, process_instance_id: ProcessInstanceId) -> Self {
        self.process_instance_id = Some(process_instance_id);
        self
    }
}
