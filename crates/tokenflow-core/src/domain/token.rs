use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::process_instance::ProcessInstanceId;

/// Value object: Token ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId(pub u64);

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One unit of control flow.
///
/// `ref_id` names the execution branch (a process instance or flow node
/// instance id) and `parent_ref_id` the branch it was forked from. Several
/// live tokens may share a `ref_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Unique identifier
    pub id: TokenId,
    /// Branch reference
    pub ref_id: u64,
    /// Branch this one was forked from; `None` for roots
    pub parent_ref_id: Option<u64>,
    /// Owning process instance
    pub process_instance_id: ProcessInstanceId,
}

/// A consumed token, kept so ancestry stays walkable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedToken {
    /// Token as it was when consumed
    pub token: Token,
    /// Consumption timestamp
    pub consumed_at: DateTime<Utc>,
}

impl From<Token> for ArchivedToken {
    fn from(token: Token) -> Self {
        Self {
            token,
            consumed_at: Utc::now(),
        }
    }
}
