/// Process instance aggregate and identifiers
pub mod process_instance;

/// Flow node instances and state categories
pub mod flow_node_instance;

/// Tokens
pub mod token;

/// Process definition execution model
pub mod process_definition;

/// Record events emitted by recorder mutations
pub mod events;

/// Collaborator traits (persistence, definitions, incidents)
pub mod repository;
