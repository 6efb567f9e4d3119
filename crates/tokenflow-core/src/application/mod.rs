/// Token ledger
pub mod token_ledger;

/// Activity instance reads and category changes
pub mod activity_instance_service;

/// Runtime API for external systems
pub mod runtime_interface;
