pub mod manager;
pub mod types;
pub mod utils;

// Re-export all state types and functions for convenience
pub use manager::StateManager;
pub use types::InstanceRecord;
pub use utils::{generate_instance_name, truncate_id, validate_name};
