pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod hypervisor;
pub mod image;
pub mod instance;
pub mod lock;
pub mod paths;
pub mod readiness;
pub mod state;
pub mod utils;

// Re-export core types for convenience
pub use error::{Error, HypervisorError, Result};
pub use image::ImageDescriptor;
pub use instance::{Instance, Stage};
pub use lock::{LockManager, LockedMachine};
