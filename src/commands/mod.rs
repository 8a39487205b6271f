pub mod completions;
pub mod config;
pub mod console;
pub mod destroy;
pub mod ls;
pub mod run;

// Re-export command functions
pub use completions::cmd_completions;
pub use config::cmd_config;
pub use console::cmd_console;
pub use destroy::cmd_destroy;
pub use ls::cmd_ls;
pub use run::cmd_run;
