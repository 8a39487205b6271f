//! Readiness detection for booting guests.

pub mod console;

pub use console::{read_into, read_until, SignatureScanner, Transcript, DEFAULT_POLL_INTERVAL};
