//! Error kinds for the sandbox lifecycle.
//!
//! The core returns [`Error`]; commands wrap it in `anyhow` with context.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::hypervisor::LockState;
use crate::instance::Operation;
use crate::readiness::console::Transcript;

/// Errors reported by a hypervisor backend.
#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    /// The addressed object (device, machine, medium) does not exist.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    #[error("{operation} failed: {message}")]
    Provider {
        operation: &'static str,
        message: String,
    },

    #[error("{operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: io::Error,
    },
}

impl HypervisorError {
    pub fn provider(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Provider {
            operation,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported architecture: {0:?}")]
    UnsupportedArchitecture(String),

    #[error("unsupported release: {0:?}")]
    UnsupportedRelease(String),

    #[error("write lock on machine {machine} unavailable")]
    LockUnavailable {
        machine: String,
        #[source]
        source: HypervisorError,
    },

    #[error(
        "machine {machine} did not reach lock state {expected} within {waited:?} (last seen: {observed})"
    )]
    LockWaitTimeout {
        machine: String,
        expected: LockState,
        observed: String,
        waited: Duration,
    },

    #[error(
        "reading from console `{}` timed out after {:?}\nHere is the output so far:\n{transcript}",
        .path.display(),
        .timeout
    )]
    ReadTimeout {
        path: PathBuf,
        timeout: Duration,
        transcript: Transcript,
    },

    #[error(
        "console `{}` closed before boot completed\nHere is the output so far:\n{transcript}",
        .path.display()
    )]
    ConsoleClosed { path: PathBuf, transcript: Transcript },

    #[error("console `{}`: {source}", .path.display())]
    Console {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("interrupted during {operation}")]
    Interrupted { operation: Operation },

    #[error("{operation} did not complete within {timeout:?}")]
    OperationTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("instance {0} has no machine (create() has not run)")]
    NotCreated(String),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),
}

impl Error {
    /// True for the one hypervisor condition destroy() tolerates.
    pub fn is_object_not_found(&self) -> bool {
        matches!(self, Error::Hypervisor(HypervisorError::ObjectNotFound(_)))
    }

    /// Console output captured before the failure, if any.
    pub fn transcript(&self) -> Option<&Transcript> {
        match self {
            Error::ReadTimeout { transcript, .. } | Error::ConsoleClosed { transcript, .. } => {
                Some(transcript)
            }
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
