//! # Error types raised by the shim.
//!
//! [`ShimError`] covers the two recoverable error classes: configuration
//! errors detected before any PMIx traffic, and PMIx operations that failed
//! with a status. Fatal invariant violations (missing namespace, malformed
//! proc table) do not surface here; they print, finalize and exit the
//! process via the context's fatal path.

use thiserror::Error;

use crate::pmix::Status;

/// Errors returned to the embedder; the conventional process exit code for
/// any of these is 1.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ShimError {
    /// Attach mode was requested without a usable target PID.
    #[error("invalid connect pid {pid}")]
    InvalidTargetPid {
        /// The rejected PID.
        pid: u32,
    },

    /// A launch mode was requested with an empty launcher command line.
    #[error("no launcher command line provided")]
    MissingLauncherCommand,

    /// A PMIx operation failed.
    #[error("{op} failed: {status}")]
    Pmix {
        /// The operation, named after the underlying library call.
        op: &'static str,
        /// Status reported by the client library.
        status: Status,
    },

    /// Registering an event handler failed or was cut short by launcher
    /// termination.
    #[error("registering {name} handler failed: {status}")]
    Registration {
        /// Handler name as passed in the registration metadata.
        name: &'static str,
        /// Status delivered by the registration completion.
        status: Status,
    },

    /// A step needed a process identity that has not been learned yet.
    #[error("{which} identity is not known yet")]
    MissingIdentity {
        /// Which identity was missing: "tool", "launcher" or "application".
        which: &'static str,
    },

    /// Installing a signal or exit handler failed.
    #[error("failed to install {what} handler")]
    Install {
        /// The handler kind that could not be installed.
        what: &'static str,
    },
}

impl ShimError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ShimError::InvalidTargetPid { .. } => "invalid_target_pid",
            ShimError::MissingLauncherCommand => "missing_launcher_command",
            ShimError::Pmix { .. } => "pmix_operation_failed",
            ShimError::Registration { .. } => "registration_failed",
            ShimError::MissingIdentity { .. } => "missing_identity",
            ShimError::Install { .. } => "install_failed",
        }
    }

    /// True for errors raised before any PMIx call, which therefore need no
    /// cleanup.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ShimError::InvalidTargetPid { .. } | ShimError::MissingLauncherCommand
        )
    }
}
