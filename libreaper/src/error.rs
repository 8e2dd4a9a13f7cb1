//! Reaper error types.
//!
//! Each failure class of a reconciliation pass has its own [`thiserror`]
//! type so callers can tell a fatal inventory failure apart from a per-record
//! deletion failure. [`ReaperError`] wraps the two classes that abort a pass.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::types::InventorySource;

/// Failure to execute an external command.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
pub enum ExecutionError {
    /// The program could not be found in the execution context.
    #[error("{program}: binary not found")]
    MissingBinary {
        /// Program that was looked up.
        program: String,
    },

    /// The process could not be spawned for any other reason.
    #[error("failed to spawn `{command}`: {reason}")]
    Spawn {
        /// Rendered command line.
        command: String,
        /// OS-level failure.
        reason: String,
    },

    /// The process did not finish within the configured bound and was killed.
    #[error("`{command}` timed out after {after:?}")]
    TimedOut {
        /// Rendered command line.
        command: String,
        /// The timeout that elapsed.
        after: Duration,
    },

    /// The process exited with a status the caller does not tolerate.
    #[error("`{command}` exited with status {code}: {stderr}")]
    NonZeroExit {
        /// Rendered command line.
        command: String,
        /// Exit status.
        code: i32,
        /// Trimmed standard error.
        stderr: String,
    },

    /// The process was terminated by a signal.
    #[error("`{command}` was terminated by a signal")]
    Killed {
        /// Rendered command line.
        command: String,
    },
}

impl ExecutionError {
    /// Build an [`ExecutionError::Spawn`] from anything displayable.
    pub fn spawn<E: std::fmt::Display>(command: impl Into<String>, e: E) -> Self {
        Self::Spawn {
            command: command.into(),
            reason: e.to_string(),
        }
    }
}

/// One of the three inventories could not be gathered.
///
/// Always fatal to the pass: a partial or empty inventory must never be
/// diffed, since a falsely empty volume or claim list marks every record stale.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[error("{inventory} inventory unavailable: {reason}")]
pub struct InventoryError {
    /// Which inventory failed.
    pub inventory: InventorySource,
    /// Human-readable cause.
    pub reason: String,
}

impl InventoryError {
    pub fn new<E: std::fmt::Display>(inventory: InventorySource, e: E) -> Self {
        Self {
            inventory,
            reason: e.to_string(),
        }
    }
}

/// Deleting one stale iSCSI node record failed.
///
/// Recovered locally by the deletion loop and aggregated into the pass report.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[error("failed to delete node record {target_iqn} at {portal} ({volume_key}): {reason}")]
pub struct DeletionError {
    pub target_iqn: String,
    pub portal: String,
    pub volume_key: String,
    pub reason: ExecutionError,
}

/// Invalid or missing startup configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required option was not supplied.
    #[error("missing required option {0}")]
    Missing(&'static str),

    /// An option was supplied but could not be accepted.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Environment-style option name.
        key: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid<E: std::fmt::Display>(key: &'static str, e: E) -> Self {
        Self::Invalid {
            key,
            reason: e.to_string(),
        }
    }
}

/// Errors that abort a reconciliation pass before any deletion happens.
#[derive(Debug, Error)]
pub enum ReaperError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

impl ReaperError {
    /// Process exit status for a pass aborted by this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => crate::reconciler::EXIT_CONFIG_INVALID,
            Self::Inventory(_) => crate::reconciler::EXIT_INVENTORY_FAILED,
        }
    }
}
