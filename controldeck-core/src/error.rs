//! Error taxonomy for the plugin runtime.
//!
//! Only [`RegistryError::Storage`] is a host-level fault. Everything else is
//! scoped to a single source or module and must never affect another one.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plugin::types::Permission;

/// A source could not be scanned or fetched. Logged and skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("failed to read {path:?}: {message}")]
    Unreadable { path: PathBuf, message: String },

    #[error("remote repository {url} unavailable: {message}")]
    RemoteUnavailable { url: String, message: String },
}

/// Turning a descriptor into live instances failed. The module is not loaded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("invalid module source {origin}: {message}")]
    InvalidSource { origin: String, message: String },

    #[error("no usable service definitions in {origin}")]
    NoModulesFound { origin: String },

    #[error("module '{module}' requires the '{permission}' permission, which host policy denies")]
    PermissionDenied {
        module: String,
        permission: Permission,
    },

    #[error("module '{module}' failed to initialise: {cause}")]
    InitFailed { module: String, cause: String },

    #[error("service id '{id}' is already provided by '{existing}'")]
    DuplicateId { id: String, existing: String },

    #[error("loading '{module}' timed out after {timeout:?}")]
    TimedOut { module: String, timeout: Duration },
}

/// A status check did not produce a result. Recorded in the snapshot, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckError {
    #[error("status check timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    #[error("status check failed: {message}")]
    Failed { message: String },

    #[error("status check panicked: {message}")]
    Panicked { message: String },
}

impl CheckError {
    pub fn timed_out(timeout: Duration) -> Self {
        Self::TimedOut {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CheckError::TimedOut { .. })
    }
}

/// A lifecycle action was refused or did not complete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("an action for '{0}' is already in flight")]
    Busy(String),

    #[error("no loaded module with id '{0}'")]
    NotFound(String),

    #[error("module '{0}' is disabled")]
    Disabled(String),

    #[error("module '{0}' cannot be removed in its current state")]
    NotRemovable(String),

    #[error("{action} of '{id}' timed out after {timeout:?}")]
    TimedOut {
        id: String,
        action: String,
        timeout: Duration,
    },

    #[error("{action} of '{id}' failed: {cause}")]
    OperationFailed {
        id: String,
        action: String,
        cause: String,
    },
}

/// Lifecycle registry failures.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("module '{0}' is not installed")]
    NotInstalled(String),

    #[error("module '{id}' cannot be removed: {reason}")]
    RemoveRejected { id: String, reason: String },

    #[error("lifecycle record for '{id}' is unreadable: {message}")]
    CorruptRecord { id: String, message: String },

    #[error(transparent)]
    Load(#[from] LoadError),

    /// Persisted state is unavailable. The surrounding application decides
    /// whether to retry or shut down.
    #[error("lifecycle storage failure: {0:#}")]
    Storage(anyhow::Error),
}

impl RegistryError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RegistryError::Storage(_))
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
