//! Typed errors for the kernel contracts.
//!
//! Application-level flow uses `anyhow`; these enums cover the places where
//! callers need to match on the failure.

use thiserror::Error;

use crate::kernel::ModuleId;

/// Dependency graph errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Adding the edge would close a cycle among HARD edges.
    #[error("hard dependency {source_module} -> {target} would close a cycle")]
    HardCycle {
        source_module: ModuleId,
        target: ModuleId,
    },

    /// An edge may not point back at its own source.
    #[error("module {0} cannot depend on itself")]
    SelfDependency(ModuleId),

    #[error("module {0} is not part of the graph")]
    UnknownModule(ModuleId),
}

/// Lifecycle manager errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    /// Fatal configuration error detected before any module starts.
    #[error("configuration error in module '{module}': {source}")]
    Configuration {
        module: String,
        #[source]
        source: GraphError,
    },

    #[error("module '{0}' is already registered")]
    Duplicate(String),

    #[error("no module named '{0}'")]
    UnknownModule(String),

    #[error("module '{0}' is not running")]
    NotRunning(String),

    #[error("module '{name}' could not be loaded: {reason}")]
    LoadFailed { name: String, reason: String },
}

/// Subscription pattern errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Inhibition lock errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("no inhibition lock held by '{0}'")]
    UnknownKey(String),

    #[error("no inhibition lock with cookie {0}")]
    UnknownCookie(u32),
}
