//! Error types for the Storage Module Operator
//!
//! Provides structured error types for every stage of a reconcile pass:
//! manifest resolution, module injection, synchronization, cleanup and
//! status projection.

use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Failed to apply {kind}/{name}: {reason}")]
    ApplyFailed {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("Failed to delete {kind}/{name}: {reason}")]
    DeleteFailed {
        kind: String,
        name: String,
        reason: String,
    },

    // =========================================================================
    // Manifest Errors
    // =========================================================================
    #[error("Configuration not found: {path}")]
    ConfigNotFound { path: String },

    #[error("Template render error in {template}: {reason}")]
    TemplateRender { template: String, reason: String },

    #[error("Unsupported object kind in {template}: {kind}")]
    UnsupportedKind { template: String, kind: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported driver: {driver} {version}")]
    UnsupportedDriver { driver: String, version: String },

    #[error("Unsupported module {module} {version} for driver {driver}")]
    UnsupportedModule {
        module: String,
        version: String,
        driver: String,
    },

    #[error("Upgrade of {component} from {from} to {to} is not permitted")]
    UpgradeNotPermitted {
        component: String,
        from: String,
        to: String,
    },

    #[error("Version parse error: {0}")]
    VersionParse(String),

    // =========================================================================
    // Module Errors
    // =========================================================================
    #[error("Module {module} failed: {reason}")]
    Module { module: String, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Wrap an error raised inside a module transform
    pub fn module(module: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        Error::Module {
            module: module.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Qualify an error raised while applying a module.
    ///
    /// Spec problems keep their validation class so they are not retried.
    pub fn in_module(module: impl std::fmt::Display, err: Error) -> Self {
        match err {
            Error::Module { .. } => err,
            Error::InvalidConfig(reason) => Error::InvalidConfig(format!("{}: {}", module, reason)),
            err if err.is_validation() => err,
            err => Error::module(module, err),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Spec problems need a user edit, which re-triggers the watch
            Error::InvalidConfig(_)
            | Error::UnsupportedDriver { .. }
            | Error::UnsupportedModule { .. }
            | Error::UpgradeNotPermitted { .. }
            | Error::VersionParse(_)
            | Error::Configuration(_) => ErrorAction::NoRequeue,

            // Everything else is retried through the rate limiter
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is a spec validation failure
    pub fn is_validation(&self) -> bool {
        matches!(self.action(), ErrorAction::NoRequeue)
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
