//! Error types for netcfg operations.
//!
//! This module defines the error taxonomy shared by every manager crate.
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for netcfg operations.
pub type NetCfgResult<T> = Result<T, NetCfgError>;

/// Errors that can occur during netcfg operations.
#[derive(Debug, Error)]
pub enum NetCfgError {
    /// No supported tool or path was found for a subsystem.
    #[error("No supported {subsystem} backend available: {reason}")]
    BackendUnavailable {
        /// The subsystem being probed ("interface", "firewall", "dhcp").
        subsystem: String,
        /// What the probe found missing.
        reason: String,
    },

    /// Native state is in a format the parser cannot use at all.
    #[error("Failed to parse {source_name}: {message}")]
    ParseFailure {
        /// File path or command whose output was parsed.
        source_name: String,
        /// Error message.
        message: String,
    },

    /// A validate or reload command exited non-zero after the artifact was written.
    #[error("Applying {} failed: '{command}' (exit code {exit_code}): {stderr}", .artifact.display())]
    ApplyFailed {
        /// The artifact file that was written.
        artifact: PathBuf,
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Captured standard error, verbatim.
        stderr: String,
    },

    /// Intent is malformed and was rejected before any persistence.
    #[error("Invalid configuration for {field}: {message}")]
    ValidationFailed {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// The configuration surface exists but the behavior is not implemented.
    #[error("{feature} is not implemented")]
    NotImplemented {
        /// The feature that was requested.
        feature: String,
    },

    /// Failed to spawn an external command.
    #[error("Failed to execute command '{command}': {source}")]
    CommandSpawn {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// An external command exceeded the configured timeout and was killed.
    #[error("Command '{command}' timed out after {timeout:?}")]
    CommandTimeout {
        /// The command that timed out.
        command: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// A non-apply command exited non-zero.
    #[error("Command failed: '{command}' (exit code {exit_code}): {output}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// The kernel accepted a change that could not be persisted.
    #[error("Live state diverged from declared state for {what}: {message}")]
    RouteDiverged {
        /// What diverged (e.g. a route destination).
        what: String,
        /// Why persistence failed.
        message: String,
    },

    /// Filesystem error.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// The path being read or written.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Intent store error.
    #[error("Intent store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl NetCfgError {
    /// Creates a backend unavailable error.
    pub fn backend_unavailable(subsystem: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            subsystem: subsystem.into(),
            reason: reason.into(),
        }
    }

    /// Creates a parse failure.
    pub fn parse_failure(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ParseFailure {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationFailed {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a not implemented error.
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented {
            feature: feature.into(),
        }
    }

    /// Creates an I/O error bound to a path.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true if this error was raised before anything was persisted or applied.
    pub fn is_validation(&self) -> bool {
        matches!(self, NetCfgError::ValidationFailed { .. })
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NetCfgError::CommandTimeout { .. }
                | NetCfgError::ApplyFailed { .. }
                | NetCfgError::CommandFailed { .. }
        )
    }
}

impl From<serde_json::Error> for NetCfgError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for NetCfgError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
