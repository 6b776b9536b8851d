/// Unified error handling for the piped relay
///
/// This module provides the error types shared by the remote pool, the
/// dispatcher, the admin interface and the configuration loader. Only
/// configuration errors are fatal; everything on the dispatch path degrades
/// to endpoint state flags instead of surfacing to local listeners.

use std::fmt;
use std::io;
use thiserror::Error;

/// Main error type for relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Backend address could not be parsed
    #[error("Invalid backend address '{address}': {reason}")]
    Address { address: String, reason: String },

    /// Backend connection could not be established
    #[error("Connect error for {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    /// Write/send failure on an established connection
    #[error("Transport error for {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    /// Admin command failure
    #[error("Admin error on '{command}': {message}")]
    Admin { command: String, message: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

/// Convenience methods for creating specific error types
impl RelayError {
    /// Create an address parsing error
    pub fn address<A: Into<String>, R: Into<String>>(address: A, reason: R) -> Self {
        RelayError::Address {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Create a connect error
    pub fn connect<E: Into<String>, M: Into<String>>(endpoint: E, message: M) -> Self {
        RelayError::Connect {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a transport error
    pub fn transport<E: Into<String>, M: Into<String>>(endpoint: E, message: M) -> Self {
        RelayError::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create an admin command error
    pub fn admin<C: Into<String>, M: Into<String>>(command: C, message: M) -> Self {
        RelayError::Admin {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        RelayError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (the next reconnect tick retries)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RelayError::Network(_)
                | RelayError::Connect { .. }
                | RelayError::Transport { .. }
                | RelayError::Admin { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RelayError::Config(_) => ErrorSeverity::Critical,
            RelayError::Address { .. } => ErrorSeverity::Critical,
            RelayError::Internal { .. } => ErrorSeverity::Critical,
            RelayError::Network(_) => ErrorSeverity::Warning,
            RelayError::Connect { .. } => ErrorSeverity::Warning,
            RelayError::Transport { .. } => ErrorSeverity::Warning,
            RelayError::Admin { .. } => ErrorSeverity::Info,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that abort startup
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
