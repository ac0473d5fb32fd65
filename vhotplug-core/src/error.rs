//! Error types for vhotplug.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error
//! chains. Every variant maps to a stable machine-readable code that is
//! reported to API clients next to the human-readable message.

use thiserror::Error;

/// Result type alias for vhotplug operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for vhotplug.
#[derive(Error, Debug)]
pub enum Error {
    // Startup errors (fatal, the process exits non-zero)
    #[error("Invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    #[error("Device monitor lost: {reason}")]
    SourceLost { reason: String },

    // Device resolution errors (surfaced to the API caller)
    #[error("No such device: {selector}")]
    NoSuchDevice { selector: String },

    #[error("ambiguous selector {selector}: {count} devices match")]
    Ambiguous { selector: String, count: usize },

    #[error("Device is already attached to {vm}")]
    AlreadyAttached { vm: String },

    #[error("Device is not attached to any VM")]
    NotAttached,

    #[error("VM not found in configuration: {vm}")]
    UnknownVm { vm: String },

    // Hypervisor adapter errors
    #[error("VM {vm} is unreachable: {reason}")]
    VmUnreachable { vm: String, reason: String },

    #[error("Protocol error talking to {vm}: {reason}")]
    ProtocolError { vm: String, reason: String },

    #[error("Operation not supported by {vm}: {operation}")]
    Unsupported { vm: String, operation: String },

    #[error("Command to {vm} timed out")]
    Timeout { vm: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Stable error code reported over the API.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ConfigInvalid { .. } => "config_invalid",
            Error::SourceLost { .. } => "source_lost",
            Error::NoSuchDevice { .. } => "no_such_device",
            Error::Ambiguous { .. } => "ambiguous",
            Error::AlreadyAttached { .. } => "already_attached",
            Error::NotAttached => "not_attached",
            Error::UnknownVm { .. } => "unknown_vm",
            Error::VmUnreachable { .. } => "vm_unreachable",
            Error::ProtocolError { .. } => "protocol_error",
            Error::Unsupported { .. } => "unsupported",
            Error::Timeout { .. } => "timeout",
            Error::Io { .. } => "io",
        }
    }

    /// True for errors that must terminate the daemon.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConfigInvalid { .. } | Error::SourceLost { .. })
    }
}
