//! Error types for the VM lifecycle layer.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during domain operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// Failed to connect to the control API.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// Domain was not found.
    #[error("Domain not found: {0}")]
    NotFound(String),

    /// Snapshot was not found.
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// A disk, NIC or controller the operation names does not exist.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The requested device slot is already occupied, or the controller is full.
    #[error("Device slot in use: {0}")]
    SlotInUse(String),

    /// The document is structurally inconsistent (e.g. duplicate addresses).
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The domain is in the wrong power state for the requested operation.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The pushed document was fetched before an intervening change.
    #[error("Version conflict: {0}")]
    VersionConflict(String),

    /// The storage collaborator cannot service the request right now.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A polled transition never reached its target state. Always fatal;
    /// the caller must re-fetch true state before further use.
    #[error("{operation} timed out after {waited:?}")]
    Timeout {
        operation: String,
        waited: Duration,
    },

    /// The backend cannot perform the operation (hot-apply, COW clone, ...).
    /// Degradable only where an explicit fallback policy exists.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Wire document generation/parsing error.
    #[error("XML error: {0}")]
    Xml(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for domain operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
