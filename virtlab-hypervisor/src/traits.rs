//! Backend contracts: the wire-level control API and the host resource
//! collaborator.
//!
//! Everything above these traits is backend-agnostic; only document
//! fetch/push and the hot-apply path differ per backend.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::*;

/// A single device change, shipped to a backend for hot application.
#[derive(Debug, Clone)]
pub enum DevicePayload {
    Disk(DiskConfig),
    Nic(NicConfig),
    Controller(ControllerConfig),
}

impl DevicePayload {
    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            DevicePayload::Disk(d) => format!("disk {}", d.device_name()),
            DevicePayload::Nic(n) => {
                format!("nic {}", n.mac.as_deref().unwrap_or("<no mac>"))
            }
            DevicePayload::Controller(c) => {
                format!("controller {}/{}", c.bus.as_str(), c.index)
            }
        }
    }
}

/// Wire-level control API for a hypervisor backend.
///
/// Commands are issue-only: they return as soon as the backend accepts the
/// request. Waiting for the resulting state is the caller's job (polling
/// via [`ControlApi::power_state`]).
#[async_trait]
pub trait ControlApi: Send + Sync {
    // =========================================================================
    // Capabilities & Health
    // =========================================================================

    /// Get backend capabilities.
    async fn capabilities(&self) -> Result<BackendCapabilities>;

    /// Check if the backend connection is healthy.
    async fn health_check(&self) -> Result<bool>;

    // =========================================================================
    // Document
    // =========================================================================

    /// Fetch the current domain document.
    async fn fetch(&self, uuid: &str) -> Result<DomainConfig>;

    /// Replace the whole domain document.
    ///
    /// Structurally invalid documents are rejected with
    /// `InvalidConfiguration` and leave the remote side unchanged; a
    /// document fetched before an intervening change fails
    /// `VersionConflict`.
    async fn push(&self, uuid: &str, config: &DomainConfig) -> Result<()>;

    /// Define a new domain from a document. Returns the assigned UUID.
    async fn define(&self, config: &DomainConfig) -> Result<String>;

    /// Remove a domain definition.
    async fn undefine(&self, uuid: &str) -> Result<()>;

    /// List all domains known to this backend.
    async fn list_domains(&self) -> Result<Vec<DomainInfo>>;

    // =========================================================================
    // Power
    // =========================================================================

    /// Get the current power state.
    async fn power_state(&self, uuid: &str) -> Result<PowerState>;

    /// Start a defined domain.
    async fn start(&self, uuid: &str) -> Result<()>;

    /// Stop a domain. `force = false` asks the guest to shut down and may
    /// fail `Unsupported` when no shutdown agent exists; `force = true`
    /// powers it off.
    async fn shutdown(&self, uuid: &str, force: bool) -> Result<()>;

    /// Soft-reboot a domain; may fail `Unsupported` without guest support.
    async fn reboot(&self, uuid: &str) -> Result<()>;

    /// Suspend a running domain to a saved image.
    async fn suspend(&self, uuid: &str) -> Result<()>;

    /// Resume a suspended domain.
    async fn resume(&self, uuid: &str) -> Result<()>;

    /// Freeze a running domain.
    async fn pause(&self, uuid: &str) -> Result<()>;

    /// Unfreeze a paused domain.
    async fn unpause(&self, uuid: &str) -> Result<()>;

    /// Drop a suspended domain's saved image without resuming it.
    async fn discard_saved_state(&self, uuid: &str) -> Result<()>;

    /// Whether this backend exposes an observable PAUSED state. When false,
    /// callers must not poll for `Paused` after issuing a pause.
    fn observes_paused_state(&self) -> bool {
        true
    }

    // =========================================================================
    // Hot device path
    // =========================================================================

    /// Attach a device to a running domain, updating both the live guest
    /// and the persistent document. Fails `Unsupported` when the backend
    /// cannot hot-apply this device.
    async fn attach_device(&self, uuid: &str, device: &DevicePayload) -> Result<()>;

    /// Update a device of a running domain in place (e.g. removable media).
    async fn update_device(&self, uuid: &str, device: &DevicePayload) -> Result<()>;

    /// Detach a device from a running domain.
    async fn detach_device(&self, uuid: &str, device: &DevicePayload) -> Result<()>;

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Create a snapshot. `disk_only = true` captures storage only;
    /// `false` also captures running memory.
    async fn snapshot_create(
        &self,
        uuid: &str,
        name: &str,
        description: &str,
        disk_only: bool,
    ) -> Result<SnapshotInfo>;

    /// Revert to a named snapshot.
    async fn snapshot_revert(&self, uuid: &str, name: &str) -> Result<()>;

    /// Delete a named snapshot.
    async fn snapshot_delete(&self, uuid: &str, name: &str) -> Result<()>;

    /// List all snapshots of a domain.
    async fn snapshot_list(&self, uuid: &str) -> Result<Vec<SnapshotInfo>>;
}

/// Host-side resource services: backing-storage allocation/duplication and
/// bridge lookup. Satisfied by the storage-repository subsystem.
///
/// Implementations must guarantee atomic, collision-free naming under
/// concurrent duplication from multiple clones.
#[async_trait]
pub trait HostApi: Send + Sync {
    /// Allocate new backing storage. Returns the storage reference.
    async fn create_storage(
        &self,
        size_bytes: u64,
        pool: &str,
        name: Option<&str>,
    ) -> Result<String>;

    /// Duplicate backing storage under a new name.
    ///
    /// `Clone` mode asks for a copy-on-write duplicate and fails
    /// `Unsupported` where the pool cannot provide one; `Copy` is a full
    /// duplication.
    async fn duplicate_storage(
        &self,
        source: &str,
        new_name: &str,
        mode: CloneMode,
    ) -> Result<String>;

    /// Destroy backing storage.
    async fn destroy_storage(&self, storage_ref: &str) -> Result<()>;

    /// Resolve a symbolic network name to a host bridge.
    async fn resolve_bridge(&self, network: &str) -> Result<String>;
}
