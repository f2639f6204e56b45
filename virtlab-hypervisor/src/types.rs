//! Type definitions for the domain document and power states.

use std::collections::HashSet;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{HypervisorError, Result};
use crate::naming;

/// Bytes per GiB.
pub const GIB: u64 = 1024 * 1024 * 1024;

// =============================================================================
// DOMAIN DOCUMENT
// =============================================================================

/// The structured description of a domain.
///
/// This is a client-local projection of the document owned by the host; it is
/// valid only immediately after a fetch or push. Callers mutate a fetched
/// copy and push the whole document back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Host-assigned identity; `None` until the domain is defined.
    pub uuid: Option<String>,
    /// Human-readable name
    pub name: String,
    /// Guest OS hint (free-form, e.g. "rhel9", "win2022")
    pub os_hint: Option<String>,
    /// Number of virtual CPUs
    pub vcpus: u32,
    /// Memory configuration
    pub memory: MemoryConfig,
    /// Disk devices (writable disks and removable media)
    pub disks: Vec<DiskConfig>,
    /// Network interfaces
    pub nics: Vec<NicConfig>,
    /// Explicit storage controllers (index 0 per bus is implicit)
    pub controllers: Vec<ControllerConfig>,
    /// Boot order
    pub boot: Vec<BootDevice>,
    /// Document revision observed at fetch time. Not part of the wire
    /// description; used to detect pushes of a stale projection.
    #[serde(default)]
    pub revision: u64,
}

impl DomainConfig {
    /// Create a new domain configuration with default values.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            uuid: None,
            name: name.into(),
            os_hint: None,
            vcpus: 2,
            memory: MemoryConfig::default(),
            disks: Vec::new(),
            nics: Vec::new(),
            controllers: Vec::new(),
            boot: vec![BootDevice::Disk],
            revision: 0,
        }
    }

    /// Set the number of vCPUs.
    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    /// Set current and maximum memory in MiB.
    pub fn with_memory(mut self, size_mib: u64) -> Self {
        self.memory = MemoryConfig {
            current_mib: size_mib,
            max_mib: size_mib,
        };
        self
    }

    /// Set the guest OS hint.
    pub fn with_os_hint(mut self, hint: impl Into<String>) -> Self {
        self.os_hint = Some(hint.into());
        self
    }

    /// Add a disk.
    pub fn with_disk(mut self, disk: DiskConfig) -> Self {
        self.disks.push(disk);
        self
    }

    /// Add a network interface.
    pub fn with_nic(mut self, nic: NicConfig) -> Self {
        self.nics.push(nic);
        self
    }

    /// Add a storage controller.
    pub fn with_controller(mut self, controller: ControllerConfig) -> Self {
        self.controllers.push(controller);
        self
    }

    /// Look up a disk by its rendered device name (e.g. "sdb").
    pub fn disk(&self, device_name: &str) -> Option<&DiskConfig> {
        self.disks
            .iter()
            .find(|d| d.address.device_name() == device_name)
    }

    /// Look up a NIC by MAC address.
    pub fn nic_by_mac(&self, mac: &str) -> Option<&NicConfig> {
        self.nics.iter().find(|n| n.mac.as_deref() == Some(mac))
    }

    /// Look up an explicit controller by bus and index.
    pub fn controller(&self, bus: DiskBus, index: u32) -> Option<&ControllerConfig> {
        self.controllers
            .iter()
            .find(|c| c.bus == bus && c.index == index)
    }

    /// Query a substructure of the document by JSON pointer
    /// (e.g. `/disks/0/source`, `/memory/current_mib`).
    pub fn query(&self, pointer: &str) -> Option<serde_json::Value> {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.pointer(pointer).cloned())
    }

    /// Check the document for structural consistency.
    ///
    /// A document that fails validation must never be pushed; the remote side
    /// is left unchanged when a backend rejects one.
    pub fn validate(&self) -> Result<()> {
        let mut addresses: HashSet<(DiskBus, u32, u32)> = HashSet::new();
        for disk in &self.disks {
            let addr = &disk.address;
            if !addresses.insert((addr.bus, addr.controller, addr.slot)) {
                return Err(HypervisorError::InvalidConfiguration(format!(
                    "duplicate disk address {} ({}:{} slot {})",
                    addr.device_name(),
                    addr.bus.as_str(),
                    addr.controller,
                    addr.slot
                )));
            }
            let base = naming::controller_base(addr.controller);
            if addr.slot < base || addr.slot >= base + naming::SLOTS_PER_CONTROLLER {
                return Err(HypervisorError::InvalidConfiguration(format!(
                    "disk {} slot {} outside controller {} window",
                    addr.device_name(),
                    addr.slot,
                    addr.controller
                )));
            }
            if addr.controller > 0 && self.controller(addr.bus, addr.controller).is_none() {
                return Err(HypervisorError::InvalidConfiguration(format!(
                    "disk {} addresses missing {} controller {}",
                    addr.device_name(),
                    addr.bus.as_str(),
                    addr.controller
                )));
            }
        }

        let mut controllers: HashSet<(DiskBus, u32)> = HashSet::new();
        for controller in &self.controllers {
            if !controllers.insert((controller.bus, controller.index)) {
                return Err(HypervisorError::InvalidConfiguration(format!(
                    "duplicate {} controller index {}",
                    controller.bus.as_str(),
                    controller.index
                )));
            }
        }

        let mut macs: HashSet<&str> = HashSet::new();
        for nic in &self.nics {
            if let Some(mac) = nic.mac.as_deref() {
                if !macs.insert(mac) {
                    return Err(HypervisorError::InvalidConfiguration(format!(
                        "duplicate NIC MAC address {mac}"
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Memory configuration in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Currently assigned memory
    pub current_mib: u64,
    /// Maximum memory
    pub max_mib: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            current_mib: 2048,
            max_mib: 2048,
        }
    }
}

/// Disk configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Backing-storage reference; empty for an empty removable drive
    pub source: String,
    /// Position on a storage controller
    pub address: DiskAddress,
    /// Disk size in GiB (zero for removable media)
    pub size_gib: u64,
    /// Disk format
    pub format: DiskFormat,
    /// Fixed disk or removable medium
    pub device: DeviceKind,
    /// Read-only marker; distinguishes removable media from writable disks
    pub readonly: bool,
}

impl DiskConfig {
    /// Create a writable disk at the given address.
    pub fn new(source: impl Into<String>, address: DiskAddress) -> Self {
        Self {
            source: source.into(),
            address,
            size_gib: 0,
            format: DiskFormat::Qcow2,
            device: DeviceKind::Disk,
            readonly: false,
        }
    }

    /// Create a removable (CD-ROM) device at the given address.
    pub fn cdrom(source: impl Into<String>, address: DiskAddress) -> Self {
        Self {
            source: source.into(),
            address,
            size_gib: 0,
            format: DiskFormat::Raw,
            device: DeviceKind::Cdrom,
            readonly: true,
        }
    }

    /// Rendered device name, e.g. "vda" or "sdq".
    pub fn device_name(&self) -> String {
        self.address.device_name()
    }
}

/// A disk's position: (bus, controller index, absolute slot).
///
/// Slots are absolute across controllers of a bus: controller `i` owns the
/// 16-slot window starting at `16 * i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskAddress {
    /// Controller bus type
    pub bus: DiskBus,
    /// Zero-based controller index
    pub controller: u32,
    /// Absolute device slot
    pub slot: u32,
}

impl DiskAddress {
    pub fn new(bus: DiskBus, controller: u32, slot: u32) -> Self {
        Self {
            bus,
            controller,
            slot,
        }
    }

    /// Rendered device name, e.g. "sda" for slot 0 on a SCSI controller.
    pub fn device_name(&self) -> String {
        naming::device_name(self.bus, self.slot)
    }

    /// Slot position relative to the owning controller's base.
    pub fn unit(&self) -> u32 {
        self.slot - naming::controller_base(self.controller)
    }
}

/// Disk/controller bus type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    Virtio,
    Scsi,
    Sata,
    Ide,
}

impl DiskBus {
    /// Get the wire bus name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "virtio",
            DiskBus::Scsi => "scsi",
            DiskBus::Sata => "sata",
            DiskBus::Ide => "ide",
        }
    }

    /// Get the device name prefix.
    pub fn device_prefix(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "vd",
            DiskBus::Scsi => "sd",
            DiskBus::Sata => "sd",
            DiskBus::Ide => "hd",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "virtio" => Ok(DiskBus::Virtio),
            "scsi" => Ok(DiskBus::Scsi),
            "sata" => Ok(DiskBus::Sata),
            "ide" => Ok(DiskBus::Ide),
            other => Err(HypervisorError::Xml(format!("unknown bus '{other}'"))),
        }
    }
}

/// Disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Qcow2,
    Raw,
    Vmdk,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
            DiskFormat::Vmdk => "vmdk",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "qcow2" => Ok(DiskFormat::Qcow2),
            "raw" => Ok(DiskFormat::Raw),
            "vmdk" => Ok(DiskFormat::Vmdk),
            other => Err(HypervisorError::Xml(format!("unknown format '{other}'"))),
        }
    }
}

/// Fixed disk vs removable medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Disk,
    Cdrom,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Disk => "disk",
            DeviceKind::Cdrom => "cdrom",
        }
    }
}

/// Network interface configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicConfig {
    /// Bookkeeping index; not enforced by the domain
    pub index: u32,
    /// MAC address; stable for the domain's lifetime once assigned
    pub mac: Option<String>,
    /// Symbolic network name this NIC was requested on
    pub network: String,
    /// Resolved bridge; set at define/attach time
    pub bridge: Option<String>,
    /// NIC model
    pub model: NicModel,
}

impl NicConfig {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            index: 0,
            mac: None,
            network: network.into(),
            bridge: None,
            model: NicModel::Virtio,
        }
    }
}

/// Network interface model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NicModel {
    Virtio,
    E1000,
    Rtl8139,
}

impl NicModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NicModel::Virtio => "virtio",
            NicModel::E1000 => "e1000",
            NicModel::Rtl8139 => "rtl8139",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "virtio" => Ok(NicModel::Virtio),
            "e1000" => Ok(NicModel::E1000),
            "rtl8139" => Ok(NicModel::Rtl8139),
            other => Err(HypervisorError::Xml(format!("unknown NIC model '{other}'"))),
        }
    }
}

/// Storage controller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Bus type
    pub bus: DiskBus,
    /// Zero-based index, unique per bus
    pub index: u32,
    /// Optional driver hint (e.g. "lsilogic", "virtio-scsi")
    pub model: Option<String>,
}

impl ControllerConfig {
    pub fn new(bus: DiskBus, index: u32) -> Self {
        Self {
            bus,
            index,
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Boot device type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    Disk,
    Cdrom,
    Network,
}

impl BootDevice {
    /// Get the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            BootDevice::Disk => "hd",
            BootDevice::Cdrom => "cdrom",
            BootDevice::Network => "network",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "hd" => Ok(BootDevice::Disk),
            "cdrom" => Ok(BootDevice::Cdrom),
            "network" => Ok(BootDevice::Network),
            other => Err(HypervisorError::Xml(format!("unknown boot device '{other}'"))),
        }
    }
}

// =============================================================================
// POWER STATE
// =============================================================================

/// Domain power state.
///
/// `ShuttingDown` is transient: it is only ever observed by polling and is
/// never a transition target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PowerState {
    Down,
    Up,
    Suspended,
    Paused,
    ShuttingDown,
    Unknown,
}

impl Default for PowerState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PowerState::Down => "DOWN",
            PowerState::Up => "UP",
            PowerState::Suspended => "SUSPENDED",
            PowerState::Paused => "PAUSED",
            PowerState::ShuttingDown => "SHUTTING_DOWN",
            PowerState::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

// =============================================================================
// SNAPSHOTS AND CLONING
// =============================================================================

/// Snapshot information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Snapshot ID
    pub id: String,
    /// Snapshot name
    pub name: String,
    /// Description
    pub description: String,
    /// Creation time
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Domain power state at snapshot time
    pub domain_state: PowerState,
    /// Disk-only snapshot vs full checkpoint (disk + running memory)
    pub disk_only: bool,
    /// Parent snapshot ID (for tree structure)
    pub parent_id: Option<String>,
}

/// Duplication mode for clone/copy operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloneMode {
    /// Copy-on-write duplicate where the backend supports it
    Clone,
    /// Full duplication
    Copy,
}

impl CloneMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloneMode::Clone => "clone",
            CloneMode::Copy => "copy",
        }
    }
}

// =============================================================================
// BACKEND METADATA
// =============================================================================

/// Basic domain information, as reported by a backend listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainInfo {
    /// Domain UUID
    pub uuid: String,
    /// Domain name
    pub name: String,
    /// Current power state
    pub state: PowerState,
}

/// Capabilities reported by a control API backend.
#[derive(Debug, Clone)]
pub struct BackendCapabilities {
    /// Name of the backend (e.g. "libvirt", "mock")
    pub name: String,
    /// Version string
    pub version: String,
    /// Supports disk-only snapshots
    pub supports_snapshots: bool,
    /// Supports checkpoints (disk + running memory)
    pub supports_checkpoints: bool,
    /// Exposes an observable PAUSED state
    pub observable_pause: bool,
}

/// Generate a random MAC address in the locally-administered QEMU range.
pub fn random_mac() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk_at(bus: DiskBus, controller: u32, slot: u32) -> DiskConfig {
        DiskConfig::new(
            format!("pool/vol-{slot}"),
            DiskAddress::new(bus, controller, slot),
        )
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let config = DomainConfig::new("dup")
            .with_disk(disk_at(DiskBus::Scsi, 0, 0))
            .with_disk(disk_at(DiskBus::Scsi, 0, 0));

        match config.validate() {
            Err(HypervisorError::InvalidConfiguration(_)) => {}
            other => panic!("expected InvalidConfiguration, got {other:?}"),
        }
    }

    #[test]
    fn test_same_slot_different_bus_allowed() {
        let config = DomainConfig::new("mixed")
            .with_disk(disk_at(DiskBus::Scsi, 0, 0))
            .with_disk(disk_at(DiskBus::Virtio, 0, 0));

        config.validate().unwrap();
    }

    #[test]
    fn test_secondary_controller_must_be_explicit() {
        let config = DomainConfig::new("dangling").with_disk(disk_at(DiskBus::Scsi, 1, 16));
        assert!(config.validate().is_err());

        let config = config.with_controller(ControllerConfig::new(DiskBus::Scsi, 1));
        config.validate().unwrap();
    }

    #[test]
    fn test_slot_outside_controller_window_rejected() {
        // slot 16 belongs to controller 1's window
        let config = DomainConfig::new("window").with_disk(disk_at(DiskBus::Scsi, 0, 16));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_mac_rejected() {
        let mut nic_a = NicConfig::new("lab");
        nic_a.mac = Some("52:54:00:aa:bb:cc".to_string());
        let mut nic_b = NicConfig::new("lab");
        nic_b.mac = Some("52:54:00:aa:bb:cc".to_string());

        let config = DomainConfig::new("macs").with_nic(nic_a).with_nic(nic_b);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_query_pointer() {
        let config = DomainConfig::new("q")
            .with_memory(4096)
            .with_disk(disk_at(DiskBus::Virtio, 0, 0));

        assert_eq!(
            config.query("/memory/current_mib"),
            Some(serde_json::json!(4096))
        );
        assert_eq!(
            config.query("/disks/0/source"),
            Some(serde_json::json!("pool/vol-0"))
        );
        assert_eq!(config.query("/disks/1/source"), None);
    }

    #[test]
    fn test_random_mac_is_locally_administered() {
        let mac = random_mac();
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
    }
}
