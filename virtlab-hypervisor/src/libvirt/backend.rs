//! Libvirt backend implementation.

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::sys;

use crate::error::{HypervisorError, Result};
use crate::traits::{ControlApi, DevicePayload};
use crate::types::*;
use crate::xml::{
    controller_fragment_xml, disk_fragment_xml, nic_fragment_xml, parse_domain_xml,
    DomainXmlBuilder,
};

/// Libvirt/QEMU control API backend.
pub struct LibvirtBackend {
    uri: String,
    connection: Connect,
}

impl LibvirtBackend {
    /// Connect to libvirt at the given URI.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu:///session` - User session QEMU
    /// - `qemu+ssh://user@host/system` - Remote via SSH
    pub async fn new(uri: &str) -> Result<Self> {
        info!(uri = %uri, "Connecting to libvirt");

        let connection = Connect::open(Some(uri))
            .map_err(|e| HypervisorError::ConnectionFailed(e.to_string()))?;

        info!("Connected to libvirt");

        Ok(Self {
            uri: uri.to_string(),
            connection,
        })
    }

    /// The URI this backend is connected to.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn get_domain(&self, uuid: &str) -> Result<Domain> {
        Domain::lookup_by_uuid_string(&self.connection, uuid)
            .map_err(|e| HypervisorError::NotFound(format!("{uuid}: {e}")))
    }

    fn state_of(&self, domain: &Domain) -> Result<PowerState> {
        let (state, _) = domain
            .get_state()
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;

        let mapped = match state {
            sys::VIR_DOMAIN_RUNNING => PowerState::Up,
            sys::VIR_DOMAIN_PAUSED => PowerState::Paused,
            sys::VIR_DOMAIN_SHUTDOWN => PowerState::ShuttingDown,
            sys::VIR_DOMAIN_PMSUSPENDED => PowerState::Suspended,
            sys::VIR_DOMAIN_CRASHED => PowerState::Down,
            sys::VIR_DOMAIN_SHUTOFF => {
                // shut off with a managed save image is our suspended state
                if domain.has_managed_save_image(0).unwrap_or(false) {
                    PowerState::Suspended
                } else {
                    PowerState::Down
                }
            }
            _ => PowerState::Unknown,
        };
        Ok(mapped)
    }

    fn fragment_for(payload: &DevicePayload) -> String {
        match payload {
            DevicePayload::Disk(disk) => disk_fragment_xml(disk),
            DevicePayload::Nic(nic) => nic_fragment_xml(nic),
            DevicePayload::Controller(controller) => controller_fragment_xml(controller),
        }
    }

    fn virsh(&self, args: &[&str]) -> Result<String> {
        let output = std::process::Command::new("virsh")
            .args(args)
            .output()
            .map_err(|e| HypervisorError::BackendUnavailable(format!("virsh: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HypervisorError::Internal(format!(
                "virsh {} failed: {stderr}",
                args.first().unwrap_or(&"")
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ControlApi for LibvirtBackend {
    #[instrument(skip(self))]
    async fn capabilities(&self) -> Result<BackendCapabilities> {
        let version = self
            .connection
            .get_lib_version()
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;

        let major = (version / 1_000_000) as u32;
        let minor = ((version / 1000) % 1000) as u32;
        let micro = (version % 1000) as u32;

        Ok(BackendCapabilities {
            name: "libvirt/QEMU".to_string(),
            version: format!("{major}.{minor}.{micro}"),
            supports_snapshots: true,
            supports_checkpoints: true,
            observable_pause: true,
        })
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<bool> {
        match self.connection.is_alive() {
            Ok(alive) => Ok(alive),
            Err(_) => Ok(false),
        }
    }

    #[instrument(skip(self), fields(uuid = %uuid))]
    async fn fetch(&self, uuid: &str) -> Result<DomainConfig> {
        let domain = self.get_domain(uuid)?;
        let xml = domain
            .get_xml_desc(sys::VIR_DOMAIN_XML_INACTIVE)
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;
        parse_domain_xml(&xml)
    }

    #[instrument(skip(self, config), fields(uuid = %uuid))]
    async fn push(&self, uuid: &str, config: &DomainConfig) -> Result<()> {
        config.validate()?;
        // redefining an existing name replaces the whole document
        let _ = self.get_domain(uuid)?;
        let xml = DomainXmlBuilder::new(config).build();
        debug!(xml = %xml, "Redefining domain");
        Domain::define_xml(&self.connection, &xml)
            .map_err(|e| HypervisorError::InvalidConfiguration(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, config), fields(name = %config.name))]
    async fn define(&self, config: &DomainConfig) -> Result<String> {
        config.validate()?;
        let xml = DomainXmlBuilder::new(config).build();
        debug!(xml = %xml, "Defining domain");

        let domain = Domain::define_xml(&self.connection, &xml)
            .map_err(|e| HypervisorError::InvalidConfiguration(e.to_string()))?;

        let uuid = domain
            .get_uuid_string()
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;

        info!(%uuid, "Domain defined");
        Ok(uuid)
    }

    #[instrument(skip(self), fields(uuid = %uuid))]
    async fn undefine(&self, uuid: &str) -> Result<()> {
        let domain = self.get_domain(uuid)?;
        domain
            .undefine()
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;
        info!("Domain undefined");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_domains(&self) -> Result<Vec<DomainInfo>> {
        let flags =
            sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;

        let domains = self
            .connection
            .list_all_domains(flags)
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;

        let mut result = Vec::with_capacity(domains.len());
        for domain in domains {
            let uuid = domain
                .get_uuid_string()
                .map_err(|e| HypervisorError::Internal(e.to_string()))?;
            let name = domain
                .get_name()
                .map_err(|e| HypervisorError::Internal(e.to_string()))?;
            let state = self.state_of(&domain)?;
            result.push(DomainInfo { uuid, name, state });
        }

        debug!(count = result.len(), "Listed domains");
        Ok(result)
    }

    async fn power_state(&self, uuid: &str) -> Result<PowerState> {
        let domain = self.get_domain(uuid)?;
        self.state_of(&domain)
    }

    #[instrument(skip(self), fields(uuid = %uuid))]
    async fn start(&self, uuid: &str) -> Result<()> {
        let domain = self.get_domain(uuid)?;
        domain
            .create()
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), fields(uuid = %uuid, force = force))]
    async fn shutdown(&self, uuid: &str, force: bool) -> Result<()> {
        let domain = self.get_domain(uuid)?;
        if force {
            domain
                .destroy()
                .map_err(|e| HypervisorError::Internal(e.to_string()))?;
        } else {
            // fails on guests without an ACPI/agent shutdown path
            domain
                .shutdown()
                .map_err(|e| HypervisorError::Unsupported(e.to_string()))?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(uuid = %uuid))]
    async fn reboot(&self, uuid: &str) -> Result<()> {
        let domain = self.get_domain(uuid)?;
        domain
            .reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT)
            .map_err(|e| HypervisorError::Unsupported(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), fields(uuid = %uuid))]
    async fn suspend(&self, uuid: &str) -> Result<()> {
        let domain = self.get_domain(uuid)?;
        domain
            .managed_save(0)
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), fields(uuid = %uuid))]
    async fn resume(&self, uuid: &str) -> Result<()> {
        let domain = self.get_domain(uuid)?;
        // starting a domain with a managed save image restores it
        domain
            .create()
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), fields(uuid = %uuid))]
    async fn pause(&self, uuid: &str) -> Result<()> {
        let domain = self.get_domain(uuid)?;
        domain
            .suspend()
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), fields(uuid = %uuid))]
    async fn unpause(&self, uuid: &str) -> Result<()> {
        let domain = self.get_domain(uuid)?;
        domain
            .resume()
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn discard_saved_state(&self, uuid: &str) -> Result<()> {
        let domain = self.get_domain(uuid)?;
        if domain.has_managed_save_image(0).unwrap_or(false) {
            domain
                .managed_save_remove(0)
                .map_err(|e| HypervisorError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    #[instrument(skip(self, device), fields(uuid = %uuid, device = %device.describe()))]
    async fn attach_device(&self, uuid: &str, device: &DevicePayload) -> Result<()> {
        let domain = self.get_domain(uuid)?;
        let fragment = Self::fragment_for(device);
        let flags = sys::VIR_DOMAIN_AFFECT_LIVE | sys::VIR_DOMAIN_AFFECT_CONFIG;
        // hot-apply support is undiscoverable ahead of time; a refusal here
        // is the signal for callers to stage the change instead
        domain.attach_device_flags(&fragment, flags).map_err(|e| {
            warn!(error = %e, "Hot attach refused");
            HypervisorError::Unsupported(e.to_string())
        })?;
        Ok(())
    }

    #[instrument(skip(self, device), fields(uuid = %uuid, device = %device.describe()))]
    async fn update_device(&self, uuid: &str, device: &DevicePayload) -> Result<()> {
        let domain = self.get_domain(uuid)?;
        let fragment = Self::fragment_for(device);
        let flags = sys::VIR_DOMAIN_AFFECT_LIVE | sys::VIR_DOMAIN_AFFECT_CONFIG;
        domain.update_device_flags(&fragment, flags).map_err(|e| {
            warn!(error = %e, "Hot update refused");
            HypervisorError::Unsupported(e.to_string())
        })?;
        Ok(())
    }

    #[instrument(skip(self, device), fields(uuid = %uuid, device = %device.describe()))]
    async fn detach_device(&self, uuid: &str, device: &DevicePayload) -> Result<()> {
        let domain = self.get_domain(uuid)?;
        let fragment = Self::fragment_for(device);
        let flags = sys::VIR_DOMAIN_AFFECT_LIVE | sys::VIR_DOMAIN_AFFECT_CONFIG;
        domain.detach_device_flags(&fragment, flags).map_err(|e| {
            warn!(error = %e, "Hot detach refused");
            HypervisorError::Unsupported(e.to_string())
        })?;
        Ok(())
    }

    // The virt crate does not expose the snapshot API; shell out to virsh.

    #[instrument(skip(self), fields(uuid = %uuid, name = %name, disk_only = disk_only))]
    async fn snapshot_create(
        &self,
        uuid: &str,
        name: &str,
        description: &str,
        disk_only: bool,
    ) -> Result<SnapshotInfo> {
        let domain = self.get_domain(uuid)?;
        let state = self.state_of(&domain)?;

        let mut args = vec![
            "snapshot-create-as",
            uuid,
            "--name",
            name,
            "--description",
            description,
        ];
        if disk_only {
            args.push("--disk-only");
        }
        self.virsh(&args)?;

        info!("Snapshot created");
        Ok(SnapshotInfo {
            id: name.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: chrono::Utc::now(),
            domain_state: state,
            disk_only,
            parent_id: None,
        })
    }

    #[instrument(skip(self), fields(uuid = %uuid, name = %name))]
    async fn snapshot_revert(&self, uuid: &str, name: &str) -> Result<()> {
        let _ = self.get_domain(uuid)?;
        self.virsh(&["snapshot-revert", uuid, name])?;
        info!("Reverted to snapshot");
        Ok(())
    }

    #[instrument(skip(self), fields(uuid = %uuid, name = %name))]
    async fn snapshot_delete(&self, uuid: &str, name: &str) -> Result<()> {
        let _ = self.get_domain(uuid)?;
        self.virsh(&["snapshot-delete", uuid, name])?;
        info!("Snapshot deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(uuid = %uuid))]
    async fn snapshot_list(&self, uuid: &str) -> Result<Vec<SnapshotInfo>> {
        let domain = self.get_domain(uuid)?;
        let state = self.state_of(&domain)?;

        let stdout = self.virsh(&["snapshot-list", uuid, "--name"])?;
        let result = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|name| SnapshotInfo {
                id: name.to_string(),
                name: name.to_string(),
                description: String::new(),
                created_at: chrono::Utc::now(),
                domain_state: state,
                disk_only: false,
                parent_id: None,
            })
            .collect();

        Ok(result)
    }
}
