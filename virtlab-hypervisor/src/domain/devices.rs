//! Device lifecycle: disks, NICs, controllers, boot order, removable media.
//!
//! Every operation fetches the current document, mutates it, and either
//! hot-applies the change (domain running and the per-domain hot-apply
//! flag set) or stages it into the document for the next offline push. A
//! hot attempt the backend rejects degrades to the staged path instead of
//! failing; the post-condition is re-fetched and validated before
//! returning.

use tracing::{info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::naming;
use crate::traits::DevicePayload;
use crate::types::*;

use super::Domain;

/// What to attach: sizing, placement and backing for a new disk.
#[derive(Debug, Clone)]
pub struct DiskSpec {
    pub size_gib: u64,
    /// Storage pool for a newly created volume
    pub pool: String,
    pub format: DiskFormat,
    /// Bus; defaults to the bus of the domain's first disk
    pub bus: Option<DiskBus>,
    /// Controller index on that bus
    pub controller: u32,
    /// Explicit slot; allocated when unset
    pub slot: Option<u32>,
    /// Attach an existing volume instead of creating one
    pub existing_source: Option<String>,
    pub readonly: bool,
    /// Volume name; generated from the device name when unset
    pub name: Option<String>,
}

impl DiskSpec {
    /// A new volume of the given size, created in `pool`.
    pub fn new(size_gib: u64, pool: impl Into<String>) -> Self {
        Self {
            size_gib,
            pool: pool.into(),
            format: DiskFormat::Qcow2,
            bus: None,
            controller: 0,
            slot: None,
            existing_source: None,
            readonly: false,
            name: None,
        }
    }

    /// Attach an already-existing volume.
    pub fn from_existing(source: impl Into<String>) -> Self {
        Self {
            size_gib: 0,
            pool: String::new(),
            format: DiskFormat::Qcow2,
            bus: None,
            controller: 0,
            slot: None,
            existing_source: Some(source.into()),
            readonly: false,
            name: None,
        }
    }

    pub fn on_controller(mut self, bus: DiskBus, index: u32) -> Self {
        self.bus = Some(bus);
        self.controller = index;
        self
    }

    pub fn at_slot(mut self, slot: u32) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn with_format(mut self, format: DiskFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// What to attach for a new NIC.
#[derive(Debug, Clone)]
pub struct NicSpec {
    /// Symbolic network, resolved to a bridge at attach time
    pub network: String,
    /// Explicit MAC; generated when unset
    pub mac: Option<String>,
    pub model: NicModel,
}

impl NicSpec {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            mac: None,
            model: NicModel::Virtio,
        }
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }
}

enum HotOp {
    Attach,
    Update,
    Detach,
}

impl Domain {
    /// Hot-apply the change when allowed, otherwise stage the mutated
    /// document. A backend that rejects the hot attempt with `Unsupported`
    /// degrades to staging.
    async fn apply_device_change(
        &self,
        config: &DomainConfig,
        hot: Option<(&DevicePayload, HotOp)>,
    ) -> Result<()> {
        let state = self.power_state().await?;
        if state == PowerState::Up && self.capabilities().hot_apply {
            if let Some((payload, op)) = hot {
                let outcome = match op {
                    HotOp::Attach => self.control().attach_device(self.uuid(), payload).await,
                    HotOp::Update => self.control().update_device(self.uuid(), payload).await,
                    HotOp::Detach => self.control().detach_device(self.uuid(), payload).await,
                };
                match outcome {
                    Ok(()) => {
                        self.fetch().await?;
                        return Ok(());
                    }
                    Err(HypervisorError::Unsupported(msg)) => {
                        warn!(
                            device = %payload.describe(),
                            reason = %msg,
                            "Hot-apply rejected; staging change for next boot"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.push(config).await?;
        Ok(())
    }

    /// Attach a disk. Returns the device name (e.g. "vdb").
    #[instrument(skip(self, spec), fields(domain = %self.name()))]
    pub async fn attach_disk(&self, spec: DiskSpec) -> Result<String> {
        let mut config = self.fetch().await?;

        let bus = spec.bus.unwrap_or_else(|| {
            config
                .disks
                .first()
                .map(|d| d.address.bus)
                .unwrap_or(DiskBus::Virtio)
        });

        let slot = match spec.slot {
            Some(slot) => {
                let base = naming::controller_base(spec.controller);
                if slot < base || slot >= base + naming::SLOTS_PER_CONTROLLER {
                    return Err(HypervisorError::InvalidConfiguration(format!(
                        "slot {slot} outside {} controller {} window",
                        bus.as_str(),
                        spec.controller
                    )));
                }
                if config.disks.iter().any(|d| {
                    d.address.bus == bus
                        && d.address.controller == spec.controller
                        && d.address.slot == slot
                }) {
                    return Err(HypervisorError::SlotInUse(format!(
                        "{} slot {slot} on controller {} is occupied",
                        bus.as_str(),
                        spec.controller
                    )));
                }
                slot
            }
            None => naming::next_free_slot(&config, bus, spec.controller)?,
        };

        let address = DiskAddress::new(bus, spec.controller, slot);
        let device_name = address.device_name();

        let source = match &spec.existing_source {
            Some(source) => source.clone(),
            None => {
                let vol_name = spec.name.clone().unwrap_or_else(|| {
                    format!("{}-{}.{}", self.name(), device_name, spec.format.as_str())
                });
                self.host()
                    .create_storage(spec.size_gib * GIB, &spec.pool, Some(&vol_name))
                    .await?
            }
        };

        let mut disk = DiskConfig::new(source, address);
        disk.size_gib = spec.size_gib;
        disk.format = spec.format;
        disk.readonly = spec.readonly;

        config.disks.push(disk.clone());
        config.validate()?;

        self.apply_device_change(&config, Some((&DevicePayload::Disk(disk), HotOp::Attach)))
            .await?;

        let after = self.fetch().await?;
        if after.disk(&device_name).is_none() {
            return Err(HypervisorError::DeviceNotFound(format!(
                "{device_name} missing after attach"
            )));
        }

        info!(device = %device_name, "Disk attached");
        Ok(device_name)
    }

    /// Detach a disk by device name. Destroys its backing storage unless
    /// `keep_storage`.
    #[instrument(skip(self), fields(domain = %self.name(), device = %device_name))]
    pub async fn remove_disk(&self, device_name: &str, keep_storage: bool) -> Result<()> {
        let mut config = self.fetch().await?;

        let idx = config
            .disks
            .iter()
            .position(|d| d.device_name() == device_name)
            .ok_or_else(|| HypervisorError::DeviceNotFound(device_name.to_string()))?;
        let removed = config.disks.remove(idx);

        self.apply_device_change(
            &config,
            Some((&DevicePayload::Disk(removed.clone()), HotOp::Detach)),
        )
        .await?;

        let after = self.fetch().await?;
        if after.disk(device_name).is_some() {
            return Err(HypervisorError::Internal(format!(
                "{device_name} still present after detach"
            )));
        }

        if !keep_storage
            && removed.device == DeviceKind::Disk
            && !removed.readonly
            && !removed.source.is_empty()
        {
            self.host().destroy_storage(&removed.source).await?;
        }

        info!("Disk removed");
        Ok(())
    }

    /// Attach a NIC. Returns its MAC address.
    #[instrument(skip(self, spec), fields(domain = %self.name(), network = %spec.network))]
    pub async fn attach_nic(&self, spec: NicSpec) -> Result<String> {
        let mut config = self.fetch().await?;

        let bridge = self.host().resolve_bridge(&spec.network).await?;
        let mac = spec.mac.clone().unwrap_or_else(random_mac);
        let index = config.nics.iter().map(|n| n.index + 1).max().unwrap_or(0);

        let nic = NicConfig {
            index,
            mac: Some(mac.clone()),
            network: spec.network.clone(),
            bridge: Some(bridge),
            model: spec.model,
        };

        config.nics.push(nic.clone());
        config.validate()?;

        self.apply_device_change(&config, Some((&DevicePayload::Nic(nic), HotOp::Attach)))
            .await?;

        let after = self.fetch().await?;
        if after.nic_by_mac(&mac).is_none() {
            return Err(HypervisorError::DeviceNotFound(format!(
                "NIC {mac} missing after attach"
            )));
        }

        info!(mac = %mac, "NIC attached");
        Ok(mac)
    }

    /// Detach a NIC by MAC address.
    #[instrument(skip(self), fields(domain = %self.name(), mac = %mac))]
    pub async fn remove_nic(&self, mac: &str) -> Result<()> {
        let mut config = self.fetch().await?;

        let idx = config
            .nics
            .iter()
            .position(|n| n.mac.as_deref() == Some(mac))
            .ok_or_else(|| HypervisorError::DeviceNotFound(mac.to_string()))?;
        let removed = config.nics.remove(idx);

        self.apply_device_change(&config, Some((&DevicePayload::Nic(removed), HotOp::Detach)))
            .await?;

        let after = self.fetch().await?;
        if after.nic_by_mac(mac).is_some() {
            return Err(HypervisorError::Internal(format!(
                "NIC {mac} still present after detach"
            )));
        }

        info!("NIC removed");
        Ok(())
    }

    /// Create a storage controller on the given bus. Returns the new index
    /// (one past the highest in use; index 0 is implicit).
    #[instrument(skip(self), fields(domain = %self.name(), bus = %bus.as_str()))]
    pub async fn create_controller(&self, bus: DiskBus, model: Option<&str>) -> Result<u32> {
        let mut config = self.fetch().await?;

        let highest = config
            .controllers
            .iter()
            .filter(|c| c.bus == bus)
            .map(|c| c.index)
            .chain(
                config
                    .disks
                    .iter()
                    .filter(|d| d.address.bus == bus)
                    .map(|d| d.address.controller),
            )
            .max()
            .unwrap_or(0);
        let index = highest + 1;

        let mut controller = ControllerConfig::new(bus, index);
        controller.model = model.map(str::to_string);

        config.controllers.push(controller.clone());
        config.validate()?;

        self.apply_device_change(
            &config,
            Some((&DevicePayload::Controller(controller), HotOp::Attach)),
        )
        .await?;

        let after = self.fetch().await?;
        if after.controller(bus, index).is_none() {
            return Err(HypervisorError::DeviceNotFound(format!(
                "controller {}/{index} missing after create",
                bus.as_str()
            )));
        }

        info!(index, "Controller created");
        Ok(index)
    }

    /// Remove a storage controller. Refused while disks still address it;
    /// removal would invalidate their device-letter range.
    #[instrument(skip(self), fields(domain = %self.name(), bus = %bus.as_str(), index = index))]
    pub async fn remove_controller(&self, bus: DiskBus, index: u32) -> Result<()> {
        let mut config = self.fetch().await?;

        let dependents: Vec<String> = config
            .disks
            .iter()
            .filter(|d| d.address.bus == bus && d.address.controller == index)
            .map(|d| d.device_name())
            .collect();
        if !dependents.is_empty() {
            return Err(HypervisorError::InvalidConfiguration(format!(
                "controller {}/{index} still has disks: {}",
                bus.as_str(),
                dependents.join(", ")
            )));
        }

        let pos = config
            .controllers
            .iter()
            .position(|c| c.bus == bus && c.index == index)
            .ok_or_else(|| {
                HypervisorError::DeviceNotFound(format!("controller {}/{index}", bus.as_str()))
            })?;
        let removed = config.controllers.remove(pos);

        self.apply_device_change(
            &config,
            Some((&DevicePayload::Controller(removed), HotOp::Detach)),
        )
        .await?;

        info!("Controller removed");
        Ok(())
    }

    /// Change a controller's driver model.
    #[instrument(skip(self), fields(domain = %self.name(), bus = %bus.as_str(), index = index))]
    pub async fn change_controller_model(
        &self,
        bus: DiskBus,
        index: u32,
        model: &str,
    ) -> Result<()> {
        let mut config = self.fetch().await?;

        let controller = config
            .controllers
            .iter_mut()
            .find(|c| c.bus == bus && c.index == index)
            .ok_or_else(|| {
                HypervisorError::DeviceNotFound(format!("controller {}/{index}", bus.as_str()))
            })?;
        controller.model = Some(model.to_string());

        // a live model change is never safe; always staged
        self.apply_device_change(&config, None).await?;

        info!(model, "Controller model changed");
        Ok(())
    }

    /// Move a disk to another controller, allocating a fresh slot there.
    /// Returns the new device name. Always staged for the next boot.
    #[instrument(skip(self), fields(domain = %self.name(), device = %device_name))]
    pub async fn change_disk_controller(
        &self,
        device_name: &str,
        bus: DiskBus,
        controller: u32,
    ) -> Result<String> {
        let mut config = self.fetch().await?;

        let idx = config
            .disks
            .iter()
            .position(|d| d.device_name() == device_name)
            .ok_or_else(|| HypervisorError::DeviceNotFound(device_name.to_string()))?;
        let mut disk = config.disks.remove(idx);

        let slot = naming::next_free_slot(&config, bus, controller)?;
        disk.address = DiskAddress::new(bus, controller, slot);
        let new_name = disk.device_name();
        config.disks.push(disk);
        config.validate()?;

        self.apply_device_change(&config, None).await?;

        let after = self.fetch().await?;
        if after.disk(&new_name).is_none() {
            return Err(HypervisorError::DeviceNotFound(format!(
                "{new_name} missing after move"
            )));
        }

        info!(new_device = %new_name, "Disk moved");
        Ok(new_name)
    }

    /// Replace the boot order with a single device.
    #[instrument(skip(self), fields(domain = %self.name()))]
    pub async fn set_boot_device(&self, device: BootDevice) -> Result<()> {
        let mut config = self.fetch().await?;
        config.boot = vec![device];
        self.apply_device_change(&config, None).await?;
        info!(device = device.as_str(), "Boot device set");
        Ok(())
    }

    /// Change (or insert) removable media. `Some(iso)` mounts the ISO;
    /// `None` ejects. Returns the removable drive's device name.
    #[instrument(skip(self), fields(domain = %self.name()))]
    pub async fn change_cd(&self, iso: Option<&str>) -> Result<String> {
        let mut config = self.fetch().await?;

        if let Some(idx) = config
            .disks
            .iter()
            .position(|d| d.device == DeviceKind::Cdrom)
        {
            config.disks[idx].source = iso.unwrap_or_default().to_string();
            let updated = config.disks[idx].clone();
            let device_name = updated.device_name();

            self.apply_device_change(
                &config,
                Some((&DevicePayload::Disk(updated), HotOp::Update)),
            )
            .await?;

            let after = self.fetch().await?;
            match after.disk(&device_name) {
                Some(disk) if disk.source == iso.unwrap_or_default() => {}
                _ => {
                    return Err(HypervisorError::Internal(format!(
                        "media change on {device_name} not visible after update"
                    )))
                }
            }

            info!(device = %device_name, "Media changed");
            return Ok(device_name);
        }

        let iso = iso.ok_or_else(|| {
            HypervisorError::DeviceNotFound("no removable drive to eject".to_string())
        })?;

        let slot = naming::next_free_slot(&config, DiskBus::Ide, 0)?;
        let cd = DiskConfig::cdrom(iso, DiskAddress::new(DiskBus::Ide, 0, slot));
        let device_name = cd.device_name();

        config.disks.push(cd.clone());
        config.validate()?;

        self.apply_device_change(&config, Some((&DevicePayload::Disk(cd), HotOp::Attach)))
            .await?;

        let after = self.fetch().await?;
        if after.disk(&device_name).is_none() {
            return Err(HypervisorError::DeviceNotFound(format!(
                "{device_name} missing after attach"
            )));
        }

        info!(device = %device_name, "Removable drive attached");
        Ok(device_name)
    }

    /// Eject removable media.
    pub async fn eject_cd(&self) -> Result<String> {
        self.change_cd(None).await
    }
}
