//! Mock backend for testing and development.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::traits::{ControlApi, DevicePayload, HostApi};
use crate::types::*;

/// In-memory backend implementing both the control API and the host
/// resource collaborator.
///
/// Simulates domain and volume operations without a hypervisor. Useful for:
/// - Unit and integration testing
/// - Development without libvirt installed
///
/// Behavior toggles model the differences between real backends (hot-apply
/// support, guests without a shutdown agent, hypervisors with no observable
/// paused state, pools without copy-on-write).
pub struct MockBackend {
    behavior: MockBehavior,
    domains: RwLock<HashMap<String, MockDomain>>,
    volumes: RwLock<HashMap<String, MockVolume>>,
    bridges: RwLock<HashMap<String, String>>,
}

/// Tunable behavior for the mock backend.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Whether hot device application succeeds
    pub supports_hot_apply: bool,
    /// Whether graceful shutdown is available (guest agent present)
    pub graceful_shutdown_works: bool,
    /// Whether soft reboot is available
    pub soft_reboot_works: bool,
    /// Whether a paused domain reports PAUSED
    pub observable_pause: bool,
    /// Whether the document can be replaced while the domain runs
    pub allow_live_push: bool,
    /// Whether volumes support copy-on-write duplication
    pub cow_supported: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            supports_hot_apply: false,
            graceful_shutdown_works: true,
            soft_reboot_works: true,
            observable_pause: true,
            allow_live_push: true,
            cow_supported: true,
        }
    }
}

struct MockDomain {
    config: DomainConfig,
    state: PowerState,
    saved_image: bool,
    hidden_pause: bool,
    generation: u64,
    snapshots: Vec<MockSnapshot>,
}

struct MockSnapshot {
    info: SnapshotInfo,
    config: DomainConfig,
}

/// A simulated storage volume.
#[derive(Debug, Clone)]
pub struct MockVolume {
    /// Size in bytes
    pub size_bytes: u64,
    /// Owning pool
    pub pool: String,
    /// Copy-on-write base, when cloned
    pub base: Option<String>,
}

impl MockBackend {
    /// Create a new mock backend with default behavior.
    pub fn new() -> Self {
        Self::with_behavior(MockBehavior::default())
    }

    /// Create a new mock backend with the given behavior toggles.
    pub fn with_behavior(behavior: MockBehavior) -> Self {
        info!(?behavior, "Creating mock backend");
        let bridges = HashMap::from([("default".to_string(), "virbr0".to_string())]);
        Self {
            behavior,
            domains: RwLock::new(HashMap::new()),
            volumes: RwLock::new(HashMap::new()),
            bridges: RwLock::new(bridges),
        }
    }

    /// Register a network -> bridge mapping.
    pub fn add_network(&self, network: impl Into<String>, bridge: impl Into<String>) {
        if let Ok(mut bridges) = self.bridges.write() {
            bridges.insert(network.into(), bridge.into());
        }
    }

    /// Look up a volume by reference (test helper).
    pub fn volume(&self, storage_ref: &str) -> Option<MockVolume> {
        self.volumes
            .read()
            .ok()
            .and_then(|v| v.get(storage_ref).cloned())
    }

    fn lock_err() -> HypervisorError {
        HypervisorError::Internal("Lock poisoned".to_string())
    }

    fn with_domain<T>(
        &self,
        uuid: &str,
        f: impl FnOnce(&mut MockDomain) -> Result<T>,
    ) -> Result<T> {
        let mut domains = self.domains.write().map_err(|_| Self::lock_err())?;
        let domain = domains
            .get_mut(uuid)
            .ok_or_else(|| HypervisorError::NotFound(uuid.to_string()))?;
        f(domain)
    }

    fn unique_ref(volumes: &HashMap<String, MockVolume>, pool: &str, base: &str) -> String {
        let candidate = format!("{pool}/{base}");
        if !volumes.contains_key(&candidate) {
            return candidate;
        }
        let mut n = 1;
        loop {
            let candidate = format!("{pool}/{base}-{n}");
            if !volumes.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn apply_payload(config: &mut DomainConfig, payload: &DevicePayload, op: PayloadOp) -> Result<()> {
        match (op, payload) {
            (PayloadOp::Attach, DevicePayload::Disk(disk)) => config.disks.push(disk.clone()),
            (PayloadOp::Attach, DevicePayload::Nic(nic)) => config.nics.push(nic.clone()),
            (PayloadOp::Attach, DevicePayload::Controller(c)) => {
                config.controllers.push(c.clone())
            }
            (PayloadOp::Update, DevicePayload::Disk(disk)) => {
                let dev = disk.device_name();
                let existing = config
                    .disks
                    .iter_mut()
                    .find(|d| d.device_name() == dev)
                    .ok_or_else(|| HypervisorError::DeviceNotFound(dev.clone()))?;
                *existing = disk.clone();
            }
            (PayloadOp::Update, DevicePayload::Nic(nic)) => {
                let mac = nic.mac.clone().unwrap_or_default();
                let existing = config
                    .nics
                    .iter_mut()
                    .find(|n| n.mac == nic.mac)
                    .ok_or_else(|| HypervisorError::DeviceNotFound(mac))?;
                *existing = nic.clone();
            }
            (PayloadOp::Update, DevicePayload::Controller(c)) => {
                let existing = config
                    .controllers
                    .iter_mut()
                    .find(|x| x.bus == c.bus && x.index == c.index)
                    .ok_or_else(|| {
                        HypervisorError::DeviceNotFound(format!(
                            "controller {}/{}",
                            c.bus.as_str(),
                            c.index
                        ))
                    })?;
                *existing = c.clone();
            }
            (PayloadOp::Detach, DevicePayload::Disk(disk)) => {
                let dev = disk.device_name();
                let before = config.disks.len();
                config.disks.retain(|d| d.device_name() != dev);
                if config.disks.len() == before {
                    return Err(HypervisorError::DeviceNotFound(dev));
                }
            }
            (PayloadOp::Detach, DevicePayload::Nic(nic)) => {
                let before = config.nics.len();
                config.nics.retain(|n| n.mac != nic.mac);
                if config.nics.len() == before {
                    return Err(HypervisorError::DeviceNotFound(
                        nic.mac.clone().unwrap_or_default(),
                    ));
                }
            }
            (PayloadOp::Detach, DevicePayload::Controller(c)) => {
                let before = config.controllers.len();
                config
                    .controllers
                    .retain(|x| !(x.bus == c.bus && x.index == c.index));
                if config.controllers.len() == before {
                    return Err(HypervisorError::DeviceNotFound(format!(
                        "controller {}/{}",
                        c.bus.as_str(),
                        c.index
                    )));
                }
            }
        }
        Ok(())
    }

    fn hot_apply(&self, uuid: &str, payload: &DevicePayload, op: PayloadOp) -> Result<()> {
        if !self.behavior.supports_hot_apply {
            return Err(HypervisorError::Unsupported(format!(
                "hot-apply of {} not supported",
                payload.describe()
            )));
        }
        self.with_domain(uuid, |domain| {
            if domain.state != PowerState::Up {
                return Err(HypervisorError::InvalidTransition(
                    "domain is not running".to_string(),
                ));
            }
            let mut updated = domain.config.clone();
            Self::apply_payload(&mut updated, payload, op)?;
            updated.validate()?;
            domain.generation += 1;
            updated.revision = domain.generation;
            domain.config = updated;
            Ok(())
        })
    }
}

#[derive(Clone, Copy)]
enum PayloadOp {
    Attach,
    Update,
    Detach,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlApi for MockBackend {
    async fn capabilities(&self) -> Result<BackendCapabilities> {
        Ok(BackendCapabilities {
            name: "mock".to_string(),
            version: "1.0.0".to_string(),
            supports_snapshots: true,
            supports_checkpoints: true,
            observable_pause: self.behavior.observable_pause,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn fetch(&self, uuid: &str) -> Result<DomainConfig> {
        self.with_domain(uuid, |domain| {
            let mut config = domain.config.clone();
            config.revision = domain.generation;
            Ok(config)
        })
    }

    #[instrument(skip(self, config), fields(uuid = %uuid))]
    async fn push(&self, uuid: &str, config: &DomainConfig) -> Result<()> {
        config.validate()?;
        self.with_domain(uuid, |domain| {
            if !self.behavior.allow_live_push
                && matches!(domain.state, PowerState::Up | PowerState::Paused)
            {
                return Err(HypervisorError::InvalidTransition(
                    "document can only be replaced while the domain is down".to_string(),
                ));
            }
            if config.revision != domain.generation {
                return Err(HypervisorError::VersionConflict(format!(
                    "document revision {} is stale (current {})",
                    config.revision, domain.generation
                )));
            }
            domain.generation += 1;
            let mut stored = config.clone();
            stored.revision = domain.generation;
            stored.uuid = domain.config.uuid.clone();
            domain.config = stored;
            debug!("Document replaced");
            Ok(())
        })
    }

    #[instrument(skip(self, config), fields(name = %config.name))]
    async fn define(&self, config: &DomainConfig) -> Result<String> {
        config.validate()?;

        let mut domains = self.domains.write().map_err(|_| Self::lock_err())?;
        if domains.values().any(|d| d.config.name == config.name) {
            return Err(HypervisorError::InvalidConfiguration(format!(
                "domain '{}' already exists",
                config.name
            )));
        }

        let uuid = uuid::Uuid::new_v4().to_string();
        let mut stored = config.clone();
        stored.uuid = Some(uuid.clone());
        stored.revision = 1;

        domains.insert(
            uuid.clone(),
            MockDomain {
                config: stored,
                state: PowerState::Down,
                saved_image: false,
                hidden_pause: false,
                generation: 1,
                snapshots: Vec::new(),
            },
        );

        info!(%uuid, "Mock domain defined");
        Ok(uuid)
    }

    #[instrument(skip(self), fields(uuid = %uuid))]
    async fn undefine(&self, uuid: &str) -> Result<()> {
        let mut domains = self.domains.write().map_err(|_| Self::lock_err())?;
        let domain = domains
            .get(uuid)
            .ok_or_else(|| HypervisorError::NotFound(uuid.to_string()))?;

        if matches!(domain.state, PowerState::Up | PowerState::Paused) {
            return Err(HypervisorError::InvalidTransition(
                "domain must be stopped before undefine".to_string(),
            ));
        }

        domains.remove(uuid);
        info!("Mock domain undefined");
        Ok(())
    }

    async fn list_domains(&self) -> Result<Vec<DomainInfo>> {
        let domains = self.domains.read().map_err(|_| Self::lock_err())?;
        let result = domains
            .iter()
            .map(|(uuid, d)| DomainInfo {
                uuid: uuid.clone(),
                name: d.config.name.clone(),
                state: d.state,
            })
            .collect::<Vec<_>>();
        debug!(count = result.len(), "Listed domains");
        Ok(result)
    }

    async fn power_state(&self, uuid: &str) -> Result<PowerState> {
        self.with_domain(uuid, |domain| Ok(domain.state))
    }

    #[instrument(skip(self), fields(uuid = %uuid))]
    async fn start(&self, uuid: &str) -> Result<()> {
        self.with_domain(uuid, |domain| {
            match domain.state {
                PowerState::Up => Err(HypervisorError::InvalidTransition(
                    "domain is already running".to_string(),
                )),
                PowerState::Suspended => Err(HypervisorError::InvalidTransition(
                    "suspended domain must be resumed".to_string(),
                )),
                _ => {
                    domain.state = PowerState::Up;
                    Ok(())
                }
            }
        })
    }

    #[instrument(skip(self), fields(uuid = %uuid, force = force))]
    async fn shutdown(&self, uuid: &str, force: bool) -> Result<()> {
        if !force && !self.behavior.graceful_shutdown_works {
            return Err(HypervisorError::Unsupported(
                "no shutdown agent in guest".to_string(),
            ));
        }
        self.with_domain(uuid, |domain| {
            if !matches!(domain.state, PowerState::Up | PowerState::Paused) {
                return Err(HypervisorError::InvalidTransition(
                    "domain is not running".to_string(),
                ));
            }
            domain.state = PowerState::Down;
            domain.hidden_pause = false;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(uuid = %uuid))]
    async fn reboot(&self, uuid: &str) -> Result<()> {
        if !self.behavior.soft_reboot_works {
            return Err(HypervisorError::Unsupported(
                "soft reboot needs guest support".to_string(),
            ));
        }
        self.with_domain(uuid, |domain| {
            if domain.state != PowerState::Up {
                return Err(HypervisorError::InvalidTransition(
                    "domain is not running".to_string(),
                ));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(uuid = %uuid))]
    async fn suspend(&self, uuid: &str) -> Result<()> {
        self.with_domain(uuid, |domain| {
            if domain.state != PowerState::Up {
                return Err(HypervisorError::InvalidTransition(
                    "only a running domain can be suspended".to_string(),
                ));
            }
            domain.state = PowerState::Suspended;
            domain.saved_image = true;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(uuid = %uuid))]
    async fn resume(&self, uuid: &str) -> Result<()> {
        self.with_domain(uuid, |domain| {
            if domain.state != PowerState::Suspended {
                return Err(HypervisorError::InvalidTransition(
                    "domain has not been suspended".to_string(),
                ));
            }
            domain.state = PowerState::Up;
            domain.saved_image = false;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(uuid = %uuid))]
    async fn pause(&self, uuid: &str) -> Result<()> {
        let observable = self.behavior.observable_pause;
        self.with_domain(uuid, |domain| {
            if domain.state != PowerState::Up {
                return Err(HypervisorError::InvalidTransition(
                    "only a running domain can be paused".to_string(),
                ));
            }
            if observable {
                domain.state = PowerState::Paused;
            } else {
                domain.hidden_pause = true;
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(uuid = %uuid))]
    async fn unpause(&self, uuid: &str) -> Result<()> {
        let observable = self.behavior.observable_pause;
        self.with_domain(uuid, |domain| {
            if observable {
                if domain.state != PowerState::Paused {
                    return Err(HypervisorError::InvalidTransition(
                        "domain is not paused".to_string(),
                    ));
                }
                domain.state = PowerState::Up;
            } else {
                if !domain.hidden_pause {
                    return Err(HypervisorError::InvalidTransition(
                        "domain is not paused".to_string(),
                    ));
                }
                domain.hidden_pause = false;
            }
            Ok(())
        })
    }

    async fn discard_saved_state(&self, uuid: &str) -> Result<()> {
        self.with_domain(uuid, |domain| {
            domain.saved_image = false;
            if domain.state == PowerState::Suspended {
                domain.state = PowerState::Down;
            }
            Ok(())
        })
    }

    fn observes_paused_state(&self) -> bool {
        self.behavior.observable_pause
    }

    #[instrument(skip(self, device), fields(uuid = %uuid, device = %device.describe()))]
    async fn attach_device(&self, uuid: &str, device: &DevicePayload) -> Result<()> {
        self.hot_apply(uuid, device, PayloadOp::Attach)
    }

    #[instrument(skip(self, device), fields(uuid = %uuid, device = %device.describe()))]
    async fn update_device(&self, uuid: &str, device: &DevicePayload) -> Result<()> {
        self.hot_apply(uuid, device, PayloadOp::Update)
    }

    #[instrument(skip(self, device), fields(uuid = %uuid, device = %device.describe()))]
    async fn detach_device(&self, uuid: &str, device: &DevicePayload) -> Result<()> {
        self.hot_apply(uuid, device, PayloadOp::Detach)
    }

    #[instrument(skip(self), fields(uuid = %uuid, name = %name, disk_only = disk_only))]
    async fn snapshot_create(
        &self,
        uuid: &str,
        name: &str,
        description: &str,
        disk_only: bool,
    ) -> Result<SnapshotInfo> {
        self.with_domain(uuid, |domain| {
            if domain.snapshots.iter().any(|s| s.info.name == name) {
                return Err(HypervisorError::InvalidConfiguration(format!(
                    "snapshot '{name}' already exists"
                )));
            }
            let info = SnapshotInfo {
                id: uuid::Uuid::new_v4().to_string(),
                name: name.to_string(),
                description: description.to_string(),
                created_at: chrono::Utc::now(),
                domain_state: domain.state,
                disk_only,
                parent_id: domain.snapshots.last().map(|s| s.info.id.clone()),
            };
            domain.snapshots.push(MockSnapshot {
                info: info.clone(),
                config: domain.config.clone(),
            });
            info!(snapshot_id = %info.id, "Snapshot created");
            Ok(info)
        })
    }

    #[instrument(skip(self), fields(uuid = %uuid, name = %name))]
    async fn snapshot_revert(&self, uuid: &str, name: &str) -> Result<()> {
        self.with_domain(uuid, |domain| {
            let snapshot = domain
                .snapshots
                .iter()
                .find(|s| s.info.name == name)
                .ok_or_else(|| HypervisorError::SnapshotNotFound(name.to_string()))?;

            let restored_config = snapshot.config.clone();
            let restored_state = if snapshot.info.disk_only {
                PowerState::Down
            } else {
                snapshot.info.domain_state
            };

            domain.generation += 1;
            let mut config = restored_config;
            config.revision = domain.generation;
            domain.config = config;
            domain.state = restored_state;
            domain.saved_image = false;
            info!("Reverted to snapshot");
            Ok(())
        })
    }

    async fn snapshot_delete(&self, uuid: &str, name: &str) -> Result<()> {
        self.with_domain(uuid, |domain| {
            let idx = domain
                .snapshots
                .iter()
                .position(|s| s.info.name == name)
                .ok_or_else(|| HypervisorError::SnapshotNotFound(name.to_string()))?;
            domain.snapshots.remove(idx);
            info!(snapshot = %name, "Snapshot deleted");
            Ok(())
        })
    }

    async fn snapshot_list(&self, uuid: &str) -> Result<Vec<SnapshotInfo>> {
        self.with_domain(uuid, |domain| {
            Ok(domain.snapshots.iter().map(|s| s.info.clone()).collect())
        })
    }
}

#[async_trait]
impl HostApi for MockBackend {
    #[instrument(skip(self), fields(pool = %pool, size_bytes = size_bytes))]
    async fn create_storage(
        &self,
        size_bytes: u64,
        pool: &str,
        name: Option<&str>,
    ) -> Result<String> {
        let mut volumes = self.volumes.write().map_err(|_| Self::lock_err())?;
        let base = match name {
            Some(n) => n.to_string(),
            None => format!("vol-{}", &uuid::Uuid::new_v4().to_string()[..8]),
        };
        let storage_ref = Self::unique_ref(&volumes, pool, &base);
        volumes.insert(
            storage_ref.clone(),
            MockVolume {
                size_bytes,
                pool: pool.to_string(),
                base: None,
            },
        );
        info!(storage_ref = %storage_ref, "Volume created");
        Ok(storage_ref)
    }

    #[instrument(skip(self), fields(source = %source, new_name = %new_name, mode = %mode.as_str()))]
    async fn duplicate_storage(
        &self,
        source: &str,
        new_name: &str,
        mode: CloneMode,
    ) -> Result<String> {
        let mut volumes = self.volumes.write().map_err(|_| Self::lock_err())?;
        let origin = volumes
            .get(source)
            .cloned()
            .ok_or_else(|| HypervisorError::NotFound(source.to_string()))?;

        if mode == CloneMode::Clone && !self.behavior.cow_supported {
            return Err(HypervisorError::Unsupported(
                "pool does not support copy-on-write".to_string(),
            ));
        }

        let storage_ref = Self::unique_ref(&volumes, &origin.pool, new_name);
        volumes.insert(
            storage_ref.clone(),
            MockVolume {
                size_bytes: origin.size_bytes,
                pool: origin.pool,
                base: (mode == CloneMode::Clone).then(|| source.to_string()),
            },
        );
        info!(storage_ref = %storage_ref, "Volume duplicated");
        Ok(storage_ref)
    }

    #[instrument(skip(self), fields(storage_ref = %storage_ref))]
    async fn destroy_storage(&self, storage_ref: &str) -> Result<()> {
        let mut volumes = self.volumes.write().map_err(|_| Self::lock_err())?;
        if volumes.remove(storage_ref).is_none() {
            warn!("Volume not found");
            return Err(HypervisorError::NotFound(storage_ref.to_string()));
        }
        info!("Volume destroyed");
        Ok(())
    }

    async fn resolve_bridge(&self, network: &str) -> Result<String> {
        let bridges = self.bridges.read().map_err(|_| Self::lock_err())?;
        bridges
            .get(network)
            .cloned()
            .ok_or_else(|| HypervisorError::NotFound(format!("network '{network}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_define_and_power_cycle() {
        let backend = MockBackend::new();
        let config = DomainConfig::new("cycle-test");

        let uuid = backend.define(&config).await.unwrap();
        assert_eq!(
            backend.power_state(&uuid).await.unwrap(),
            PowerState::Down
        );

        backend.start(&uuid).await.unwrap();
        assert_eq!(backend.power_state(&uuid).await.unwrap(), PowerState::Up);

        backend.pause(&uuid).await.unwrap();
        assert_eq!(
            backend.power_state(&uuid).await.unwrap(),
            PowerState::Paused
        );

        backend.unpause(&uuid).await.unwrap();
        backend.shutdown(&uuid, false).await.unwrap();
        assert_eq!(
            backend.power_state(&uuid).await.unwrap(),
            PowerState::Down
        );

        backend.undefine(&uuid).await.unwrap();
        assert!(matches!(
            backend.power_state(&uuid).await,
            Err(HypervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let backend = MockBackend::new();
        backend.define(&DomainConfig::new("twin")).await.unwrap();
        assert!(matches!(
            backend.define(&DomainConfig::new("twin")).await,
            Err(HypervisorError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_push_conflicts() {
        let backend = MockBackend::new();
        let uuid = backend.define(&DomainConfig::new("stale")).await.unwrap();

        let doc = backend.fetch(&uuid).await.unwrap();
        backend.push(&uuid, &doc).await.unwrap();

        // same projection again: fetched before the intervening push
        assert!(matches!(
            backend.push(&uuid, &doc).await,
            Err(HypervisorError::VersionConflict(_))
        ));

        // a fresh fetch carries the new revision
        let doc = backend.fetch(&uuid).await.unwrap();
        backend.push(&uuid, &doc).await.unwrap();
    }

    #[tokio::test]
    async fn test_hot_attach_needs_support() {
        let backend = MockBackend::new();
        let uuid = backend.define(&DomainConfig::new("hot")).await.unwrap();
        backend.start(&uuid).await.unwrap();

        let disk = DiskConfig::new("pool/hot.qcow2", DiskAddress::new(DiskBus::Virtio, 0, 0));
        let payload = DevicePayload::Disk(disk);

        assert!(matches!(
            backend.attach_device(&uuid, &payload).await,
            Err(HypervisorError::Unsupported(_))
        ));

        let backend = MockBackend::with_behavior(MockBehavior {
            supports_hot_apply: true,
            ..Default::default()
        });
        let uuid = backend.define(&DomainConfig::new("hot")).await.unwrap();
        backend.start(&uuid).await.unwrap();
        backend.attach_device(&uuid, &payload).await.unwrap();
        assert_eq!(backend.fetch(&uuid).await.unwrap().disks.len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_revert_restores_document() {
        let backend = MockBackend::new();
        let config = DomainConfig::new("snap").with_disk(DiskConfig::new(
            "pool/snap.qcow2",
            DiskAddress::new(DiskBus::Virtio, 0, 0),
        ));
        let uuid = backend.define(&config).await.unwrap();

        backend
            .snapshot_create(&uuid, "before", "", true)
            .await
            .unwrap();

        let mut doc = backend.fetch(&uuid).await.unwrap();
        doc.disks.push(DiskConfig::new(
            "pool/extra.qcow2",
            DiskAddress::new(DiskBus::Virtio, 0, 1),
        ));
        backend.push(&uuid, &doc).await.unwrap();
        assert_eq!(backend.fetch(&uuid).await.unwrap().disks.len(), 2);

        backend.snapshot_revert(&uuid, "before").await.unwrap();
        assert_eq!(backend.fetch(&uuid).await.unwrap().disks.len(), 1);

        backend.snapshot_delete(&uuid, "before").await.unwrap();
        assert!(backend.snapshot_list(&uuid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_volume_duplication_modes() {
        let backend = MockBackend::new();
        let source = backend
            .create_storage(10 * GIB, "pool", Some("base.qcow2"))
            .await
            .unwrap();

        let cloned = backend
            .duplicate_storage(&source, "base-clone1.qcow2", CloneMode::Clone)
            .await
            .unwrap();
        assert_eq!(backend.volume(&cloned).unwrap().base.as_deref(), Some(source.as_str()));

        let copied = backend
            .duplicate_storage(&source, "base-copy.qcow2", CloneMode::Copy)
            .await
            .unwrap();
        assert!(backend.volume(&copied).unwrap().base.is_none());

        let no_cow = MockBackend::with_behavior(MockBehavior {
            cow_supported: false,
            ..Default::default()
        });
        let source = no_cow
            .create_storage(GIB, "pool", Some("flat.img"))
            .await
            .unwrap();
        assert!(matches!(
            no_cow
                .duplicate_storage(&source, "flat-clone1.img", CloneMode::Clone)
                .await,
            Err(HypervisorError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_bridge() {
        let backend = MockBackend::new();
        assert_eq!(backend.resolve_bridge("default").await.unwrap(), "virbr0");

        backend.add_network("lab", "xenbr1");
        assert_eq!(backend.resolve_bridge("lab").await.unwrap(), "xenbr1");

        assert!(matches!(
            backend.resolve_bridge("missing").await,
            Err(HypervisorError::NotFound(_))
        ));
    }
}
