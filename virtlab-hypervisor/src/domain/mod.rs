//! The domain handle: lifecycle, devices and snapshots over a control API.
//!
//! A [`Domain`] pairs a backend connection with one VM's identity and the
//! last-fetched document. Operations follow a fetch-mutate-push or
//! issue-poll discipline and are not safe to run concurrently against the
//! same domain; callers serialize per domain. Distinct domains may be
//! driven fully in parallel.

mod devices;
mod power;
mod snapshots;

pub use devices::{DiskSpec, NicSpec};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::naming;
use crate::traits::{ControlApi, HostApi};
use crate::types::*;

/// Per-domain capability flags.
#[derive(Debug, Clone, Copy)]
pub struct DomainCapabilities {
    /// Whether the guest recognizes dynamically applied devices. Off by
    /// default; hot-apply support is undiscoverable ahead of time.
    pub hot_apply: bool,
}

impl Default for DomainCapabilities {
    fn default() -> Self {
        Self { hot_apply: false }
    }
}

/// Polling parameters for state transitions.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    /// Interval between state reads
    pub interval: Duration,
    /// Per-operation deadline
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Handle to a single domain.
pub struct Domain {
    api: Arc<dyn ControlApi>,
    host: Arc<dyn HostApi>,
    uuid: String,
    name: String,
    caps: DomainCapabilities,
    poll: PollPolicy,
    cached: Mutex<Option<DomainConfig>>,
}

/// What to install: identity, sizing, storage and networks for a new domain.
#[derive(Debug, Clone)]
pub struct InstallSpec {
    pub name: String,
    pub os_hint: Option<String>,
    pub vcpus: u32,
    pub memory_mib: u64,
    /// Storage pool for all created disks
    pub pool: String,
    pub root_disk_gib: u64,
    pub disk_format: DiskFormat,
    pub disk_bus: DiskBus,
    /// Additional disks, by size
    pub extra_disks_gib: Vec<u64>,
    /// Symbolic networks; one NIC per entry
    pub networks: Vec<String>,
    pub boot: Vec<BootDevice>,
}

impl InstallSpec {
    pub fn new(name: impl Into<String>, pool: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            os_hint: None,
            vcpus: 2,
            memory_mib: 2048,
            pool: pool.into(),
            root_disk_gib: 16,
            disk_format: DiskFormat::Qcow2,
            disk_bus: DiskBus::Virtio,
            extra_disks_gib: Vec::new(),
            networks: vec!["default".to_string()],
            boot: vec![BootDevice::Disk],
        }
    }

    pub fn with_os_hint(mut self, hint: impl Into<String>) -> Self {
        self.os_hint = Some(hint.into());
        self
    }

    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    pub fn with_memory(mut self, memory_mib: u64) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    pub fn with_root_disk(mut self, size_gib: u64) -> Self {
        self.root_disk_gib = size_gib;
        self
    }

    pub fn with_extra_disk(mut self, size_gib: u64) -> Self {
        self.extra_disks_gib.push(size_gib);
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.networks.push(network.into());
        self
    }
}

impl Domain {
    /// Wrap an already-defined domain.
    pub fn attach_handle(
        api: Arc<dyn ControlApi>,
        host: Arc<dyn HostApi>,
        uuid: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api,
            host,
            uuid: uuid.into(),
            name: name.into(),
            caps: DomainCapabilities::default(),
            poll: PollPolicy::default(),
            cached: Mutex::new(None),
        }
    }

    /// Find an existing domain by name.
    pub async fn connect(
        api: Arc<dyn ControlApi>,
        host: Arc<dyn HostApi>,
        name: &str,
    ) -> Result<Self> {
        let info = api
            .list_domains()
            .await?
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| HypervisorError::NotFound(name.to_string()))?;
        Ok(Self::attach_handle(api, host, info.uuid, info.name))
    }

    /// Install a new domain: allocate backing storage, resolve networks,
    /// define the document. The domain is left powered off.
    #[instrument(skip(api, host, spec), fields(name = %spec.name))]
    pub async fn install(
        api: Arc<dyn ControlApi>,
        host: Arc<dyn HostApi>,
        spec: InstallSpec,
    ) -> Result<Self> {
        info!(
            vcpus = spec.vcpus,
            memory_mib = spec.memory_mib,
            "Installing domain"
        );

        let mut config = DomainConfig::new(&spec.name)
            .with_vcpus(spec.vcpus)
            .with_memory(spec.memory_mib);
        config.os_hint = spec.os_hint.clone();
        config.boot = spec.boot.clone();

        let root_name = format!("{}.{}", spec.name, spec.disk_format.as_str());
        let root_ref = host
            .create_storage(spec.root_disk_gib * GIB, &spec.pool, Some(&root_name))
            .await?;
        let mut root = DiskConfig::new(root_ref, DiskAddress::new(spec.disk_bus, 0, 0));
        root.size_gib = spec.root_disk_gib;
        root.format = spec.disk_format;
        config.disks.push(root);

        for &size_gib in &spec.extra_disks_gib {
            let slot = naming::next_free_slot(&config, spec.disk_bus, 0)?;
            let address = DiskAddress::new(spec.disk_bus, 0, slot);
            let vol_name = format!(
                "{}-{}.{}",
                spec.name,
                address.device_name(),
                spec.disk_format.as_str()
            );
            let vol_ref = host
                .create_storage(size_gib * GIB, &spec.pool, Some(&vol_name))
                .await?;
            let mut disk = DiskConfig::new(vol_ref, address);
            disk.size_gib = size_gib;
            disk.format = spec.disk_format;
            config.disks.push(disk);
        }

        for (i, network) in spec.networks.iter().enumerate() {
            let bridge = host.resolve_bridge(network).await?;
            let mut nic = NicConfig::new(network.clone());
            nic.index = i as u32;
            nic.mac = Some(random_mac());
            nic.bridge = Some(bridge);
            config.nics.push(nic);
        }

        config.validate()?;
        let uuid = api.define(&config).await?;

        info!(%uuid, "Domain installed");

        Ok(Self::attach_handle(api, host, uuid, spec.name))
    }

    /// The domain's UUID.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The domain's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the capability flags.
    pub fn with_capabilities(mut self, caps: DomainCapabilities) -> Self {
        self.caps = caps;
        self
    }

    /// Replace the polling parameters.
    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn capabilities(&self) -> DomainCapabilities {
        self.caps
    }

    pub(crate) fn control(&self) -> &Arc<dyn ControlApi> {
        &self.api
    }

    pub(crate) fn host(&self) -> &Arc<dyn HostApi> {
        &self.host
    }

    pub(crate) fn poll_policy(&self) -> PollPolicy {
        self.poll
    }

    /// Fetch the current document from the backend, refreshing the local
    /// projection.
    pub async fn fetch(&self) -> Result<DomainConfig> {
        let config = self.api.fetch(&self.uuid).await?;
        *self.cached.lock().expect("cache lock") = Some(config.clone());
        Ok(config)
    }

    /// Validate and push a mutated document, then re-fetch so the local
    /// projection reflects what the backend actually holds.
    pub async fn push(&self, config: &DomainConfig) -> Result<DomainConfig> {
        config.validate()?;
        self.api.push(&self.uuid, config).await?;
        self.fetch().await
    }

    /// The last-fetched document, if any. Valid only immediately after a
    /// fetch or push; any externally issued change invalidates it.
    pub fn cached_config(&self) -> Option<DomainConfig> {
        self.cached.lock().expect("cache lock").clone()
    }

    pub(crate) fn invalidate_cache(&self) {
        *self.cached.lock().expect("cache lock") = None;
    }

    /// Set the vCPU count. Only valid while the domain is powered off.
    #[instrument(skip(self), fields(domain = %self.name))]
    pub async fn set_vcpus(&self, vcpus: u32) -> Result<()> {
        let state = self.power_state().await?;
        if state != PowerState::Down {
            return Err(HypervisorError::InvalidTransition(format!(
                "vCPUs can only be changed while powered off (state {state})"
            )));
        }
        let mut config = self.fetch().await?;
        config.vcpus = vcpus;
        self.push(&config).await?;
        info!(vcpus, "vCPU count updated");
        Ok(())
    }

    /// Set current memory in MiB. Valid while powered off; with the
    /// hot-apply capability, a running domain's current allocation may be
    /// ballooned live (the maximum is fixed while running).
    #[instrument(skip(self), fields(domain = %self.name))]
    pub async fn set_memory(&self, memory_mib: u64) -> Result<()> {
        let state = self.power_state().await?;
        let mut config = self.fetch().await?;
        match state {
            PowerState::Down => {
                config.memory.current_mib = memory_mib;
                config.memory.max_mib = memory_mib;
            }
            PowerState::Up if self.caps.hot_apply => {
                if memory_mib > config.memory.max_mib {
                    return Err(HypervisorError::InvalidConfiguration(format!(
                        "live memory {memory_mib} MiB exceeds maximum {} MiB",
                        config.memory.max_mib
                    )));
                }
                config.memory.current_mib = memory_mib;
            }
            other => {
                return Err(HypervisorError::InvalidTransition(format!(
                    "memory can only be changed while powered off (state {other})"
                )));
            }
        }
        self.push(&config).await?;
        info!(memory_mib, "Memory updated");
        Ok(())
    }

    /// Remove the domain and free its writable disks' backing storage.
    ///
    /// Refused while the domain runs unless `force`, which performs the
    /// explicit force-shutdown first.
    #[instrument(skip(self), fields(domain = %self.name, force = force))]
    pub async fn uninstall(&self, force: bool) -> Result<()> {
        let state = self.power_state().await?;
        if matches!(state, PowerState::Up | PowerState::Paused) {
            if !force {
                return Err(HypervisorError::InvalidTransition(
                    "domain is running; shut it down first or uninstall with force".to_string(),
                ));
            }
            self.shutdown(true).await?;
        }

        if self.power_state().await? == PowerState::Suspended {
            self.api.discard_saved_state(&self.uuid).await?;
        }

        let config = self.api.fetch(&self.uuid).await?;
        self.api.undefine(&self.uuid).await?;

        for disk in &config.disks {
            if disk.device == DeviceKind::Disk && !disk.readonly && !disk.source.is_empty() {
                if let Err(e) = self.host.destroy_storage(&disk.source).await {
                    warn!(source = %disk.source, error = %e, "Could not destroy backing storage");
                }
            }
        }

        self.invalidate_cache();
        info!("Domain uninstalled");
        Ok(())
    }
}

/// Explicit context mapping domain names to handles.
///
/// Created at run start and torn down at run end; there is no global
/// registry.
#[derive(Default)]
pub struct DomainRegistry {
    domains: RwLock<HashMap<String, Arc<Domain>>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a domain under its name. Replaces any previous entry.
    pub fn insert(&self, domain: Arc<Domain>) {
        let mut domains = self.domains.write().expect("registry lock");
        domains.insert(domain.name().to_string(), domain);
    }

    /// Look up a domain by name.
    pub fn get(&self, name: &str) -> Option<Arc<Domain>> {
        self.domains.read().expect("registry lock").get(name).cloned()
    }

    /// Drop a domain from the context. Does not touch the backend.
    pub fn remove(&self, name: &str) -> Option<Arc<Domain>> {
        self.domains.write().expect("registry lock").remove(name)
    }

    /// Registered names.
    pub fn names(&self) -> Vec<String> {
        self.domains
            .read()
            .expect("registry lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Tear down the context.
    pub fn clear(&self) {
        self.domains.write().expect("registry lock").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackend;

    fn fast_poll() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(500),
        }
    }

    async fn installed(backend: Arc<MockBackend>) -> Domain {
        Domain::install(
            backend.clone(),
            backend,
            InstallSpec::new("ctx-vm", "pool").with_extra_disk(5),
        )
        .await
        .unwrap()
        .with_poll_policy(fast_poll())
    }

    #[tokio::test]
    async fn test_install_creates_storage_and_nics() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed(backend.clone()).await;

        let config = domain.fetch().await.unwrap();
        assert_eq!(config.disks.len(), 2);
        assert_eq!(config.disks[0].address.device_name(), "vda");
        assert_eq!(config.disks[1].address.device_name(), "vdb");
        assert!(backend.volume(&config.disks[0].source).is_some());
        assert_eq!(config.nics.len(), 1);
        assert!(config.nics[0].mac.is_some());
        assert_eq!(config.nics[0].bridge.as_deref(), Some("virbr0"));
        assert_eq!(domain.power_state().await.unwrap(), PowerState::Down);
    }

    #[tokio::test]
    async fn test_set_vcpus_requires_powered_off() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed(backend).await;

        domain.set_vcpus(8).await.unwrap();
        assert_eq!(domain.fetch().await.unwrap().vcpus, 8);

        domain.start().await.unwrap();
        assert!(matches!(
            domain.set_vcpus(4).await,
            Err(HypervisorError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_uninstall_refused_while_running() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed(backend.clone()).await;
        domain.start().await.unwrap();

        assert!(matches!(
            domain.uninstall(false).await,
            Err(HypervisorError::InvalidTransition(_))
        ));

        // with force the explicit shutdown happens first
        let root = domain.fetch().await.unwrap().disks[0].source.clone();
        domain.uninstall(true).await.unwrap();
        assert!(backend.volume(&root).is_none());
        assert!(matches!(
            domain.fetch().await,
            Err(HypervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_finds_existing_domain() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed(backend.clone()).await;

        let handle = Domain::connect(backend.clone(), backend.clone(), "ctx-vm")
            .await
            .unwrap();
        assert_eq!(handle.uuid(), domain.uuid());

        assert!(matches!(
            Domain::connect(backend.clone(), backend, "missing").await,
            Err(HypervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_set_memory_rules() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed(backend).await;

        // powered off: current and max both move
        domain.set_memory(1024).await.unwrap();
        let memory = domain.fetch().await.unwrap().memory;
        assert_eq!(memory.current_mib, 1024);
        assert_eq!(memory.max_mib, 1024);

        // running without the hot-apply capability: refused
        domain.start().await.unwrap();
        assert!(matches!(
            domain.set_memory(512).await,
            Err(HypervisorError::InvalidTransition(_))
        ));

        // running with it: the current allocation balloons, max is fixed
        let backend = Arc::new(MockBackend::new());
        let domain = installed(backend)
            .await
            .with_capabilities(DomainCapabilities { hot_apply: true });
        domain.start().await.unwrap();
        domain.set_memory(512).await.unwrap();
        let memory = domain.fetch().await.unwrap().memory;
        assert_eq!(memory.current_mib, 512);
        assert_eq!(memory.max_mib, 2048);

        assert!(matches!(
            domain.set_memory(4096).await,
            Err(HypervisorError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_round_trip() {
        let backend = Arc::new(MockBackend::new());
        let registry = DomainRegistry::new();
        let domain = Arc::new(installed(backend).await);

        registry.insert(domain.clone());
        assert!(registry.get("ctx-vm").is_some());
        assert_eq!(registry.names(), vec!["ctx-vm".to_string()]);

        registry.remove("ctx-vm");
        assert!(registry.get("ctx-vm").is_none());
    }

    #[tokio::test]
    async fn test_cached_config_tracks_fetch() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed(backend).await;

        assert!(domain.cached_config().is_none());
        domain.fetch().await.unwrap();
        assert!(domain.cached_config().is_some());

        // push(fetch()) with no intervening mutation changes nothing visible
        let before = domain.fetch().await.unwrap();
        let after = domain.push(&before).await.unwrap();
        assert_eq!(before.disks, after.disks);
        assert_eq!(before.nics, after.nics);
        assert_eq!(before.controllers, after.controllers);
    }
}
