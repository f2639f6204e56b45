//! Snapshots, checkpoints and domain duplication.

use futures::future::try_join_all;
use tracing::{debug, info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::types::*;

use super::Domain;

/// Pick a name for a duplicated volume: reuse the source volume's name with
/// the domain name substituted, or prefix it with the new domain's name.
fn duplicate_volume_name(source: &str, source_domain: &str, new_domain: &str) -> String {
    let basename = source.rsplit('/').next().unwrap_or(source);
    if basename.contains(source_domain) {
        basename.replace(source_domain, new_domain)
    } else {
        format!("{new_domain}-{basename}")
    }
}

impl Domain {
    /// Take a disk-only snapshot. The domain may be running; running memory
    /// is not captured.
    #[instrument(skip(self), fields(domain = %self.name(), name = %name))]
    pub async fn snapshot(&self, name: &str) -> Result<SnapshotInfo> {
        let info = self
            .control()
            .snapshot_create(self.uuid(), name, "", true)
            .await?;
        info!(snapshot_id = %info.id, "Snapshot created");
        Ok(info)
    }

    /// Take a checkpoint: disks plus running memory, so a revert restores
    /// the exact point in a live domain's execution.
    #[instrument(skip(self), fields(domain = %self.name(), name = %name))]
    pub async fn checkpoint(&self, name: &str) -> Result<SnapshotInfo> {
        let caps = self.control().capabilities().await?;
        if !caps.supports_checkpoints {
            return Err(HypervisorError::Unsupported(format!(
                "backend '{}' cannot capture running memory",
                caps.name
            )));
        }

        let info = self
            .control()
            .snapshot_create(self.uuid(), name, "", false)
            .await?;
        info!(snapshot_id = %info.id, "Checkpoint created");
        Ok(info)
    }

    /// Revert to a named snapshot. Storage is restored; a checkpoint also
    /// restores the captured power state. The domain keeps its name.
    #[instrument(skip(self), fields(domain = %self.name(), name = %name))]
    pub async fn revert(&self, name: &str) -> Result<()> {
        self.control().snapshot_revert(self.uuid(), name).await?;
        self.invalidate_cache();
        info!("Reverted to snapshot");
        Ok(())
    }

    /// Delete a named snapshot.
    #[instrument(skip(self), fields(domain = %self.name(), name = %name))]
    pub async fn remove_snapshot(&self, name: &str) -> Result<()> {
        self.control().snapshot_delete(self.uuid(), name).await?;
        info!("Snapshot removed");
        Ok(())
    }

    /// List this domain's snapshots.
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        self.control().snapshot_list(self.uuid()).await
    }

    /// Duplicate this domain into an independent new one.
    ///
    /// The source must be powered off. Each writable disk's backing storage
    /// is duplicated under a generated name; `Clone` asks for copy-on-write
    /// and downgrades to a full copy where the pool cannot provide one.
    /// When a disk cannot be duplicated at all it keeps pointing at the
    /// original reference (removable media always does). Every NIC gets a
    /// fresh MAC. The new domain has no ownership link back to the source.
    #[instrument(skip(self), fields(domain = %self.name(), mode = %mode.as_str()))]
    pub async fn clone_or_copy(&self, mode: CloneMode, new_name: Option<&str>) -> Result<Domain> {
        if self.power_state().await? != PowerState::Down {
            return Err(HypervisorError::InvalidTransition(
                "cannot duplicate a running domain".to_string(),
            ));
        }

        let config = self.fetch().await?;
        let new_name = match new_name {
            Some(name) => name.to_string(),
            None => self.generate_clone_name().await?,
        };

        info!(new_name = %new_name, "Duplicating domain");

        // disk duplication across distinct volumes may run in parallel
        let duplications = config.disks.iter().map(|disk| {
            let host = self.host().clone();
            let disk = disk.clone();
            let source_domain = self.name().to_string();
            let new_domain = new_name.clone();
            async move {
                if disk.device == DeviceKind::Cdrom || disk.readonly || disk.source.is_empty() {
                    debug!(device = %disk.device_name(), "Sharing non-duplicable medium");
                    return Ok(disk);
                }

                let vol_name = duplicate_volume_name(&disk.source, &source_domain, &new_domain);
                let duplicated = match mode {
                    CloneMode::Copy => {
                        match host
                            .duplicate_storage(&disk.source, &vol_name, CloneMode::Copy)
                            .await
                        {
                            Ok(storage_ref) => Some(storage_ref),
                            Err(
                                HypervisorError::Unsupported(reason)
                                | HypervisorError::BackendUnavailable(reason),
                            ) => {
                                warn!(
                                    source = %disk.source,
                                    %reason,
                                    "Disk not duplicable; new domain keeps the original reference"
                                );
                                None
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    CloneMode::Clone => {
                        match host
                            .duplicate_storage(&disk.source, &vol_name, CloneMode::Clone)
                            .await
                        {
                            Ok(storage_ref) => Some(storage_ref),
                            Err(HypervisorError::Unsupported(reason)) => {
                                warn!(
                                    source = %disk.source,
                                    %reason,
                                    "Copy-on-write unavailable; downgrading to full copy"
                                );
                                match host
                                    .duplicate_storage(&disk.source, &vol_name, CloneMode::Copy)
                                    .await
                                {
                                    Ok(storage_ref) => Some(storage_ref),
                                    Err(
                                        HypervisorError::Unsupported(reason)
                                        | HypervisorError::BackendUnavailable(reason),
                                    ) => {
                                        warn!(
                                            source = %disk.source,
                                            %reason,
                                            "Disk not duplicable; new domain keeps the original reference"
                                        );
                                        None
                                    }
                                    Err(e) => return Err(e),
                                }
                            }
                            Err(HypervisorError::BackendUnavailable(reason)) => {
                                warn!(
                                    source = %disk.source,
                                    %reason,
                                    "Disk not duplicable; new domain keeps the original reference"
                                );
                                None
                            }
                            Err(e) => return Err(e),
                        }
                    }
                };

                let mut duplicated_disk = disk;
                if let Some(storage_ref) = duplicated {
                    duplicated_disk.source = storage_ref;
                }
                Ok(duplicated_disk)
            }
        });
        let disks = try_join_all(duplications).await?;

        let mut new_config = config.clone();
        new_config.name = new_name.clone();
        new_config.uuid = None;
        new_config.revision = 0;
        new_config.disks = disks;
        for nic in &mut new_config.nics {
            nic.mac = Some(random_mac());
        }

        new_config.validate()?;
        let uuid = self.control().define(&new_config).await?;

        info!(%uuid, "Duplicate defined");

        Ok(Domain::attach_handle(
            self.control().clone(),
            self.host().clone(),
            uuid,
            new_name,
        )
        .with_capabilities(self.capabilities())
        .with_poll_policy(self.poll_policy()))
    }

    async fn generate_clone_name(&self) -> Result<String> {
        let prefix = format!("{}-clone", self.name());
        let mut highest = 0u32;
        for existing in self.control().list_domains().await? {
            if let Some(rest) = existing.name.strip_prefix(&prefix) {
                if let Ok(n) = rest.parse::<u32>() {
                    highest = highest.max(n);
                }
            }
        }
        Ok(format!("{prefix}{}", highest + 1))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::{InstallSpec, PollPolicy};
    use super::*;
    use crate::domain::{DiskSpec, Domain};
    use crate::mock::{MockBackend, MockBehavior};

    fn fast_poll() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(5),
            timeout: Duration::from_millis(500),
        }
    }

    async fn installed_on(backend: Arc<MockBackend>, name: &str) -> Domain {
        Domain::install(
            backend.clone(),
            backend,
            InstallSpec::new(name, "pool").with_extra_disk(4),
        )
        .await
        .unwrap()
        .with_poll_policy(fast_poll())
    }

    #[test]
    fn test_duplicate_volume_name() {
        assert_eq!(
            duplicate_volume_name("pool/src.qcow2", "src", "dst"),
            "dst.qcow2"
        );
        assert_eq!(
            duplicate_volume_name("pool/unrelated.img", "src", "dst"),
            "dst-unrelated.img"
        );
    }

    #[tokio::test]
    async fn test_clone_running_domain_rejected() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed_on(backend, "busy").await;
        domain.start().await.unwrap();

        assert!(matches!(
            domain.clone_or_copy(CloneMode::Clone, None).await,
            Err(HypervisorError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_clone_is_independent_of_source() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed_on(backend.clone(), "origin").await;

        let source_config = domain.fetch().await.unwrap();
        assert_eq!(source_config.disks.len(), 2);
        assert_eq!(source_config.nics.len(), 1);

        let clone = domain
            .clone_or_copy(CloneMode::Clone, Some("origin-b"))
            .await
            .unwrap();
        let clone_config = clone.fetch().await.unwrap();

        // distinct storage references, fresh MAC
        assert_eq!(clone_config.disks.len(), 2);
        for (src, dup) in source_config.disks.iter().zip(&clone_config.disks) {
            assert_ne!(src.source, dup.source);
            assert!(backend.volume(&dup.source).is_some());
        }
        assert_ne!(clone_config.nics[0].mac, source_config.nics[0].mac);
        assert_ne!(clone_config.uuid, source_config.uuid);

        // destroying the source leaves the clone intact
        domain.uninstall(false).await.unwrap();
        let still_there = clone.fetch().await.unwrap();
        for disk in &still_there.disks {
            assert!(backend.volume(&disk.source).is_some());
        }
        clone.start().await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_mode_is_full_duplication() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed_on(backend.clone(), "flat").await;

        let copy = domain
            .clone_or_copy(CloneMode::Copy, Some("flat-copy"))
            .await
            .unwrap();
        for disk in &copy.fetch().await.unwrap().disks {
            assert!(backend.volume(&disk.source).unwrap().base.is_none());
        }
    }

    #[tokio::test]
    async fn test_clone_downgrades_to_copy_without_cow() {
        let backend = Arc::new(MockBackend::with_behavior(MockBehavior {
            cow_supported: false,
            ..Default::default()
        }));
        let domain = installed_on(backend.clone(), "nocow").await;

        let clone = domain
            .clone_or_copy(CloneMode::Clone, Some("nocow-b"))
            .await
            .unwrap();
        let config = clone.fetch().await.unwrap();
        for (src, dup) in domain
            .fetch()
            .await
            .unwrap()
            .disks
            .iter()
            .zip(&config.disks)
        {
            // duplicated, but as a full copy
            assert_ne!(src.source, dup.source);
            assert!(backend.volume(&dup.source).unwrap().base.is_none());
        }
    }

    #[tokio::test]
    async fn test_clone_shares_removable_media() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed_on(backend, "cdrom").await;
        domain.change_cd(Some("isos/tools.iso")).await.unwrap();

        let clone = domain
            .clone_or_copy(CloneMode::Clone, Some("cdrom-b"))
            .await
            .unwrap();
        let cd = clone
            .fetch()
            .await
            .unwrap()
            .disks
            .iter()
            .find(|d| d.device == DeviceKind::Cdrom)
            .cloned()
            .unwrap();
        assert_eq!(cd.source, "isos/tools.iso");
    }

    #[tokio::test]
    async fn test_generated_clone_names_count_up() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed_on(backend, "serial").await;

        let first = domain.clone_or_copy(CloneMode::Clone, None).await.unwrap();
        assert_eq!(first.name(), "serial-clone1");

        let second = domain.clone_or_copy(CloneMode::Clone, None).await.unwrap();
        assert_eq!(second.name(), "serial-clone2");
    }

    #[tokio::test]
    async fn test_checkpoint_revert_restores_running_state() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed_on(backend, "chk").await;
        domain.start().await.unwrap();

        domain.checkpoint("live-point").await.unwrap();

        domain.shutdown(true).await.unwrap();
        assert_eq!(domain.power_state().await.unwrap(), PowerState::Down);

        domain.revert("live-point").await.unwrap();
        assert_eq!(domain.power_state().await.unwrap(), PowerState::Up);
    }

    #[tokio::test]
    async fn test_disk_only_snapshot_revert_leaves_domain_down() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed_on(backend, "disksnap").await;
        domain.start().await.unwrap();

        let info = domain.snapshot("disks-only").await.unwrap();
        assert!(info.disk_only);

        domain.shutdown(true).await.unwrap();
        domain.revert("disks-only").await.unwrap();
        assert_eq!(domain.power_state().await.unwrap(), PowerState::Down);
    }

    #[tokio::test]
    async fn test_snapshot_revert_restores_devices() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed_on(backend, "devsnap").await;

        domain.snapshot("two-disks").await.unwrap();
        domain.attach_disk(DiskSpec::new(1, "pool")).await.unwrap();
        assert_eq!(domain.fetch().await.unwrap().disks.len(), 3);

        domain.revert("two-disks").await.unwrap();
        assert_eq!(domain.fetch().await.unwrap().disks.len(), 2);

        domain.remove_snapshot("two-disks").await.unwrap();
        assert!(domain.list_snapshots().await.unwrap().is_empty());
        assert!(matches!(
            domain.revert("two-disks").await,
            Err(HypervisorError::SnapshotNotFound(_))
        ));
    }
}
