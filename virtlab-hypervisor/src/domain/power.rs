//! Guarded, polled power transitions.
//!
//! Every transition issues a command and then polls the backend until the
//! target state or a deadline. A timeout is fatal: there is no silent
//! retry, and the caller must re-fetch true state before using the domain
//! again.

use tokio::time::{sleep, Instant};
use tracing::{info, instrument, warn};

use crate::error::{HypervisorError, Result};
use crate::types::PowerState;

use super::Domain;
use std::time::Duration;

impl Domain {
    /// Read the current power state from the backend.
    pub async fn power_state(&self) -> Result<PowerState> {
        self.control().power_state(self.uuid()).await
    }

    /// Poll until the domain reaches `target` or the deadline passes.
    pub async fn wait_for(&self, target: PowerState, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.power_state().await?;
            if state == target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HypervisorError::Timeout {
                    operation: format!(
                        "waiting for domain '{}' to be {target} (currently {state})",
                        self.name()
                    ),
                    waited: timeout,
                });
            }
            sleep(self.poll_policy().interval).await;
        }
    }

    async fn wait_default(&self, target: PowerState) -> Result<()> {
        self.wait_for(target, self.poll_policy().timeout).await
    }

    /// Start a powered-off domain and wait for it to come up.
    ///
    /// A suspended domain cannot be started; it must be resumed.
    #[instrument(skip(self), fields(domain = %self.name()))]
    pub async fn start(&self) -> Result<()> {
        match self.power_state().await? {
            PowerState::Suspended => {
                return Err(HypervisorError::InvalidTransition(
                    "domain is suspended; resume it instead of starting".to_string(),
                ))
            }
            PowerState::Up => {
                return Err(HypervisorError::InvalidTransition(
                    "domain is already running".to_string(),
                ))
            }
            _ => {}
        }

        self.control().start(self.uuid()).await?;
        self.wait_default(PowerState::Up).await?;
        self.invalidate_cache();
        info!("Domain started");
        Ok(())
    }

    /// Stop a running domain and wait for it to go down.
    ///
    /// The graceful path is tried first; when the guest cannot honor it
    /// (no shutdown agent, or the request errors) the stop is forced.
    /// `force` skips the graceful attempt entirely.
    #[instrument(skip(self), fields(domain = %self.name(), force = force))]
    pub async fn shutdown(&self, force: bool) -> Result<()> {
        if self.power_state().await? == PowerState::Down {
            info!("Domain already down");
            return Ok(());
        }

        if force {
            self.control().shutdown(self.uuid(), true).await?;
        } else {
            match self.control().shutdown(self.uuid(), false).await {
                Ok(()) => {}
                Err(e @ HypervisorError::NotFound(_)) => return Err(e),
                Err(e @ HypervisorError::InvalidTransition(_)) => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Graceful shutdown failed; forcing stop");
                    self.control().shutdown(self.uuid(), true).await?;
                }
            }
        }

        self.wait_default(PowerState::Down).await?;
        self.invalidate_cache();
        info!("Domain stopped");
        Ok(())
    }

    /// Reboot a running domain and wait for it to be up again.
    ///
    /// Falls back to a forced stop and start when the backend cannot
    /// soft-reboot the guest.
    #[instrument(skip(self), fields(domain = %self.name()))]
    pub async fn reboot(&self) -> Result<()> {
        if self.power_state().await? != PowerState::Up {
            return Err(HypervisorError::InvalidTransition(
                "only a running domain can be rebooted".to_string(),
            ));
        }

        match self.control().reboot(self.uuid()).await {
            Ok(()) => {}
            Err(e @ HypervisorError::NotFound(_)) => return Err(e),
            Err(e) => {
                warn!(error = %e, "Soft reboot failed; forcing stop and start");
                self.control().shutdown(self.uuid(), true).await?;
                self.wait_default(PowerState::Down).await?;
                self.control().start(self.uuid()).await?;
            }
        }

        self.wait_default(PowerState::Up).await?;
        self.invalidate_cache();
        info!("Domain rebooted");
        Ok(())
    }

    /// Suspend a running domain to a saved image and wait for it.
    #[instrument(skip(self), fields(domain = %self.name()))]
    pub async fn suspend(&self) -> Result<()> {
        if self.power_state().await? != PowerState::Up {
            return Err(HypervisorError::InvalidTransition(
                "only a running domain can be suspended".to_string(),
            ));
        }

        self.control().suspend(self.uuid()).await?;
        self.wait_default(PowerState::Suspended).await?;
        self.invalidate_cache();
        info!("Domain suspended");
        Ok(())
    }

    /// Resume a suspended domain and wait for it to come up.
    #[instrument(skip(self), fields(domain = %self.name()))]
    pub async fn resume(&self) -> Result<()> {
        if self.power_state().await? != PowerState::Suspended {
            return Err(HypervisorError::InvalidTransition(
                "domain has not been suspended".to_string(),
            ));
        }

        self.control().resume(self.uuid()).await?;
        self.wait_default(PowerState::Up).await?;
        self.invalidate_cache();
        info!("Domain resumed");
        Ok(())
    }

    /// Freeze a running domain.
    ///
    /// Backends without an observable paused state are not polled after
    /// the command is issued.
    #[instrument(skip(self), fields(domain = %self.name()))]
    pub async fn pause(&self) -> Result<()> {
        if self.power_state().await? != PowerState::Up {
            return Err(HypervisorError::InvalidTransition(
                "only a running domain can be paused".to_string(),
            ));
        }

        self.control().pause(self.uuid()).await?;
        if self.control().observes_paused_state() {
            self.wait_default(PowerState::Paused).await?;
        }
        info!("Domain paused");
        Ok(())
    }

    /// Unfreeze a paused domain and wait for it to run.
    #[instrument(skip(self), fields(domain = %self.name()))]
    pub async fn unpause(&self) -> Result<()> {
        self.control().unpause(self.uuid()).await?;
        self.wait_default(PowerState::Up).await?;
        info!("Domain unpaused");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::{DomainRegistry, InstallSpec, PollPolicy};
    use super::*;
    use crate::domain::Domain;
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
            InstallSpec::new(name, "pool"),
        )
        .await
        .unwrap()
        .with_poll_policy(fast_poll())
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed_on(backend, "cycle").await;

        domain.start().await.unwrap();
        assert_eq!(domain.power_state().await.unwrap(), PowerState::Up);

        domain.shutdown(false).await.unwrap();
        assert_eq!(domain.power_state().await.unwrap(), PowerState::Down);
    }

    #[tokio::test]
    async fn test_start_rejected_while_suspended() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed_on(backend, "susp").await;

        domain.start().await.unwrap();
        domain.suspend().await.unwrap();
        assert_eq!(
            domain.power_state().await.unwrap(),
            PowerState::Suspended
        );

        // start != resume
        assert!(matches!(
            domain.start().await,
            Err(HypervisorError::InvalidTransition(_))
        ));

        domain.resume().await.unwrap();
        assert_eq!(domain.power_state().await.unwrap(), PowerState::Up);
    }

    #[tokio::test]
    async fn test_resume_rejected_unless_suspended() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed_on(backend, "res").await;

        // DOWN
        assert!(matches!(
            domain.resume().await,
            Err(HypervisorError::InvalidTransition(_))
        ));

        // UP
        domain.start().await.unwrap();
        assert!(matches!(
            domain.resume().await,
            Err(HypervisorError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_graceful_shutdown_falls_back_to_force() {
        let backend = Arc::new(MockBackend::with_behavior(MockBehavior {
            graceful_shutdown_works: false,
            ..Default::default()
        }));
        let domain = installed_on(backend, "agentless").await;

        domain.start().await.unwrap();
        domain.shutdown(false).await.unwrap();
        assert_eq!(domain.power_state().await.unwrap(), PowerState::Down);
    }

    #[tokio::test]
    async fn test_reboot_falls_back_to_stop_start() {
        let backend = Arc::new(MockBackend::with_behavior(MockBehavior {
            soft_reboot_works: false,
            ..Default::default()
        }));
        let domain = installed_on(backend, "noreboot").await;

        domain.start().await.unwrap();
        domain.reboot().await.unwrap();
        assert_eq!(domain.power_state().await.unwrap(), PowerState::Up);
    }

    #[tokio::test]
    async fn test_pause_unpause() {
        let backend = Arc::new(MockBackend::new());
        let domain = installed_on(backend, "pausable").await;

        domain.start().await.unwrap();
        domain.pause().await.unwrap();
        assert_eq!(domain.power_state().await.unwrap(), PowerState::Paused);

        domain.unpause().await.unwrap();
        assert_eq!(domain.power_state().await.unwrap(), PowerState::Up);
    }

    #[tokio::test]
    async fn test_pause_without_observable_state_skips_poll() {
        let backend = Arc::new(MockBackend::with_behavior(MockBehavior {
            observable_pause: false,
            ..Default::default()
        }));
        let domain = installed_on(backend, "blindpause").await;

        domain.start().await.unwrap();
        // the backend never reports PAUSED; pause must not poll for it
        domain.pause().await.unwrap();
        assert_eq!(domain.power_state().await.unwrap(), PowerState::Up);

        domain.unpause().await.unwrap();
        assert_eq!(domain.power_state().await.unwrap(), PowerState::Up);
    }

    #[tokio::test]
    async fn test_domains_progress_independently() {
        let backend = Arc::new(MockBackend::new());
        let registry = DomainRegistry::new();
        let a = Arc::new(installed_on(backend.clone(), "worker-a").await);
        let b = Arc::new(installed_on(backend, "worker-b").await);
        registry.insert(a.clone());
        registry.insert(b.clone());

        let (ra, rb) = tokio::join!(a.start(), b.start());
        ra.unwrap();
        rb.unwrap();

        a.shutdown(true).await.unwrap();
        assert_eq!(a.power_state().await.unwrap(), PowerState::Down);
        assert_eq!(b.power_state().await.unwrap(), PowerState::Up);

        registry.clear();
    }
}
