//! # virtlab Hypervisor
//!
//! VM lifecycle orchestration over a libvirt-style control API.
//!
//! The crate models a domain's configuration as a typed, replaceable
//! document, drives power transitions as guarded polled operations, names
//! devices deterministically across storage controllers, and duplicates
//! domains through a narrow storage collaborator.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 Domain handle                │
//! │  power / devices / snapshots / clone-copy    │
//! └───────────┬──────────────────────┬───────────┘
//!             │                      │
//!             ▼                      ▼
//! ┌───────────────────┐    ┌───────────────────┐
//! │    ControlApi     │    │      HostApi      │
//! │ (fetch/push/poll) │    │ (storage, bridge) │
//! └─────────┬─────────┘    └───────────────────┘
//!           │
//!     ┌─────┴──────┐
//!     ▼            ▼
//! ┌─────────┐ ┌──────────┐
//! │  Mock   │ │ Libvirt  │
//! │ backend │ │ backend  │
//! └─────────┘ └──────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use virtlab_hypervisor::{Domain, InstallSpec, MockBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = Arc::new(MockBackend::new());
//!
//!     let domain = Domain::install(
//!         backend.clone(),
//!         backend,
//!         InstallSpec::new("my-vm", "pool").with_vcpus(4).with_memory(4096),
//!     )
//!     .await
//!     .unwrap();
//!
//!     domain.start().await.unwrap();
//! }
//! ```

pub mod domain;
pub mod error;
pub mod libvirt;
pub mod mock;
pub mod naming;
pub mod traits;
pub mod types;
mod xml;

pub use domain::{
    DiskSpec, Domain, DomainCapabilities, DomainRegistry, InstallSpec, NicSpec, PollPolicy,
};
pub use error::HypervisorError;
pub use mock::{MockBackend, MockBehavior};
pub use traits::{ControlApi, DevicePayload, HostApi};
pub use types::*;
pub use xml::{parse_domain_xml, DomainXmlBuilder};

// Re-export libvirt backend when available
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtBackend;
