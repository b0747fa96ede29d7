//! Module sources: discovery, loading, installation and lifecycle.
//!
//! ## Module Discovery
//!
//! Module sources are discovered from multiple locations in priority order:
//! 1. `.controldeck/plugins/` in each workspace (highest priority)
//! 2. `~/.controldeck/plugins/`
//! 3. The system directory (`/etc/controldeck/plugins/` by default)
//! 4. Additional configured directories
//! 5. Remote repositories (lowest priority)
//!
//! The first source to provide a module id wins; later copies are reported
//! as superseded.

pub mod discovery;
pub mod installer;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod registry;
pub mod remote;
pub mod types;

pub use discovery::{DiscoveryReport, DiscoverySource, ModuleDiscovery};
pub use installer::{InstallSource, ModuleStore};
pub use loader::{ModuleLoader, ValidationReport};
pub use manager::{CommandOutcome, DeckHost, DeckHostBuilder};
pub use manifest::{FactoryDefinition, ModuleSource, Removable, ServiceDefinition};
pub use registry::{
    InstallOutcome, LifecycleRegistry, ModuleHandle, PluginEntry, PluginHealth, RestoreReport,
};
pub use remote::{HttpRepositoryClient, RepositoryClient};
pub use types::{ModuleDescriptor, ModuleOrigin, Permission, SourceTier, SupersededDescriptor};
