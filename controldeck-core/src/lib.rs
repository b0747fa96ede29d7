pub mod error;
pub mod module;
pub mod persistence;
pub mod plugin;
pub mod redact;
pub mod settings;
pub mod supervisor;

// Public library API - embedders building their own front end should only
// need these.
pub use error::{ActionError, CheckError, DiscoveryError, LoadError, RegistryError};
pub use module::{ModuleKinds, ServiceModule};
pub use plugin::{CommandOutcome, DeckHost};
pub use settings::{Settings, SettingsManager};
pub use supervisor::{Action, StatusEntry, StatusSnapshot};
