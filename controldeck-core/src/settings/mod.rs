pub mod config;
pub mod manager;


pub use config::{DeckConfig, PermissionPolicy, PluginsConfig, Settings};
pub use manager::SettingsManager;
