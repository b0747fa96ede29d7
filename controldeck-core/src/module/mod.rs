//! The contract every service module satisfies, and the registry of module
//! kinds that turn service definitions into live modules.

pub mod command;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::plugin::manifest::{ServiceDefinition, COMMAND_KIND};

/// Control surface for one external service (daemon, container, process).
///
/// Implementations may block: the host only ever calls these from worker
/// threads and enforces its own deadlines. Any state an implementation needs
/// lives inside the implementing value; the host provides no shared slot
/// between modules.
pub trait ServiceModule: Send + Sync {
    /// Display name.
    fn name(&self) -> String;

    /// Unique identifier across all loaded modules.
    fn id(&self) -> String;

    fn is_running(&self) -> Result<bool>;

    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// Extra status text, collected after a successful status check.
    fn details(&self) -> String {
        String::new()
    }

    fn icon(&self) -> Option<String> {
        None
    }

    /// Whether `restart` is the module's own operation. When false the host
    /// performs stop followed by start itself.
    fn has_custom_restart(&self) -> bool {
        false
    }

    fn restart(&self) -> Result<()> {
        self.stop()?;
        self.start()
    }

    fn can_remove(&self) -> bool {
        false
    }

    fn remove(&self) -> Result<()> {
        bail!("'{}' does not support removal", self.id())
    }
}

impl fmt::Debug for dyn ServiceModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceModule")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

/// Builds zero or more modules from one definition.
pub type KindConstructor =
    Arc<dyn Fn(&ServiceDefinition) -> Result<Vec<Arc<dyn ServiceModule>>> + Send + Sync>;

/// Module kinds available to the loader, selected by a definition's `kind`.
#[derive(Clone)]
pub struct ModuleKinds {
    constructors: HashMap<String, KindConstructor>,
}

impl ModuleKinds {
    /// Registry with only the built-in `command` kind.
    pub fn new() -> Self {
        let mut kinds = Self {
            constructors: HashMap::new(),
        };
        kinds.register(COMMAND_KIND, |definition| {
            let module = command::CommandModule::from_definition(definition)?;
            Ok(vec![Arc::new(module) as Arc<dyn ServiceModule>])
        });
        kinds
    }

    pub fn register<F>(&mut self, kind: &str, constructor: F)
    where
        F: Fn(&ServiceDefinition) -> Result<Vec<Arc<dyn ServiceModule>>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(kind.to_string(), Arc::new(constructor));
    }

    pub fn get(&self, kind: &str) -> Option<KindConstructor> {
        self.constructors.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ModuleKinds {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModuleKinds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleKinds")
            .field("kinds", &self.names())
            .finish()
    }
}
