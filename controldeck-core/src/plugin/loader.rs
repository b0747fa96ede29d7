//! Turns module descriptors into live service modules.
//!
//! Loading runs four stages, each short-circuiting:
//! 1. the source must parse;
//! 2. at least one complete service or factory definition must exist
//!    (incomplete ones are skipped with a warning);
//! 3. declared permissions must be granted by the host policy;
//! 4. instantiation, behind a panic boundary.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{panic_message, LoadError};
use crate::module::command::{expand_factory, CommandModule};
use crate::module::{ModuleKinds, ServiceModule};
use crate::redact::redact_credentials;
use crate::settings::config::PermissionPolicy;

use super::manifest::{FactoryDefinition, ModuleSource, ServiceDefinition, COMMAND_KIND};
use super::types::ModuleDescriptor;

/// Outcome of validating a source without instantiating it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub module: String,
    pub version: String,
    /// Ids of complete `[[service]]` definitions.
    pub services: Vec<String>,
    /// Number of complete `[[factory]]` definitions.
    pub factories: usize,
    /// Why each incomplete definition was skipped.
    pub skipped: Vec<String>,
}

/// Definitions that survived stage 2.
#[derive(Default)]
struct UsableDefinitions {
    services: Vec<ServiceDefinition>,
    factories: Vec<FactoryDefinition>,
    skipped: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ModuleLoader {
    kinds: ModuleKinds,
    policy: PermissionPolicy,
}

impl ModuleLoader {
    pub fn new(kinds: ModuleKinds, policy: PermissionPolicy) -> Self {
        Self { kinds, policy }
    }

    pub fn kinds(&self) -> &ModuleKinds {
        &self.kinds
    }

    pub fn policy(&self) -> &PermissionPolicy {
        &self.policy
    }

    /// Runs stages 1 to 3.
    pub fn validate(&self, descriptor: &ModuleDescriptor) -> Result<ValidationReport, LoadError> {
        let usable = self.check(descriptor)?;
        Ok(ValidationReport {
            module: descriptor.id.clone(),
            version: descriptor.version.clone(),
            services: usable
                .services
                .iter()
                .filter_map(|s| s.id.clone())
                .collect(),
            factories: usable.factories.len(),
            skipped: usable.skipped,
        })
    }

    /// Runs all four stages. May block: factories run their list commands.
    pub fn load(
        &self,
        descriptor: &ModuleDescriptor,
    ) -> Result<Vec<Arc<dyn ServiceModule>>, LoadError> {
        let usable = self.check(descriptor)?;
        let module = descriptor.id.as_str();

        let mut instances: Vec<Arc<dyn ServiceModule>> = Vec::new();
        for definition in &usable.services {
            instances.extend(self.instantiate(module, definition)?);
        }
        for factory in &usable.factories {
            instances.extend(self.instantiate_factory(module, factory)?);
        }

        let mut seen = HashSet::new();
        for instance in &instances {
            let id = guarded(module, || Ok(instance.id()))?;
            if id.trim().is_empty() {
                return Err(LoadError::InitFailed {
                    module: module.to_string(),
                    cause: "a service reported an empty id".to_string(),
                });
            }
            if !seen.insert(id.clone()) {
                return Err(LoadError::DuplicateId {
                    id,
                    existing: module.to_string(),
                });
            }
        }

        debug!(module = %module, "Loaded {} service instances", instances.len());
        Ok(instances)
    }

    /// Stages 1 to 3.
    fn check(&self, descriptor: &ModuleDescriptor) -> Result<UsableDefinitions, LoadError> {
        let origin = descriptor.origin.to_string();

        if let Some(error) = &descriptor.metadata_error {
            return Err(LoadError::InvalidSource {
                origin,
                message: error.clone(),
            });
        }
        let source = ModuleSource::parse(&descriptor.content).map_err(|e| {
            LoadError::InvalidSource {
                origin: origin.clone(),
                message: format!("{e:#}"),
            }
        })?;

        let usable = self.usable_definitions(source);
        for reason in &usable.skipped {
            warn!(module = %descriptor.id, "Skipping definition: {}", reason);
        }
        if usable.services.is_empty() && usable.factories.is_empty() {
            return Err(LoadError::NoModulesFound { origin });
        }

        if let Some(permission) = self.policy.first_denied(&descriptor.permissions) {
            return Err(LoadError::PermissionDenied {
                module: descriptor.id.clone(),
                permission,
            });
        }

        Ok(usable)
    }

    fn usable_definitions(&self, source: ModuleSource) -> UsableDefinitions {
        let mut usable = UsableDefinitions::default();

        for (index, service) in source.services.into_iter().enumerate() {
            let label = service
                .id
                .clone()
                .unwrap_or_else(|| format!("service #{}", index + 1));
            match self.incomplete_reason(&service.kind, || service.missing_command_field()) {
                Some(reason) => usable.skipped.push(format!("{label}: {reason}")),
                None => usable.services.push(service),
            }
        }

        for (index, factory) in source.factories.into_iter().enumerate() {
            let label = format!("factory #{}", index + 1);
            match self.incomplete_reason(&factory.kind, || factory.missing_command_field()) {
                Some(reason) => usable.skipped.push(format!("{label}: {reason}")),
                None => usable.factories.push(factory),
            }
        }

        usable
    }

    fn incomplete_reason(
        &self,
        kind: &str,
        missing_command_field: impl FnOnce() -> Option<&'static str>,
    ) -> Option<String> {
        if !self.kinds.contains(kind) {
            return Some(format!("unknown kind '{kind}'"));
        }
        if kind == COMMAND_KIND {
            return missing_command_field().map(|field| format!("missing '{field}'"));
        }
        None
    }

    fn instantiate(
        &self,
        module: &str,
        definition: &ServiceDefinition,
    ) -> Result<Vec<Arc<dyn ServiceModule>>, LoadError> {
        let constructor = self.kinds.get(&definition.kind).ok_or_else(|| {
            LoadError::InitFailed {
                module: module.to_string(),
                cause: format!("unknown kind '{}'", definition.kind),
            }
        })?;
        guarded(module, || constructor(definition))
    }

    fn instantiate_factory(
        &self,
        module: &str,
        factory: &FactoryDefinition,
    ) -> Result<Vec<Arc<dyn ServiceModule>>, LoadError> {
        if factory.kind != COMMAND_KIND {
            return self.instantiate(module, &factory_definition(factory));
        }

        let rendered = guarded(module, || expand_factory(factory))?;
        let mut instances: Vec<Arc<dyn ServiceModule>> = Vec::with_capacity(rendered.len());
        for definition in rendered {
            if let Some(field) = definition.missing_command_field() {
                warn!(module = %module, "Skipping factory record without '{}'", field);
                continue;
            }
            let instance = guarded(module, || CommandModule::from_definition(&definition))?;
            instances.push(Arc::new(instance));
        }
        Ok(instances)
    }
}

/// Definition handed to a registered kind's constructor for a `[[factory]]`.
fn factory_definition(factory: &FactoryDefinition) -> ServiceDefinition {
    let mut definition = factory.template.clone().unwrap_or_default();
    definition.kind = factory.kind.clone();
    definition.shell |= factory.shell;
    definition.timeout_secs = definition.timeout_secs.or(factory.timeout_secs);
    for (key, value) in &factory.options {
        definition
            .options
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
    definition
}

/// Runs module code, turning errors and panics into `InitFailed`.
fn guarded<T>(module: &str, f: impl FnOnce() -> anyhow::Result<T>) -> Result<T, LoadError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(LoadError::InitFailed {
            module: module.to_string(),
            cause: redact_credentials(&format!("{e:#}")),
        }),
        Err(payload) => Err(LoadError::InitFailed {
            module: module.to_string(),
            cause: format!("panicked: {}", panic_message(payload.as_ref())),
        }),
    }
}
