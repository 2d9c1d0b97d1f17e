//! Lookup of worker modules by queue name.
//!
//! The manifest is re-read on every call, so lookups always reflect the
//! current module set.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use jobhost_queue::{Queue, SharedBackend};

use crate::module::ModuleRef;
use crate::modules;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Queue name '{0}' is declared by more than one worker module")]
    DuplicateQueue(String),

    #[error("Invalid queue name '{0}': must be non-empty and must not contain ':'")]
    InvalidQueueName(String),
}

type Manifest = Arc<dyn Fn() -> Vec<ModuleRef> + Send + Sync>;

#[derive(Clone)]
pub struct WorkerRegistry {
    manifest: Manifest,
    backend: SharedBackend,
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("backend_prefix", &self.backend.prefix())
            .finish_non_exhaustive()
    }
}

impl WorkerRegistry {
    pub fn new(
        manifest: impl Fn() -> Vec<ModuleRef> + Send + Sync + 'static,
        backend: SharedBackend,
    ) -> Self {
        Self {
            manifest: Arc::new(manifest),
            backend,
        }
    }

    /// Registry over the modules compiled into this crate.
    pub fn builtin(backend: SharedBackend) -> Self {
        Self::new(modules::manifest, backend)
    }

    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// Every module, in manifest order.
    pub fn list_modules(&self) -> Result<Vec<ModuleRef>, RegistryError> {
        let modules = (self.manifest)();
        let mut seen = HashSet::new();

        for module in &modules {
            let name = module.queue_name();
            if name.is_empty() || name.contains(':') {
                return Err(RegistryError::InvalidQueueName(name.to_string()));
            }
            if !seen.insert(name) {
                return Err(RegistryError::DuplicateQueue(name.to_string()));
            }
        }

        Ok(modules)
    }

    /// One queue handle per module, in manifest order.
    pub fn list_queues(&self) -> Result<Vec<Queue>, RegistryError> {
        Ok(self
            .list_modules()?
            .iter()
            .map(|module| module.create_queue(&self.backend))
            .collect())
    }

    /// The module whose queue name is exactly `name`, if any.
    pub fn find_by_name(&self, name: &str) -> Result<Option<ModuleRef>, RegistryError> {
        Ok(self
            .list_modules()?
            .into_iter()
            .find(|module| module.queue_name() == name))
    }

    pub fn find_queue(&self, name: &str) -> Result<Option<Queue>, RegistryError> {
        Ok(self
            .find_by_name(name)?
            .map(|module| module.create_queue(&self.backend)))
    }
}
