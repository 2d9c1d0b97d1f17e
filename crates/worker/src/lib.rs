//! Worker host: the module contract, the built-in modules, the registry
//! that looks them up, and the orchestrator that runs them.

pub mod module;
pub mod modules;
pub mod orchestrator;
pub mod registry;

pub use module::{ModuleRef, WorkerModule};
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorState, ShutdownTrigger};
pub use registry::{RegistryError, WorkerRegistry};
