//! Built-in worker modules.
//!
//! To add a job type, create a submodule implementing
//! [`WorkerModule`](crate::module::WorkerModule) and list it in [`manifest`].

pub mod example;

use std::sync::Arc;

use crate::module::ModuleRef;

/// Every built-in module, in launch order.
pub fn manifest() -> Vec<ModuleRef> {
    vec![Arc::new(example::ExampleModule)]
}
