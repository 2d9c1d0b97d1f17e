use std::sync::Arc;

use jobhost_worker::WorkerRegistry;

use crate::config::ServerConfig;

/// Shared application state available to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Worker modules and the broker backend their queues live on.
    pub registry: WorkerRegistry,
    /// Server configuration (token secret, dashboard switch, timeouts).
    pub config: Arc<ServerConfig>,
}
