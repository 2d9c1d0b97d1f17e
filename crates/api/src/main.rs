use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobhost_api::config::ServerConfig;
use jobhost_api::router::build_app_router;
use jobhost_api::state::AppState;
use jobhost_queue::BrokerConfig;
use jobhost_worker::{ShutdownTrigger, WorkerRegistry};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobhost_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Config ---
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Refusing to start without a token secret");
            std::process::exit(1);
        }
    };
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Broker ---
    let broker = BrokerConfig::from_env();
    let backend = match jobhost_queue::connect(&broker).await {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to the broker");
            std::process::exit(1);
        }
    };

    let registry = WorkerRegistry::builtin(backend);
    match registry.list_modules() {
        Ok(modules) => tracing::info!(queues = modules.len(), "Worker registry loaded"),
        Err(e) => {
            tracing::error!(error = %e, "Invalid worker manifest");
            std::process::exit(1);
        }
    }

    if config.dashboard_enabled {
        tracing::info!("Serving queue dashboard at /ui");
    }

    let state = AppState {
        registry,
        config: Arc::new(config.clone()),
    };
    let app = build_app_router(state, &config);

    // --- Serve ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");
    tracing::info!("Mint an access token with `cargo run --bin mint-token`");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    let (trigger_tx, trigger_rx) = tokio::sync::oneshot::channel();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = trigger_tx.send(shutdown_signal().await);
        })
        .await;

    if let Err(e) = served {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }

    let code = trigger_rx.await.map(|t| t.exit_code()).unwrap_or(0);
    tracing::info!(code, "Graceful shutdown complete");
    std::process::exit(code);
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by a process
/// manager.
async fn shutdown_signal() -> ShutdownTrigger {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
            ShutdownTrigger::Interrupt
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
            ShutdownTrigger::Terminate
        }
    }
}
