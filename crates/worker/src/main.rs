use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobhost_queue::BrokerConfig;
use jobhost_worker::{Orchestrator, ShutdownTrigger, WorkerRegistry};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobhost_worker=debug,jobhost_queue=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Broker ---
    let broker = BrokerConfig::from_env();
    let backend = match jobhost_queue::connect(&broker).await {
        Ok(backend) => backend,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to the broker");
            std::process::exit(1);
        }
    };

    // --- Workers ---
    let registry = WorkerRegistry::builtin(backend);
    let mut orchestrator =
        Orchestrator::new(registry).with_launch_interval(Orchestrator::launch_interval_from_env());

    // A signal during the staggered launch stops it; whatever was already
    // launched is drained below.
    let early = tokio::select! {
        launched = orchestrator.launch_all() => match launched {
            Ok(count) => {
                tracing::info!(count, "Worker host running");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to launch workers");
                Some(ShutdownTrigger::Fatal(e.to_string()))
            }
        },
        trigger = shutdown_signal() => Some(trigger),
    };

    let trigger = match early {
        Some(trigger) => trigger,
        None => tokio::select! {
            trigger = shutdown_signal() => trigger,
            reason = orchestrator.wait_for_fatal() => {
                tracing::error!(reason = %reason, "Fatal worker failure");
                ShutdownTrigger::Fatal(reason)
            }
        },
    };

    orchestrator.shutdown().await;

    let code = trigger.exit_code();
    tracing::info!(?trigger, code, "Worker host exiting");
    std::process::exit(code);
}

/// Wait for SIGINT or SIGTERM.
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
            tracing::info!("Received SIGINT (Ctrl-C), shutting down workers");
            ShutdownTrigger::Interrupt
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down workers");
            ShutdownTrigger::Terminate
        }
    }
}
