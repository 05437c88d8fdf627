use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ces::api::routes::build_router;
use ces::api::state::AppState;
use ces::config::{Cli, Config};
use ces::manager::{ManagerConfig, SessionManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli)?;
    tokio::fs::create_dir_all(&config.workspace_root).await?;

    let manager_config = ManagerConfig {
        workspace_root: config.workspace_root.clone(),
        interpreter_command: config.interpreter_command.clone(),
        interpreter_args: config.interpreter_args.clone(),
        startup_timeout: config.startup_timeout,
        idle_timeout: config.idle_timeout,
        sweep_interval: config.sweep_interval,
    };
    let manager = SessionManager::new(manager_config);
    let sweeper = manager.spawn_sweeper();

    let state = AppState {
        manager: manager.clone(),
        config: Arc::new(config.clone()),
    };
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port).parse()?;
    info!(%addr, "starting code execution service");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    manager.shutdown(Duration::from_secs(10)).await;

    Ok(())
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("ces={level},tower_http={level}")));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
