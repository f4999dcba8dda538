//! Binary entry point: wire the components, serve, shut down gracefully.

use std::sync::Arc;

use catnip::agent::AgentSessionIndex;
use catnip::bus::{ContainerStatus, Event, EventBus};
use catnip::config::{AppConfig, SHUTDOWN_DRAIN};
use catnip::git::SystemGit;
use catnip::pty::SessionManager;
use catnip::routes;
use catnip::worktree::WorktreeManager;
use catnip::{AppState, NullPullRequestProvider};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "catnip=debug,info".parse().expect("valid env filter")),
        )
        .init();

    let config = AppConfig::from_env();
    for dir in [&config.workspace_root, &config.state_dir] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!("failed to create {}: {e}", dir.display());
        }
    }

    let bus = Arc::new(EventBus::new());
    let manager = WorktreeManager::new(config.clone(), Arc::new(SystemGit::new()), bus.clone());
    let (pty, title_rx) = SessionManager::new(config.clone(), bus.clone());
    manager.set_session_stopper(pty.clone());
    let agent_index = AgentSessionIndex::new(config.clone(), manager.clone());

    // All in-memory state is rebuilt from the filesystem.
    manager.bootstrap().await;
    agent_index.bootstrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut background = manager.start(shutdown_rx.clone());
    background.push(bus.start_heartbeat(shutdown_rx.clone()));
    background.push(agent_index.start(shutdown_rx.clone(), title_rx));

    bus.emit(Event::ContainerStatus(ContainerStatus {
        status: "running".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    }));

    let state = Arc::new(AppState {
        config: config.clone(),
        bus: bus.clone(),
        manager: manager.clone(),
        pty: pty.clone(),
        agent_index,
        pr_provider: Arc::new(NullPullRequestProvider),
    });
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .expect("failed to bind listen address");
    tracing::info!("catnip listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Stop accepting work, drain the background workers, close the PTYs.
    let _ = shutdown_tx.send(true);
    let drain = async {
        for task in background {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
        tracing::warn!("background workers did not drain within {SHUTDOWN_DRAIN:?}");
    }
    pty.shutdown_all();
    tracing::info!("catnip stopped");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
