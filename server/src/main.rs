use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use overpass_core::Config;
use overpass_core::Orchestrator;
use overpass_server::AppState;
use overpass_server::build_router;
use overpass_state::SessionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env());
    let store = SessionStore::open(&config.session_db_path)
        .await
        .context("failed to open session store")?;
    let orchestrator = Arc::new(Orchestrator::new(Arc::clone(&config), store));
    orchestrator.bootstrap_mcp().await;

    let state = AppState {
        orchestrator: Arc::clone(&orchestrator),
    };
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on {addr} (provider: {:?})", config.provider);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&orchestrator)))
        .await
        .context("server error")?;
    Ok(())
}

/// Wait for ctrl-c or SIGTERM, then close every MCP client so their child
/// processes do not outlive us.
async fn shutdown_signal(orchestrator: Arc<Orchestrator>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutting down; closing MCP clients");
    orchestrator.mcp().close_all().await;
}
