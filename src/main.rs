//! portal-orders HTTP entry point: config, tracing, the router and the
//! background hard-delete sweep.
use anyhow::Context;
use portal_orders::api::{self, AppState};
use portal_orders::config::PortalConfig;
use portal_orders::types::{Actor, Role};
use portal_orders::Portal;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info};

const SWEEP_ACTOR: &str = "SYSTEM-SWEEP";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PortalConfig::load().context("load portal config")?;
    init_tracing();

    let portal = Portal::open(&config.db_path, config.retention_days)
        .with_context(|| format!("open database at {}", config.db_path.display()))?;
    spawn_sweeper(portal.clone(), Duration::from_secs(config.sweep_interval_secs));

    let state = Arc::new(AppState::new(portal.clone(), config.feed_limit));
    let app = api::build_router(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    info!(addr = %config.bind_addr, db = %config.db_path.display(), "portal-orders listening");
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    portal.flush().context("flush database")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Runs the sweep every `every`. Sled calls block, so each run goes to the
/// blocking pool.
fn spawn_sweeper(portal: Portal, every: Duration) {
    tokio::spawn(async move {
        let actor = Actor::new(SWEEP_ACTOR, Role::Admin);
        let mut ticker = tokio::time::interval(every);
        // the first tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let portal = portal.clone();
            let actor = actor.clone();
            match tokio::task::spawn_blocking(move || portal.archive.hard_delete_sweep(&actor)).await {
                Ok(Ok(report)) => info!(
                    deleted = report.deleted.len(),
                    failed = report.failed.len(),
                    "scheduled sweep done"
                ),
                Ok(Err(e)) => error!(error = %e, "scheduled sweep failed"),
                Err(e) => error!(error = %e, "scheduled sweep panicked"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutting down");
}
