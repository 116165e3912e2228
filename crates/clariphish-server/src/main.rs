//! ClariPhish - tracking server entry point

use anyhow::{Context, Result};
use clariphish_api::{create_router, AppState};
use clariphish_common::config::{Config, LoggingConfig};
use clariphish_core::{CampaignManager, DispatchEngine, Metrics, Outbox, SmtpMailer, TrackingService};
use clariphish_storage::{DatabasePool, Repositories};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration comes first so logging can honour it
    let config = Config::load().context("Refusing to start")?;
    init_logging(&config.logging);

    info!("Starting ClariPhish tracking server...");

    // Initialize database
    let db_pool = DatabasePool::new(&config.database).await?;
    info!("Database connection established");

    // Run migrations
    db_pool.migrate().await?;
    info!("Database migrations completed");

    let repos = Repositories::postgres(db_pool.clone());
    let metrics = Metrics::new().context("Failed to register metrics")?;
    let shutdown = CancellationToken::new();

    // Tracking writes that hit a storage fault are retried by the outbox worker
    let (outbox, worker) = Outbox::new(&config.outbox, repos.events.clone(), metrics.clone());
    match worker.replay_spool().await {
        Ok(report) if report.respooled > 0 || report.retained > 0 => {
            warn!(
                respooled = report.respooled,
                retained = report.retained,
                "Some spooled tracking writes are still pending"
            );
        }
        Ok(_) => {}
        Err(e) => error!(error = %e, path = %outbox.spool_path().display(), "Failed to replay outbox spool"),
    }
    let outbox_handle = tokio::spawn(worker.run(shutdown.clone()));

    let tracking = TrackingService::new(
        repos.clone(),
        outbox,
        metrics.clone(),
        config.tracking.fallback_redirect.clone(),
    );

    let mailer = Arc::new(SmtpMailer::new(Duration::from_secs(
        config.dispatch.send_timeout_secs,
    )));
    let engine = DispatchEngine::new(repos.clone(), mailer, metrics.clone(), &config.dispatch)?;
    let campaigns = Arc::new(CampaignManager::new(
        repos.clone(),
        Arc::new(engine),
        config.server.public_url.clone(),
    ));

    let state = AppState::new(
        repos,
        tracking,
        campaigns.clone(),
        metrics,
        &config.api,
        &config.tracking,
    );
    let app = create_router(state, &config.api.cors_origins);

    let addr = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    let signal = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
        signal.cancel();
    })
    .await?;

    // Stop in-flight dispatches, then let the outbox spool what it still holds
    shutdown.cancel();
    campaigns.shutdown().await;
    if let Err(e) = outbox_handle.await {
        error!(error = %e, "Outbox worker failed");
    }
    db_pool.pool().close().await;

    info!("ClariPhish shutdown complete");

    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},clariphish=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
