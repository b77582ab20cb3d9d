mod api;
mod config;
mod rate_limit;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::clock::{Clock, SystemClock};
use common::repo::{BlockRepo, MemBlockRepo};
use tower_http::cors::CorsLayer;

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down..."),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("server=info".parse().unwrap())
                .add_directive("common=info".parse().unwrap()),
        )
        .init();

    let config = config::Config::from_env();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let blocks: Arc<dyn BlockRepo> = match config.storage_type.as_str() {
        "mem" => Arc::new(MemBlockRepo::new(clock.clone())),
        other => anyhow::bail!("unsupported storage type: {other}"),
    };

    // Periodic drying pass. Access-time drying keeps results correct on its
    // own; the sweep just keeps idle blocks from staying wet in memory.
    if !config.disable_block_dry_interval {
        let sweep_blocks = blocks.clone();
        clock.start_interval(
            Duration::from_millis(config.block_dry_interval_ms),
            Arc::new(move || sweep_blocks.sweep_dry()),
        );
    }

    let rate_limiter = if config.disable_rate_limit {
        None
    } else {
        Some(Arc::new(rate_limit::RateLimiter::new(
            config.rate_limit_period_ms,
            config.rate_limit_burst,
            clock.clone(),
        )))
    };

    let state = api::AppState {
        blocks,
        rate_limiter,
    };
    let app = api::router(state).layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Server listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server stopped.");
    Ok(())
}
