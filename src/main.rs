use std::sync::Arc;

use futures::future::join_all;
use gold_monitor::poller::{Poller, PriceFeed, RateFeed};
use gold_monitor::server::create_router;
use gold_monitor::sources::{build_http_client, FinanceRateSource, TreasuryPriceSource};
use gold_monitor::{heartbeat, AppContext, ServiceConfig, SERVICE_VERSION};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServiceConfig::from_env();
    info!(version = SERVICE_VERSION, addr = %config.listen_addr(), "Starting gold monitor");

    let ctx = AppContext::new(config);
    let client = build_http_client()?;
    let price_source = Arc::new(TreasuryPriceSource::new(
        client.clone(),
        ctx.config.price_source_url.clone(),
    ));
    let rate_source = Arc::new(FinanceRateSource::new(
        client.clone(),
        ctx.config.rate_source_url.clone(),
    )?);

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let price_poller = Poller::new(
        PriceFeed::new(price_source.clone(), ctx.history.clone(), ctx.metrics.clone()),
        ctx.config.price_poll_interval,
        ctx.config.price_backoff,
        ctx.coordinator.clone(),
        ctx.metrics.clone(),
    );
    tasks.push(tokio::spawn(price_poller.run(cancel.clone())));

    let rate_poller = Poller::new(
        RateFeed::new(
            rate_source.clone(),
            ctx.history.clone(),
            ctx.metrics.clone(),
            ctx.config.rate_utc_offset_hours,
        ),
        ctx.config.rate_poll_interval,
        ctx.config.rate_backoff,
        ctx.coordinator.clone(),
        ctx.metrics.clone(),
    );
    tasks.push(tokio::spawn(rate_poller.run(cancel.clone())));

    let coordinator = ctx.coordinator.clone();
    let token = cancel.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = coordinator.run(token.clone()).await {
            error!(error = %e, "Broadcast coordinator failed, shutting down");
            token.cancel();
        }
    }));

    tasks.push(tokio::spawn(heartbeat::run(
        ctx.registry.clone(),
        ctx.config.heartbeat_interval,
        cancel.clone(),
    )));

    let listener = TcpListener::bind(ctx.config.listen_addr()).await?;
    info!(addr = %listener.local_addr()?, "Listening");

    let app = create_router(ctx.clone());
    let stop = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = stop.cancelled() => {}
            }
        })
        .await?;

    cancel.cancel();
    for result in join_all(tasks).await {
        if let Err(e) = result {
            error!(error = %e, "Background task panicked");
        }
    }

    // Pooled upstream connections close once the last client handle drops.
    drop(price_source);
    drop(rate_source);
    drop(client);

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
