mod config;
mod routes;

use config::GatewayConfig;
use fanout_bus::{Bus, InMemoryBus, RedisBus};
use fanout_cron::Scheduler;
use fanout_hub::Hub;
use routes::AppState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env();
    init_tracing(&config.log_level);

    let hub = Hub::new();
    if !config.hub.has_safe_heartbeat_margin() {
        warn!("FANOUT_READ_TIMEOUT_SECS is not comfortably larger than FANOUT_PING_INTERVAL_SECS; a single lost pong may disconnect clients prematurely");
    }

    let cancel = CancellationToken::new();
    let bus: Arc<dyn Bus> = match &config.redis_url {
        Some(url) => {
            info!("connecting to redis bus");
            Arc::new(
                RedisBus::connect(url)
                    .await
                    .expect("failed to connect to FANOUT_REDIS_URL"),
            )
        }
        None => {
            info!("no FANOUT_REDIS_URL set, running in single-node local mode");
            Arc::new(InMemoryBus::new())
        }
    };

    if config.redis_url.is_some() {
        hub.enable_cluster(bus.clone(), "fanout:envelopes", cancel.clone())
            .await
            .expect("failed to subscribe to the cluster bus channel");
    }

    let scheduler = Arc::new(Scheduler::with_default_timeout(
        bus,
        config.cron_default_execution_timeout,
    ));
    scheduler.start().await;
    info!(
        default_execution_timeout_secs = config.cron_default_execution_timeout.as_secs(),
        "cron scheduler started; jobs registered via register_with_timeout(..., None, ...) inherit this default"
    );

    let state = AppState { hub: hub.clone(), options: config.hub };
    let router = routes::router(state);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .unwrap_or_else(|err| panic!("failed to bind {}: {err}", config.bind_addr));
    info!(addr = %config.bind_addr, "fanout gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(grace_secs = config.shutdown_grace.as_secs(), "shutting down");
    cancel.cancel();
    let _ = tokio::time::timeout(config.shutdown_grace, scheduler.stop()).await;
    hub.unregister_all().await;

    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
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
        () = ctrl_c => {}
        () = terminate => {}
    }
}
