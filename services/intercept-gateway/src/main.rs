//! Intercept gateway - HTTP/WebSocket control surface for the mode controller

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use intercept_core::{
    discover, AirmonNg, Correlator, DeviceClass, EventBroadcaster, ModeController, ObservationLog,
    ResourceArbiter, SignalHistory,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod routes;
mod settings;
mod ws_handler;

use routes::AppState;
use settings::Settings;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("failed to load settings")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_filter))
        .context("invalid log filter")?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("===========================================");
    info!("   Intercept Gateway");
    info!("===========================================");

    let core = settings.core.clone();
    info!("Configuration:");
    info!("  HTTP/WS: {}", settings.bind_addr());
    info!("  Static files: {:?}", settings.static_dir);
    info!("  Sysfs root: {}", core.discovery.sysfs_root.display());
    info!(
        "  Grace period: {}ms, startup check: {}ms",
        core.supervisor.grace_period_ms, core.supervisor.startup_check_ms
    );

    let registry = discover(&core.discovery);
    for class in DeviceClass::ALL {
        if registry.count(class) == 0 {
            warn!("No {} device found; {} modes will be unavailable", class, class);
        }
    }

    let monitor = Arc::new(AirmonNg::new(
        core.tools.airmon_ng.clone(),
        core.discovery.sysfs_root.clone(),
    ));
    let arbiter = Arc::new(ResourceArbiter::new(&registry, monitor));
    let broadcaster = Arc::new(EventBroadcaster::new(core.event_queue_capacity));
    let controller = ModeController::new(core.clone(), arbiter, broadcaster);

    let observations = Arc::new(ObservationLog::with_vendors(&core.correlation.vendors));
    tokio::spawn({
        let observations = observations.clone();
        let sub = controller.subscribe();
        async move { observations.follow(sub).await }
    });

    let history = Arc::new(SignalHistory::new(&core.history));
    tokio::spawn({
        let history = history.clone();
        let sub = controller.subscribe();
        async move { history.follow(sub).await }
    });
    tokio::spawn(prune_history(history.clone()));

    if core.discovery.rescan_interval_secs > 0 {
        tokio::spawn(rescan_devices(
            controller.clone(),
            core.discovery.clone(),
            Duration::from_secs(core.discovery.rescan_interval_secs),
        ));
    }

    let state = Arc::new(AppState {
        controller: controller.clone(),
        observations,
        correlator: Correlator::new(&core.correlation),
        history,
    });
    let app = routes::router(state, settings.static_dir.as_deref());

    let addr = settings.bind_addr();
    info!("Starting HTTP/WebSocket server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = server.await {
        error!("HTTP server error: {}", e);
    }

    // leave no decoder or monitor-mode interface behind
    let report = controller.kill_all().await;
    info!("Shutdown complete ({} mode(s) stopped)", report.stopped.len());
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Ctrl-C received, stopping all modes");
}

/// Periodic hot-plug rescan
async fn rescan_devices(
    controller: ModeController,
    config: intercept_core::config::DiscoveryConfig,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let scan_config = config.clone();
        match tokio::task::spawn_blocking(move || discover(&scan_config)).await {
            Ok(registry) => controller.refresh_devices(&registry),
            Err(e) => error!("Device rescan failed: {}", e),
        }
    }
}

/// Hourly expiry of old signal readings
async fn prune_history(history: Arc<SignalHistory>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));
    loop {
        ticker.tick().await;
        let removed = history.prune_expired();
        if removed > 0 {
            info!("Pruned {} old signal readings", removed);
        }
    }
}
