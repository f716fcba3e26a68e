use anyhow::Context;
use print_queue_relay::api::{self, ApiState};
use print_queue_relay::config::AppConfig;
use print_queue_relay::dispatcher::SystemDispatcher;
use print_queue_relay::events::QueueEvent;
use print_queue_relay::orchestrator::QueueOrchestrator;
use print_queue_relay::remote::HttpQueueClient;
use print_queue_relay::sentry_init;
use print_queue_relay::spooler::PowerShellProbe;
use print_queue_relay::EventBus;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Mirror observer events that the event bus does not log itself.
fn spawn_event_logger(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(QueueEvent::QueueStateChanged {
                    state,
                    job_id: Some(job_id),
                    ..
                }) => debug!("Queue {} on job #{}", state, job_id),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event logger lagged, skipped {} events", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Daily rolling log file next to the config; the guard flushes on exit
    let log_dir = AppConfig::log_dir();
    let (file_layer, _log_guard) = match std::fs::create_dir_all(&log_dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&log_dir, "relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!("Log directory {:?} unavailable, logging to stderr only: {}", log_dir, e);
            (None, None)
        }
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false),
        )
        .with(file_layer)
        .with(sentry_tracing::layer())
        .init();

    info!("========================================");
    info!("Print Queue Relay Starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("========================================");

    // Initialize Sentry crash reporting (must be kept alive)
    let _sentry_guard = sentry_init::init();

    let config = AppConfig::load().context("failed to load configuration")?;
    info!("Print queue API: {}", config.api_base_url);

    let timings = config.timings.clone();
    let remote = Arc::new(HttpQueueClient::new(
        &config.api_base_url,
        timings.api_timeout(),
    ));
    let dispatcher = Arc::new(SystemDispatcher::new(
        timings.api_timeout(),
        timings.os_query_timeout(),
    ));
    let probe = Arc::new(PowerShellProbe::new(timings.os_query_timeout()));

    let events = EventBus::new();
    spawn_event_logger(&events);

    let orchestrator = Arc::new(QueueOrchestrator::new(
        remote,
        dispatcher,
        probe,
        events,
        timings,
    ));

    let api_state = ApiState {
        orchestrator: orchestrator.clone(),
        default_printer: config.printer_name.clone(),
        default_token: config.auth_token.clone(),
        start_time: Instant::now(),
    };
    let bind_addr = config.api_bind_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(&bind_addr, api_state).await {
            error!("Failed to start HTTP API server: {}", e);
        }
    });

    if config.autostart {
        match config.printer_name.as_deref() {
            Some(printer) => {
                let response = orchestrator.start(printer, config.auth_token.clone()).await;
                if !response.success {
                    warn!(
                        "Autostart failed: {}",
                        response.message.unwrap_or_default()
                    );
                }
            }
            None => warn!("Autostart enabled but no printer configured - waiting for start request"),
        }
    } else {
        info!("Waiting for a start request on http://{}", config.api_bind_addr);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Print Queue Relay shutting down...");
    orchestrator.stop("shutdown").await;
    Ok(())
}
