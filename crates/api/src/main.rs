use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use streamforge_api::app::{self, AppServices};
use streamforge_api::cli::CliArgs;
use streamforge_infra::config::Settings;
use streamforge_infra::metrics::{TracingMetricsSink, publish_queue_metrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    streamforge_observability::logging::init(&args.log_config());

    let settings = args.apply(Settings::from_env().context("invalid STREAMFORGE_* settings")?);
    let services = Arc::new(AppServices::build(settings.clone()).context("failed to wire services")?);

    let workers = if args.no_workers {
        None
    } else {
        Some(services.start_workers().context("failed to start workers")?)
    };

    if let Some(interval) = args.metrics_interval() {
        tokio::spawn(report_queue_metrics(services.clone(), interval));
    }

    let listener = TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    info!(
        addr = %listener.local_addr()?,
        queue_backend = services.queue.name(),
        queue = %settings.queue_name,
        workers = workers.as_ref().map_or(0, |w| w.size()),
        "listening"
    );

    axum::serve(listener, app::build_app(services))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(workers) = workers {
        tokio::task::spawn_blocking(move || workers.shutdown())
            .await
            .context("worker shutdown panicked")?;
    }
    info!("shutdown complete");
    Ok(())
}

async fn report_queue_metrics(services: Arc<AppServices>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let services = services.clone();
        let reported = tokio::task::spawn_blocking(move || {
            publish_queue_metrics(
                services.queue.as_ref(),
                &services.settings.queue_name,
                &TracingMetricsSink,
            );
        })
        .await;
        if let Err(e) = reported {
            warn!(error = %e, "queue metrics task failed");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
