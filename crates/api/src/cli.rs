//! Command line for the `streamforge` binary.
//!
//! Every flag also reads its `STREAMFORGE_*` variable; anything not given
//! falls back to [`Settings::from_env`].

use std::time::Duration;

use clap::Parser;

use streamforge_infra::config::{QueueBackendKind, Settings};
use streamforge_observability::{LogConfig, LogFormat};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "streamforge",
    version,
    about = "Queue-backed generation workers with live SSE delivery"
)]
pub struct CliArgs {
    /// Address the HTTP server binds to.
    #[arg(long, env = "STREAMFORGE_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Queue backend: memory, redis or cloud.
    #[arg(long, env = "STREAMFORGE_QUEUE_BACKEND", value_parser = parse_backend)]
    pub queue_backend: Option<QueueBackendKind>,

    #[arg(long, env = "STREAMFORGE_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Queue the workers consume.
    #[arg(long, env = "STREAMFORGE_QUEUE_NAME")]
    pub queue_name: Option<String>,

    /// Number of worker threads.
    #[arg(long, env = "STREAMFORGE_WORKER_CONCURRENCY")]
    pub workers: Option<usize>,

    /// Run the HTTP server without local workers.
    #[arg(long, env = "STREAMFORGE_NO_WORKERS", default_value_t = false)]
    pub no_workers: bool,

    /// Log output: json or pretty.
    #[arg(long, env = "STREAMFORGE_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// Fallback filter when RUST_LOG is unset.
    #[arg(long, env = "STREAMFORGE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Seconds between queue depth metric reports (0 disables).
    #[arg(long, env = "STREAMFORGE_METRICS_INTERVAL_SECS", default_value_t = 60)]
    pub metrics_interval_secs: u64,
}

fn parse_backend(raw: &str) -> Result<QueueBackendKind, String> {
    raw.parse()
}

impl CliArgs {
    /// Apply flags on top of `base`.
    pub fn apply(&self, mut base: Settings) -> Settings {
        if let Some(addr) = &self.bind_addr {
            base = base.with_bind_addr(addr.clone());
        }
        if let Some(backend) = self.queue_backend {
            base = base.with_queue_backend(backend);
        }
        if let Some(url) = &self.redis_url {
            base = base.with_redis_url(url.clone());
        }
        if let Some(name) = &self.queue_name {
            base = base.with_queue_name(name.clone());
        }
        if let Some(workers) = self.workers {
            base = base.with_worker_concurrency(workers);
        }
        base
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig::new(self.log_format, self.log_level.clone())
    }

    pub fn metrics_interval(&self) -> Option<Duration> {
        (self.metrics_interval_secs > 0).then(|| Duration::from_secs(self.metrics_interval_secs))
    }
}
