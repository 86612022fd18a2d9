mod logging;
mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{HistogramSummary, MetricType, MetricsQuery, MetricsRecorder, MetricsSnapshot};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. RUST_LOG takes precedence when set.
    pub log_level: Level,
    /// Per-target overrides, e.g. ("lore_crawler", DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Persist WARN+ records to `log_db_path`.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    pub metrics_enabled: bool,
    pub metrics_db_path: PathBuf,
    pub metrics_snapshot_interval_secs: u64,
    pub metrics_retention_days: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        let dir = lore_home();
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_to_sqlite: true,
            log_db_path: dir.join("logs.db"),
            metrics_enabled: true,
            metrics_db_path: dir.join("metrics.db"),
            metrics_snapshot_interval_secs: 60,
            metrics_retention_days: 7,
        }
    }
}

/// Handles to the sinks installed by `init_telemetry`.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics_recorder: Option<Arc<MetricsRecorder>>,
    snapshot_task: Option<JoinHandle<()>>,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Option<Arc<MetricsRecorder>> {
        self.metrics_recorder.clone()
    }

    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(task) = self.snapshot_task.take() {
            task.abort();
        }
        if let Some(recorder) = &self.metrics_recorder {
            let _ = recorder.snapshot();
        }
    }
}

fn filter_directives(config: &TelemetryConfig) -> String {
    let mut directives = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        directives.push_str(&format!(",{module}={}", level.to_string().to_lowercase()));
    }
    directives
}

/// Install the global subscriber. Call once, from inside a tokio runtime.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(&config)));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(env_filter);

    let log_sink = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => {
                eprintln!("lore-telemetry: failed to open log DB: {e}");
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(log_sink.clone().map(SqliteLogLayer::new))
        .init();

    let metrics_recorder = if config.metrics_enabled {
        match MetricsRecorder::new(&config.metrics_db_path) {
            Ok(recorder) => Some(Arc::new(recorder)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to open metrics DB");
                None
            }
        }
    } else {
        None
    };

    let snapshot_task = metrics_recorder.clone().map(|recorder| {
        spawn_metrics_snapshots(
            recorder,
            Duration::from_secs(config.metrics_snapshot_interval_secs.max(1)),
            config.metrics_retention_days,
        )
    });

    TelemetryGuard {
        log_sink,
        metrics_recorder,
        snapshot_task,
    }
}

/// Snapshot and prune on a fixed period until the task is aborted.
pub fn spawn_metrics_snapshots(
    recorder: Arc<MetricsRecorder>,
    every: Duration,
    retention_days: u32,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // First tick fires immediately; nothing has been recorded yet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = recorder.snapshot() {
                tracing::warn!(error = %e, "metrics snapshot failed");
            }
            if let Err(e) = recorder.prune(retention_days) {
                tracing::warn!(error = %e, "metrics prune failed");
            }
        }
    })
}

/// `$HOME/.lore`, or `/tmp/.lore` without a home directory.
pub fn lore_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".lore")
}
