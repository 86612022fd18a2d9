//! # lore
//!
//! `lore serve` hosts the event index behind the boundary; `lore crawl`
//! backfills room history into it from a homeserver.

#![deny(unsafe_code)]

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use lore_bridge::{
    serve, BridgeClient, EncryptedKeyStore, Host, IndexProxy, MasterKey, PlatformInfo, WsChannel,
    WsConfig,
};
use lore_core::checkpoint::Checkpoint;
use lore_core::ids::RoomId;
use lore_core::index::{EventIndex, HistoryLoader};
use lore_core::search::SearchArgs;
use lore_crawler::{open_index, Crawler, CrawlerConfig, MatrixHistoryLoader};
use lore_settings::{load_settings, lore_home, resolve_path, LoreSettings};
use lore_store::{Database, SqliteIndex};
use lore_telemetry::{init_telemetry, LogQuery, MetricsQuery, TelemetryConfig, TelemetryGuard};

#[derive(Parser, Debug)]
#[command(name = "lore", about = "Resumable room-history indexer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open the index and serve it over WebSocket.
    Serve {
        /// Port to bind (overrides settings).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Resume stored checkpoints and crawl until done or Ctrl-C.
    Crawl {
        /// Start a full backward crawl of this room.
        #[arg(long, requires = "from")]
        room: Option<String>,
        /// Pagination token to start the new room from.
        #[arg(long)]
        from: Option<String>,
    },
    /// Print index statistics.
    Stats,
    /// Full-text search across indexed rooms.
    Search {
        term: String,
        #[arg(long)]
        room: Option<String>,
        #[arg(long, default_value = "10")]
        limit: u32,
    },
    /// Show persisted warnings and errors, newest first.
    Logs {
        #[arg(long)]
        room: Option<String>,
        #[arg(long)]
        level: Option<String>,
        #[arg(long, default_value = "50")]
        limit: u32,
    },
    /// Show persisted metric snapshots, newest first.
    Metrics {
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "50")]
        limit: u32,
    },
}

fn telemetry_config(settings: &LoreSettings) -> TelemetryConfig {
    let home = lore_home();
    let t = &settings.telemetry;
    TelemetryConfig {
        log_level: Level::from_str(&t.level).unwrap_or(Level::INFO),
        log_to_sqlite: t.log_to_sqlite,
        log_db_path: resolve_path(&home, &t.log_db_path),
        metrics_enabled: t.metrics_enabled,
        metrics_db_path: resolve_path(&home, &t.metrics_db_path),
        metrics_snapshot_interval_secs: t.metrics_snapshot_interval_secs,
        ..TelemetryConfig::default()
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    drop(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
        }
        token.cancel();
    }));
    cancel
}

async fn connect(settings: &LoreSettings) -> Result<IndexProxy> {
    let url = settings.bridge.ws_url();
    let channel = WsChannel::connect(&url)
        .await
        .with_context(|| format!("Failed to reach bridge host at {url}"))?;
    let client = BridgeClient::new(
        Arc::new(channel),
        Duration::from_millis(settings.bridge.request_timeout_ms),
    );
    Ok(IndexProxy::new(client))
}

async fn run_serve(settings: &LoreSettings, port: Option<u16>) -> Result<()> {
    let home = lore_home();
    let db_path = resolve_path(&home, &settings.index.db_path);
    let key_path = resolve_path(&home, &settings.index.master_key_path);
    ensure_parent_dir(&db_path)?;
    ensure_parent_dir(&key_path)?;

    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open index at {}", db_path.display()))?;
    let master = MasterKey::load_or_create(&key_path).context("Failed to load master key")?;
    let index = Arc::new(SqliteIndex::new(db.clone()));
    if !open_index(index.as_ref(), settings.index.user_version).await? {
        bail!("event indexing is not supported by this index");
    }

    let platform = PlatformInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        config: json!({
            "homeserverUrl": settings.matrix.homeserver_url,
            "userVersion": settings.index.user_version,
        }),
    };
    let keys = Arc::new(EncryptedKeyStore::new(db, master));
    let host = Arc::new(Host::new(index.clone(), index, keys, platform));

    let mut config = WsConfig::from(&settings.bridge);
    if let Some(port) = port {
        config.port = port;
    }
    let handle = serve(host, &config, ctrl_c_token()).await?;
    info!(addr = %handle.addr, "serving");
    handle.wait().await;
    Ok(())
}

async fn run_crawl(
    settings: &LoreSettings,
    telemetry: &TelemetryGuard,
    room: Option<String>,
    from: Option<String>,
) -> Result<()> {
    let Some(homeserver) = settings.matrix.homeserver_url.as_deref() else {
        bail!("matrix.homeserverUrl is not configured");
    };
    let Some(token) = settings.matrix.access_token.clone() else {
        bail!("matrix.accessToken is not configured");
    };

    let proxy = Arc::new(connect(settings).await?);
    if !open_index(proxy.as_ref(), settings.index.user_version).await? {
        warn!("bridge host cannot index events, nothing to crawl");
        return Ok(());
    }

    let loader: Arc<dyn HistoryLoader> = Arc::new(MatrixHistoryLoader::new(
        homeserver,
        SecretString::from(token),
        settings.crawler.page_size,
    )?);
    let mut crawler = Crawler::new(
        loader,
        proxy.clone(),
        proxy.clone(),
        CrawlerConfig::from(&settings.crawler),
    );
    if let Some(metrics) = telemetry.metrics() {
        crawler = crawler.with_metrics(metrics);
    }
    let crawler = Arc::new(crawler);

    let _ = crawler.resume().await?;
    if let (Some(room), Some(from)) = (room, from) {
        let checkpoint = Checkpoint::backward(RoomId::from_raw(room), from).with_full_crawl(true);
        crawler.register_room(checkpoint).await?;
    }

    let status = crawler.run(ctrl_c_token()).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    if let Some(metrics) = telemetry.metrics() {
        let steps = metrics.histogram_summary("crawler.step_ms", &[]);
        info!(steps = steps.count, p50_ms = steps.p50, p95_ms = steps.p95, "crawl step timings");
    }
    for pair in crawler.stalled() {
        println!(
            "stalled: {} ({}) after {} failures: {}",
            pair.room_id,
            pair.direction,
            pair.failures,
            pair.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn run_stats(settings: &LoreSettings) -> Result<()> {
    let proxy = connect(settings).await?;
    let stats = proxy.get_stats().await?;
    let version = proxy.get_user_version().await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "eventCount": stats.event_count,
            "roomCount": stats.room_count,
            "size": stats.size,
            "userVersion": version,
        }))?
    );
    Ok(())
}

async fn run_search(settings: &LoreSettings, term: String, room: Option<String>, limit: u32) -> Result<()> {
    let proxy = connect(settings).await?;
    let mut args = SearchArgs::term(term);
    args.limit = limit;
    if let Some(room) = room {
        args = args.in_room(RoomId::from_raw(room));
    }
    let results = proxy.search_event_index(&args).await?;
    println!("{} matches", results.count);
    for hit in &results.results {
        let event = &hit.result;
        println!(
            "{} {} {}: {}",
            event.origin_server_ts,
            event.room_id,
            event.sender,
            event.text().unwrap_or("")
        );
    }
    Ok(())
}

fn run_logs(
    telemetry: &TelemetryGuard,
    room: Option<String>,
    level: Option<String>,
    limit: u32,
) -> Result<()> {
    let Some(sink) = telemetry.logs() else {
        bail!("telemetry.logToSqlite is disabled");
    };
    let records = sink.query(&LogQuery {
        level,
        room_id: room,
        limit: Some(limit),
        ..LogQuery::default()
    })?;
    for r in &records {
        println!(
            "{} {:5} {} [{}] {} {}",
            r.timestamp,
            r.level,
            r.target,
            r.room_id.as_deref().unwrap_or("-"),
            r.message,
            r.fields.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn run_metrics(telemetry: &TelemetryGuard, name: Option<String>, limit: u32) -> Result<()> {
    let Some(metrics) = telemetry.metrics() else {
        bail!("telemetry.metricsEnabled is off");
    };
    let rows = metrics.query(&MetricsQuery {
        name,
        limit: Some(limit),
        ..MetricsQuery::default()
    })?;
    for row in &rows {
        println!(
            "{} {} {} {}",
            row.timestamp,
            row.name,
            row.value,
            row.labels.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings().context("Failed to load settings")?;
    settings.validate().context("Invalid settings")?;

    let telemetry = init_telemetry(telemetry_config(&settings));
    info!(command = ?cli.command, "lore starting");

    match cli.command {
        Command::Serve { port } => run_serve(&settings, port).await,
        Command::Crawl { room, from } => run_crawl(&settings, &telemetry, room, from).await,
        Command::Stats => run_stats(&settings).await,
        Command::Search { term, room, limit } => run_search(&settings, term, room, limit).await,
        Command::Logs { room, level, limit } => run_logs(&telemetry, room, level, limit),
        Command::Metrics { name, limit } => run_metrics(&telemetry, name, limit),
    }
}
