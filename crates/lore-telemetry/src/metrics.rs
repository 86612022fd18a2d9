use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "gauge" => Self::Gauge,
            "histogram" => Self::Histogram,
            _ => Self::Counter,
        }
    }
}

/// One persisted metric value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub id: i64,
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub labels: Option<String>,
    pub metric_type: MetricType,
}

#[derive(Clone, Debug, Default)]
pub struct MetricsQuery {
    pub name: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Name plus sorted labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn labels_json(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let map: HashMap<&str, &str> = self
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        serde_json::to_string(&map).ok()
    }
}

/// f64 cell stored as raw bits so it can be updated lock-free.
#[derive(Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }

    fn add(&self, delta: f64) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + delta).to_bits())
            });
    }
}

#[derive(Default)]
struct Histogram {
    observations: Mutex<Vec<f64>>,
}

impl Histogram {
    fn summary(&self) -> HistogramSummary {
        let mut obs = self.observations.lock().clone();
        if obs.is_empty() {
            return HistogramSummary::default();
        }
        obs.sort_by(f64::total_cmp);
        let count = obs.len();
        let at = |q: f64| obs[((count as f64 * q) as usize).min(count - 1)];
        HistogramSummary {
            count: count as u64,
            sum: obs.iter().sum(),
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        }
    }
}

/// Metrics keyed by name, created on first touch.
struct Family<T> {
    entries: RwLock<HashMap<MetricKey, T>>,
}

impl<T: Default> Family<T> {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn with<R>(&self, key: MetricKey, f: impl FnOnce(&T) -> R) -> R {
        if let Some(entry) = self.entries.read().get(&key) {
            return f(entry);
        }
        let mut entries = self.entries.write();
        f(entries.entry(key).or_default())
    }

    fn peek<R>(&self, key: &MetricKey, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.entries.read().get(key).map(f)
    }
}

/// In-memory counters, gauges and histograms with on-demand SQLite snapshots.
pub struct MetricsRecorder {
    counters: Family<AtomicU64>,
    gauges: Family<AtomicF64>,
    histograms: Family<Histogram>,
    db: Mutex<Connection>,
}

impl MetricsRecorder {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    /// Recorder whose snapshots vanish with the process.
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS metrics_snapshots (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 name TEXT NOT NULL,
                 value REAL NOT NULL,
                 labels TEXT,
                 metric_type TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics_snapshots(name, timestamp);",
        )?;
        Ok(Self {
            counters: Family::new(),
            gauges: Family::new(),
            histograms: Family::new(),
            db: Mutex::new(conn),
        })
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.counters.with(MetricKey::new(name, labels), |c| {
            c.fetch_add(n, Ordering::Relaxed);
        });
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .peek(&MetricKey::new(name, labels), |c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges
            .with(MetricKey::new(name, labels), |g| g.set(value));
    }

    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: f64) {
        self.gauges
            .with(MetricKey::new(name, labels), |g| g.add(delta));
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges
            .peek(&MetricKey::new(name, labels), AtomicF64::get)
            .unwrap_or(0.0)
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms.with(MetricKey::new(name, labels), |h| {
            h.observations.lock().push(value);
        });
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .peek(&MetricKey::new(name, labels), Histogram::summary)
            .unwrap_or_default()
    }

    /// Persist the current value of every metric. Histograms store their p50.
    pub fn snapshot(&self) -> Result<usize, rusqlite::Error> {
        let now = Utc::now().to_rfc3339();
        let mut rows: Vec<(MetricKey, f64, MetricType)> = Vec::new();
        for (key, c) in self.counters.entries.read().iter() {
            rows.push((key.clone(), c.load(Ordering::Relaxed) as f64, MetricType::Counter));
        }
        for (key, g) in self.gauges.entries.read().iter() {
            rows.push((key.clone(), g.get(), MetricType::Gauge));
        }
        for (key, h) in self.histograms.entries.read().iter() {
            rows.push((key.clone(), h.summary().p50, MetricType::Histogram));
        }

        let mut db = self.db.lock();
        let tx = db.transaction()?;
        for (key, value, metric_type) in &rows {
            tx.execute(
                "INSERT INTO metrics_snapshots (timestamp, name, value, labels, metric_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![now, key.name, value, key.labels_json(), metric_type.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(rows.len())
    }

    pub fn query(&self, q: &MetricsQuery) -> Result<Vec<MetricsSnapshot>, rusqlite::Error> {
        let db = self.db.lock();
        let mut stmt = db.prepare(&format!(
            "SELECT id, timestamp, name, value, labels, metric_type FROM metrics_snapshots
             WHERE (?1 IS NULL OR name = ?1) AND (?2 IS NULL OR timestamp >= ?2)
             ORDER BY id DESC LIMIT {}",
            q.limit.unwrap_or(100)
        ))?;
        let rows = stmt.query_map(rusqlite::params![q.name, q.since], |row| {
            let metric_type: String = row.get(5)?;
            Ok(MetricsSnapshot {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                name: row.get(2)?,
                value: row.get(3)?,
                labels: row.get(4)?,
                metric_type: MetricType::parse(&metric_type),
            })
        })?;
        rows.collect()
    }

    /// Drop snapshots older than `retention_days`.
    pub fn prune(&self, retention_days: u32) -> Result<usize, rusqlite::Error> {
        let cutoff = (Utc::now() - chrono::Duration::days(i64::from(retention_days))).to_rfc3339();
        self.db.lock().execute(
            "DELETE FROM metrics_snapshots WHERE timestamp <= ?1",
            [cutoff],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_are_per_label_set() {
        let recorder = MetricsRecorder::in_memory().unwrap();
        recorder.counter_inc("crawler.steps", &[("direction", "b")], 1);
        recorder.counter_inc("crawler.steps", &[("direction", "b")], 2);
        recorder.counter_inc("crawler.steps", &[("direction", "f")], 1);

        assert_eq!(recorder.counter_get("crawler.steps", &[("direction", "b")]), 3);
        assert_eq!(recorder.counter_get("crawler.steps", &[("direction", "f")]), 1);
        assert_eq!(recorder.counter_get("crawler.steps", &[]), 0);
    }

    #[test]
    fn label_order_does_not_matter() {
        let recorder = MetricsRecorder::in_memory().unwrap();
        recorder.counter_inc("x", &[("a", "1"), ("b", "2")], 1);
        recorder.counter_inc("x", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(recorder.counter_get("x", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn gauges_move_both_ways() {
        let recorder = MetricsRecorder::in_memory().unwrap();
        recorder.gauge_set("crawler.rooms_stalled", &[], 2.0);
        recorder.gauge_inc("crawler.rooms_stalled", &[], 1.0);
        recorder.gauge_inc("crawler.rooms_stalled", &[], -2.5);
        assert_eq!(recorder.gauge_get("crawler.rooms_stalled", &[]), 0.5);
    }

    #[test]
    fn histogram_percentiles() {
        let recorder = MetricsRecorder::in_memory().unwrap();
        for v in 1..=100 {
            recorder.histogram_observe("crawler.step_ms", &[], v as f64);
        }
        let s = recorder.histogram_summary("crawler.step_ms", &[]);
        assert_eq!(s.count, 100);
        assert_eq!(s.sum, 5050.0);
        assert_eq!(s.p50, 51.0);
        assert_eq!(s.p99, 100.0);
        assert_eq!(recorder.histogram_summary("missing", &[]), HistogramSummary::default());
    }

    #[test]
    fn snapshot_query_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = MetricsRecorder::new(&dir.path().join("metrics.db")).unwrap();
        recorder.counter_inc("crawler.events_indexed", &[("direction", "b")], 50);
        recorder.gauge_set("crawler.rooms_done", &[], 1.0);
        recorder.histogram_observe("crawler.step_ms", &[], 12.0);

        assert_eq!(recorder.snapshot().unwrap(), 3);

        let rows = recorder
            .query(&MetricsQuery {
                name: Some("crawler.events_indexed".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 50.0);
        assert_eq!(rows[0].metric_type, MetricType::Counter);
        assert!(rows[0].labels.as_deref().unwrap().contains("direction"));

        let future = recorder
            .query(&MetricsQuery {
                since: Some("2999-01-01T00:00:00Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(future.is_empty());

        assert_eq!(recorder.prune(0).unwrap(), 3);
        assert!(recorder.query(&MetricsQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn concurrent_increments() {
        let recorder = Arc::new(MetricsRecorder::in_memory().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = recorder.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        r.counter_inc("crawler.steps", &[], 1);
                        r.gauge_inc("inflight", &[], 1.0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(recorder.counter_get("crawler.steps", &[]), 4000);
        assert_eq!(recorder.gauge_get("inflight", &[]), 4000.0);
    }
}
