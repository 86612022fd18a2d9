//! Crawler: walks every registered room-direction back (or forward) through
//! history one page at a time, persisting a checkpoint after each page.
//!
//! Each pair moves `Idle -> Crawling -> (Idle | Done | Stalled)`. The state
//! gate guarantees at most one in-flight step per pair; different pairs run
//! concurrently up to `max_concurrent_rooms`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use lore_core::checkpoint::{Checkpoint, CheckpointKey, Direction};
use lore_core::crawl::{CrawlEvent, PairState};
use lore_core::errors::BridgeError;
use lore_core::ids::RoomId;
use lore_core::index::{CheckpointStore, EventIndex, HistoryLoader};
use lore_telemetry::MetricsRecorder;

use crate::config::CrawlerConfig;
use crate::error::CrawlerError;

/// Counts of tracked pairs per state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CrawlStatus {
    pub running: bool,
    pub idle: usize,
    pub crawling: usize,
    pub done: usize,
    pub stalled: usize,
}

impl CrawlStatus {
    /// Nothing left to crawl.
    pub fn is_finished(&self) -> bool {
        self.idle == 0 && self.crawling == 0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StalledPair {
    pub room_id: RoomId,
    pub direction: Direction,
    pub failures: u32,
    pub last_error: Option<String>,
    /// Checkpoint left in the store, untouched.
    pub checkpoint: Checkpoint,
}

struct PairEntry {
    checkpoint: Checkpoint,
    state: PairState,
    failures: u32,
    last_error: Option<String>,
    last_attempt: Option<Instant>,
    not_before: Option<Instant>,
    seq: u64,
}

impl PairEntry {
    fn eligible(&self, now: Instant) -> bool {
        self.state == PairState::Idle && self.not_before.map_or(true, |t| t <= now)
    }
}

/// What a successful step did.
enum StepOutcome {
    Advanced { next: Checkpoint, indexed: usize },
    Done { indexed: usize },
}

pub struct Crawler {
    loader: Arc<dyn HistoryLoader>,
    index: Arc<dyn EventIndex>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: CrawlerConfig,
    metrics: Option<Arc<MetricsRecorder>>,
    pairs: Mutex<HashMap<CheckpointKey, PairEntry>>,
    next_seq: AtomicU64,
    running: AtomicBool,
    events: broadcast::Sender<CrawlEvent>,
}

impl Crawler {
    pub fn new(
        loader: Arc<dyn HistoryLoader>,
        index: Arc<dyn EventIndex>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: CrawlerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            loader,
            index,
            checkpoints,
            config,
            metrics: None,
            pairs: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            running: AtomicBool::new(false),
            events,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CrawlEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    /// Persist a new checkpoint and start tracking it.
    #[instrument(skip(self), fields(room_id = %checkpoint.room_id, direction = %checkpoint.direction))]
    pub async fn register_room(&self, checkpoint: Checkpoint) -> Result<(), CrawlerError> {
        self.call(self.checkpoints.add_checkpoint(&checkpoint)).await?;
        self.track(checkpoint);
        Ok(())
    }

    /// Register both directions of a room seen for the first time: a full
    /// backward crawl from `backward_token` and a partial forward crawl from
    /// `forward_token`.
    pub async fn add_initial_checkpoints(
        &self,
        room_id: &RoomId,
        backward_token: impl Into<String>,
        forward_token: impl Into<String>,
    ) -> Result<(), CrawlerError> {
        let backward = Checkpoint::backward(room_id.clone(), backward_token).with_full_crawl(true);
        let forward = Checkpoint::forward(room_id.clone(), forward_token);
        self.register_room(backward).await?;
        self.register_room(forward).await?;
        info!(room_id = %room_id, "added initial crawler checkpoints");
        Ok(())
    }

    /// Track every stored checkpoint. Returns how many pairs were picked up.
    pub async fn resume(&self) -> Result<usize, CrawlerError> {
        let stored = self.call(self.checkpoints.load_checkpoints()).await?;
        let count = stored.len();
        for checkpoint in stored {
            self.track(checkpoint);
        }
        info!(count, "resumed crawler checkpoints");
        Ok(count)
    }

    /// Pairs already `Idle` or `Crawling` keep their entry, failure count
    /// and backoff included. `Done` and `Stalled` pairs start over.
    fn track(&self, checkpoint: Checkpoint) {
        let key = checkpoint.key();
        let mut pairs = self.pairs.lock();
        if pairs
            .get(&key)
            .is_some_and(|e| matches!(e.state, PairState::Idle | PairState::Crawling))
        {
            return;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        pairs.insert(
            key,
            PairEntry {
                checkpoint,
                state: PairState::Idle,
                failures: 0,
                last_error: None,
                last_attempt: None,
                not_before: None,
                seq,
            },
        );
    }

    pub fn status(&self) -> CrawlStatus {
        let pairs = self.pairs.lock();
        let mut status = CrawlStatus {
            running: self.running.load(Ordering::Relaxed),
            ..CrawlStatus::default()
        };
        for entry in pairs.values() {
            match entry.state {
                PairState::Idle => status.idle += 1,
                PairState::Crawling => status.crawling += 1,
                PairState::Done => status.done += 1,
                PairState::Stalled => status.stalled += 1,
            }
        }
        status
    }

    pub fn state_of(&self, key: &CheckpointKey) -> Option<PairState> {
        self.pairs.lock().get(key).map(|e| e.state)
    }

    pub fn stalled(&self) -> Vec<StalledPair> {
        let pairs = self.pairs.lock();
        let mut stalled: Vec<_> = pairs
            .values()
            .filter(|e| e.state == PairState::Stalled)
            .map(|e| {
                (
                    e.seq,
                    StalledPair {
                        room_id: e.checkpoint.room_id.clone(),
                        direction: e.checkpoint.direction,
                        failures: e.failures,
                        last_error: e.last_error.clone(),
                        checkpoint: e.checkpoint.clone(),
                    },
                )
            })
            .collect();
        stalled.sort_by_key(|(seq, _)| *seq);
        stalled.into_iter().map(|(_, pair)| pair).collect()
    }

    /// Run until cancelled or until every pair is `Done` or `Stalled`.
    /// In-flight steps are drained before returning.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> Result<CrawlStatus, CrawlerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CrawlerError::AlreadyRunning);
        }
        info!(
            max_concurrent_rooms = self.config.max_concurrent_rooms,
            "crawler started"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let now = Instant::now();
            while tasks.len() < self.config.max_concurrent_rooms {
                let Some(checkpoint) = self.claim_next(now) else {
                    break;
                };
                let this = Arc::clone(self);
                let _ = tasks.spawn(async move { this.step(checkpoint).await });
            }

            let wake = if tasks.len() < self.config.max_concurrent_rooms {
                self.next_wakeup()
            } else {
                None
            };
            if tasks.is_empty() && wake.is_none() {
                break;
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "crawl step task failed");
                    }
                }
                () = tokio::time::sleep_until(wake.unwrap_or(now)), if wake.is_some() => {}
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "crawl step task failed");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        let status = self.status();
        self.emit(CrawlEvent::Stopped {
            done: status.done,
            stalled: status.stalled,
        });
        info!(
            done = status.done,
            stalled = status.stalled,
            idle = status.idle,
            "crawler stopped"
        );
        Ok(status)
    }

    /// Step the next eligible pair inline. Returns the pair that was stepped.
    pub async fn step_next(&self) -> Option<CheckpointKey> {
        let checkpoint = self.claim_next(Instant::now())?;
        let key = checkpoint.key();
        self.step(checkpoint).await;
        Some(key)
    }

    /// Pick the eligible pair attempted longest ago and mark it `Crawling`.
    fn claim_next(&self, now: Instant) -> Option<Checkpoint> {
        let mut pairs = self.pairs.lock();
        let entry = pairs
            .values_mut()
            .filter(|e| e.eligible(now))
            .min_by_key(|e| (e.last_attempt, e.seq))?;
        entry.state = PairState::Crawling;
        entry.last_attempt = Some(now);
        Some(entry.checkpoint.clone())
    }

    /// Earliest backoff or politeness deadline among idle pairs.
    fn next_wakeup(&self) -> Option<Instant> {
        self.pairs
            .lock()
            .values()
            .filter(|e| e.state == PairState::Idle)
            .map(|e| e.not_before.unwrap_or_else(Instant::now))
            .min()
    }

    #[instrument(skip_all, fields(room_id = %checkpoint.room_id, direction = %checkpoint.direction))]
    async fn step(&self, checkpoint: Checkpoint) {
        if let Some(m) = &self.metrics {
            m.gauge_inc("crawler.in_flight", &[], 1.0);
        }
        let started = Instant::now();
        let result = self.try_step(&checkpoint).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        if let Some(m) = &self.metrics {
            m.gauge_inc("crawler.in_flight", &[], -1.0);
        }

        match result {
            Ok(StepOutcome::Advanced { next, indexed }) => {
                self.on_step_completed(&checkpoint, indexed, duration_ms);
                let mut pairs = self.pairs.lock();
                if let Some(entry) = pairs.get_mut(&checkpoint.key()) {
                    entry.checkpoint = next;
                    entry.state = PairState::Idle;
                    entry.failures = 0;
                    entry.last_error = None;
                    entry.not_before = Some(Instant::now() + self.config.step_interval);
                }
            }
            Ok(StepOutcome::Done { indexed }) => {
                if indexed > 0 {
                    self.on_step_completed(&checkpoint, indexed, duration_ms);
                }
                self.set_state(&checkpoint.key(), PairState::Done);
                info!(room_id = %checkpoint.room_id, direction = %checkpoint.direction, "room crawl finished");
                if let Some(m) = &self.metrics {
                    m.counter_inc("crawler.rooms_done", &[], 1);
                }
                self.emit(CrawlEvent::RoomDone {
                    room_id: checkpoint.room_id.clone(),
                    direction: checkpoint.direction,
                });
            }
            Err(e) => self.on_failure(&checkpoint, e),
        }
    }

    async fn try_step(&self, checkpoint: &Checkpoint) -> Result<StepOutcome, BridgeError> {
        let batch = self.call(self.loader.load_events(checkpoint)).await?;

        if batch.events.is_empty() {
            return match batch.next {
                None => {
                    self.call(self.checkpoints.remove_checkpoint(checkpoint)).await?;
                    Ok(StepOutcome::Done { indexed: 0 })
                }
                Some(next) => {
                    self.call(self.checkpoints.replace_checkpoint(checkpoint, Some(&next)))
                        .await?;
                    Ok(StepOutcome::Advanced { next, indexed: 0 })
                }
            };
        }

        let indexed = batch.events.len();
        let already_indexed = self
            .call(
                self.index
                    .add_historic_events(&batch.events, batch.next.as_ref(), Some(checkpoint)),
            )
            .await?;

        match batch.next {
            None => Ok(StepOutcome::Done { indexed }),
            Some(next) if already_indexed && !checkpoint.full_crawl => {
                debug!(room_id = %checkpoint.room_id, "reached indexed history, stopping partial crawl");
                self.call(self.checkpoints.remove_checkpoint(&next)).await?;
                Ok(StepOutcome::Done { indexed })
            }
            Some(next) => Ok(StepOutcome::Advanced { next, indexed }),
        }
    }

    fn on_step_completed(&self, checkpoint: &Checkpoint, indexed: usize, duration_ms: u64) {
        debug!(
            room_id = %checkpoint.room_id,
            direction = %checkpoint.direction,
            events = indexed,
            duration_ms,
            "crawl step completed"
        );
        if let Some(m) = &self.metrics {
            m.counter_inc("crawler.steps", &[], 1);
            m.counter_inc("crawler.events_indexed", &[], indexed as u64);
            m.histogram_observe("crawler.step_ms", &[], duration_ms as f64);
        }
        self.emit(CrawlEvent::StepCompleted {
            room_id: checkpoint.room_id.clone(),
            direction: checkpoint.direction,
            events_indexed: indexed,
            duration_ms,
        });
    }

    fn on_failure(&self, checkpoint: &Checkpoint, err: BridgeError) {
        if let Some(m) = &self.metrics {
            m.counter_inc("crawler.failures", &[("kind", err.error_kind())], 1);
        }

        let event = {
            let mut pairs = self.pairs.lock();
            let Some(entry) = pairs.get_mut(&checkpoint.key()) else {
                return;
            };
            entry.failures += 1;
            entry.last_error = Some(err.to_string());

            if !err.is_retryable() || entry.failures >= self.config.max_failures {
                entry.state = PairState::Stalled;
                entry.not_before = None;
                CrawlEvent::RoomStalled {
                    room_id: checkpoint.room_id.clone(),
                    direction: checkpoint.direction,
                    failures: entry.failures,
                    error: err.to_string(),
                }
            } else {
                let delay = self.config.backoff.delay(entry.failures - 1);
                entry.state = PairState::Idle;
                entry.not_before = Some(Instant::now() + delay);
                CrawlEvent::RetryScheduled {
                    room_id: checkpoint.room_id.clone(),
                    direction: checkpoint.direction,
                    attempt: entry.failures,
                    delay_ms: delay.as_millis() as u64,
                    error: err.to_string(),
                }
            }
        };

        match &event {
            CrawlEvent::RoomStalled { failures, .. } => {
                warn!(
                    room_id = %checkpoint.room_id,
                    direction = %checkpoint.direction,
                    failures,
                    error = %err,
                    kind = err.error_kind(),
                    "room crawl stalled"
                );
                if let Some(m) = &self.metrics {
                    m.gauge_set("crawler.rooms_stalled", &[], self.status().stalled as f64);
                }
            }
            CrawlEvent::RetryScheduled { attempt, delay_ms, .. } => {
                info!(
                    room_id = %checkpoint.room_id,
                    direction = %checkpoint.direction,
                    attempt,
                    delay_ms,
                    error = %err,
                    "crawl step failed, retrying"
                );
            }
            _ => {}
        }
        self.emit(event);
    }

    fn set_state(&self, key: &CheckpointKey, state: PairState) {
        if let Some(entry) = self.pairs.lock().get_mut(key) {
            entry.state = state;
            entry.not_before = None;
        }
    }

    fn emit(&self, event: CrawlEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, BridgeError>>,
    ) -> Result<T, BridgeError> {
        let limit = self.config.request_timeout;
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout(limit)),
        }
    }
}
