//! Deterministic collaborators for exercising the crawler without a
//! homeserver.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use lore_core::checkpoint::{Checkpoint, CheckpointKey, Direction};
use lore_core::errors::BridgeError;
use lore_core::event::{EventAndProfile, HistoricEventBatch, MatrixEvent, Profile};
use lore_core::ids::{EventId, RoomId};
use lore_core::index::{EventIndex, HistoryLoader};
use lore_core::search::{IndexStats, LoadFileArgs, SearchArgs, SearchResults};

/// `count` text messages for `room`, ids `$<prefix>-<i>`.
pub fn messages(room: &RoomId, prefix: &str, count: usize) -> Vec<EventAndProfile> {
    (0..count)
        .map(|i| {
            let event = MatrixEvent::message(
                format!("${prefix}-{i}"),
                room.clone(),
                "@alice:localhost",
                1_700_000_000_000 + i as i64,
                &format!("{prefix} message {i}"),
            );
            EventAndProfile::new(event, Profile::named("Alice"))
        })
        .collect()
}

/// Batch consumed from `from`, continuing at `next` when given.
pub fn page(from: &Checkpoint, events: Vec<EventAndProfile>, next: Option<&str>) -> HistoricEventBatch {
    HistoricEventBatch {
        events,
        consumed: from.clone(),
        next: next.map(|token| from.advance(token)),
    }
}

#[derive(Default)]
struct Tracking {
    calls: HashMap<String, usize>,
    in_flight: HashMap<CheckpointKey, usize>,
    max_in_flight: HashMap<CheckpointKey, usize>,
}

/// Replays scripted results per checkpoint token. The last scripted result
/// for a token repeats forever, so a token with one entry behaves like an
/// idempotent page.
pub struct ScriptedLoader {
    scripts: Mutex<HashMap<String, VecDeque<Result<HistoricEventBatch, BridgeError>>>>,
    delay: Option<Duration>,
    tracking: Mutex<Tracking>,
}

impl Default for ScriptedLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedLoader {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            delay: None,
            tracking: Mutex::new(Tracking::default()),
        }
    }

    /// Every load sleeps for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn script(
        self,
        token: impl Into<String>,
        results: Vec<Result<HistoricEventBatch, BridgeError>>,
    ) -> Self {
        self.scripts.lock().insert(token.into(), results.into());
        self
    }

    /// Times `token` was loaded.
    pub fn calls(&self, token: &str) -> usize {
        self.tracking.lock().calls.get(token).copied().unwrap_or(0)
    }

    /// Highest number of overlapping loads seen for one room-direction.
    pub fn max_in_flight(&self, key: &CheckpointKey) -> usize {
        self.tracking.lock().max_in_flight.get(key).copied().unwrap_or(0)
    }

    fn next_result(&self, token: &str) -> Result<HistoricEventBatch, BridgeError> {
        let mut scripts = self.scripts.lock();
        let Some(queue) = scripts.get_mut(token) else {
            return Err(BridgeError::Codec(format!("no script for token {token}")));
        };
        match queue.len() {
            0 => Err(BridgeError::Codec(format!("script for {token} is empty"))),
            1 => queue[0].clone(),
            _ => queue.pop_front().unwrap_or_else(|| {
                Err(BridgeError::Codec(format!("script for {token} is empty")))
            }),
        }
    }
}

#[async_trait]
impl HistoryLoader for ScriptedLoader {
    async fn load_events(&self, checkpoint: &Checkpoint) -> Result<HistoricEventBatch, BridgeError> {
        let key = checkpoint.key();
        {
            let mut t = self.tracking.lock();
            *t.calls.entry(checkpoint.token.clone()).or_default() += 1;
            let now = {
                let n = t.in_flight.entry(key.clone()).or_default();
                *n += 1;
                *n
            };
            let max = t.max_in_flight.entry(key.clone()).or_default();
            *max = (*max).max(now);
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.next_result(&checkpoint.token);

        if let Some(n) = self.tracking.lock().in_flight.get_mut(&key) {
            *n = n.saturating_sub(1);
        }
        result
    }
}

/// Serves rooms with a fixed timeline. Tokens are positions into the
/// timeline: a backward page from `n` covers `[n - page_size, n)` newest
/// first, a forward page from `n` covers `[n, n + page_size)`.
pub struct TimelineLoader {
    page_size: usize,
    rooms: HashMap<RoomId, Vec<EventAndProfile>>,
}

impl TimelineLoader {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            rooms: HashMap::new(),
        }
    }

    pub fn with_room(mut self, room: RoomId, events: usize) -> Self {
        let prefix = room.as_str().trim_start_matches('!').replace(':', "-");
        let timeline = messages(&room, &prefix, events);
        self.rooms.insert(room, timeline);
        self
    }

    /// Position just past the newest event.
    pub fn head(&self, room: &RoomId) -> usize {
        self.rooms.get(room).map_or(0, Vec::len)
    }
}

#[async_trait]
impl HistoryLoader for TimelineLoader {
    async fn load_events(&self, checkpoint: &Checkpoint) -> Result<HistoricEventBatch, BridgeError> {
        let timeline = self
            .rooms
            .get(&checkpoint.room_id)
            .ok_or_else(|| BridgeError::Codec(format!("unknown room {}", checkpoint.room_id)))?;
        let pos: usize = checkpoint
            .token
            .parse()
            .map_err(|_| BridgeError::Codec(format!("bad token {}", checkpoint.token)))?;
        let pos = pos.min(timeline.len());

        let (range, next) = match checkpoint.direction {
            Direction::Backward => {
                if pos == 0 {
                    return Ok(HistoricEventBatch::exhausted(checkpoint.clone()));
                }
                let start = pos.saturating_sub(self.page_size);
                (start..pos, start)
            }
            Direction::Forward => {
                if pos >= timeline.len() {
                    return Ok(HistoricEventBatch::exhausted(checkpoint.clone()));
                }
                let end = (pos + self.page_size).min(timeline.len());
                (pos..end, end)
            }
        };

        let mut events = timeline[range].to_vec();
        if checkpoint.direction == Direction::Backward {
            events.reverse();
        }
        Ok(HistoricEventBatch {
            events,
            consumed: checkpoint.clone(),
            next: Some(checkpoint.advance(next.to_string())),
        })
    }
}

/// Index wrapper whose next `n` historic writes fail with a transient error.
pub struct FlakyIndex {
    inner: Arc<dyn EventIndex>,
    failures_left: AtomicU32,
    lose_replies: bool,
}

impl FlakyIndex {
    pub fn new(inner: Arc<dyn EventIndex>, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
            lose_replies: false,
        }
    }

    /// Failing writes still commit; only the reply is lost.
    pub fn losing_replies(mut self) -> Self {
        self.lose_replies = true;
        self
    }

    fn should_fail(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EventIndex for FlakyIndex {
    async fn supports_event_indexing(&self) -> Result<bool, BridgeError> {
        self.inner.supports_event_indexing().await
    }

    async fn init_event_index(&self) -> Result<(), BridgeError> {
        self.inner.init_event_index().await
    }

    async fn close_event_index(&self) -> Result<(), BridgeError> {
        self.inner.close_event_index().await
    }

    async fn delete_event_index(&self) -> Result<(), BridgeError> {
        self.inner.delete_event_index().await
    }

    async fn is_event_index_empty(&self) -> Result<bool, BridgeError> {
        self.inner.is_event_index_empty().await
    }

    async fn is_room_indexed(&self, room_id: &RoomId) -> Result<bool, BridgeError> {
        self.inner.is_room_indexed(room_id).await
    }

    async fn add_event_to_index(&self, event: &MatrixEvent, profile: &Profile) -> Result<(), BridgeError> {
        self.inner.add_event_to_index(event, profile).await
    }

    async fn commit_live_events(&self) -> Result<(), BridgeError> {
        self.inner.commit_live_events().await
    }

    async fn delete_event(&self, event_id: &EventId) -> Result<bool, BridgeError> {
        self.inner.delete_event(event_id).await
    }

    async fn add_historic_events(
        &self,
        events: &[EventAndProfile],
        checkpoint: Option<&Checkpoint>,
        old_checkpoint: Option<&Checkpoint>,
    ) -> Result<bool, BridgeError> {
        if !self.should_fail() {
            return self
                .inner
                .add_historic_events(events, checkpoint, old_checkpoint)
                .await;
        }
        if self.lose_replies {
            self.inner
                .add_historic_events(events, checkpoint, old_checkpoint)
                .await?;
            return Err(BridgeError::Timeout(Duration::from_secs(1)));
        }
        Err(BridgeError::ChannelUnavailable("injected failure".into()))
    }

    async fn search_event_index(&self, args: &SearchArgs) -> Result<SearchResults, BridgeError> {
        self.inner.search_event_index(args).await
    }

    async fn load_file_events(&self, args: &LoadFileArgs) -> Result<Vec<EventAndProfile>, BridgeError> {
        self.inner.load_file_events(args).await
    }

    async fn get_stats(&self) -> Result<IndexStats, BridgeError> {
        self.inner.get_stats().await
    }

    async fn get_user_version(&self) -> Result<u32, BridgeError> {
        self.inner.get_user_version().await
    }

    async fn set_user_version(&self, version: u32) -> Result<(), BridgeError> {
        self.inner.set_user_version(version).await
    }
}
