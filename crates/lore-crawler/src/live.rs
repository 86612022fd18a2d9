//! Live timeline ingestion: events arriving from sync are staged in the
//! index and committed in batches.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument};

use lore_core::errors::BridgeError;
use lore_core::event::{MatrixEvent, Profile};
use lore_core::ids::EventId;
use lore_core::index::EventIndex;
use lore_settings::CrawlerSettings;

const REDACTION_TYPE: &str = "m.room.redaction";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LiveOutcome {
    Staged,
    Skipped,
    /// A redaction removed the target from the index.
    Redacted { removed: bool },
}

pub struct LiveIndexer {
    index: Arc<dyn EventIndex>,
    commit_every: usize,
    staged: AtomicUsize,
}

impl LiveIndexer {
    pub fn new(index: Arc<dyn EventIndex>, commit_every: usize) -> Self {
        Self {
            index,
            commit_every: commit_every.max(1),
            staged: AtomicUsize::new(0),
        }
    }

    pub fn from_settings(index: Arc<dyn EventIndex>, settings: &CrawlerSettings) -> Self {
        Self::new(index, settings.live_commit_every)
    }

    /// Events staged since the last commit.
    pub fn staged(&self) -> usize {
        self.staged.load(Ordering::SeqCst)
    }

    #[instrument(skip_all, fields(event_id = %event.event_id, room_id = %event.room_id))]
    pub async fn add(&self, event: &MatrixEvent, profile: &Profile) -> Result<LiveOutcome, BridgeError> {
        if event.event_type == REDACTION_TYPE {
            let Some(target) = redacted_event_id(event) else {
                return Ok(LiveOutcome::Skipped);
            };
            let removed = self.index.delete_event(&target).await?;
            debug!(target = %target, removed, "redaction applied to index");
            return Ok(LiveOutcome::Redacted { removed });
        }

        if !event.is_indexable() {
            return Ok(LiveOutcome::Skipped);
        }

        self.index.add_event_to_index(event, profile).await?;
        let staged = self.staged.fetch_add(1, Ordering::SeqCst) + 1;
        if staged >= self.commit_every {
            self.commit().await?;
        }
        Ok(LiveOutcome::Staged)
    }

    pub async fn commit(&self) -> Result<(), BridgeError> {
        self.index.commit_live_events().await?;
        let flushed = self.staged.swap(0, Ordering::SeqCst);
        debug!(flushed, "live events committed");
        Ok(())
    }
}

/// Target of a redaction: top-level `redacts`, or `content.redacts` in
/// newer room versions.
fn redacted_event_id(event: &MatrixEvent) -> Option<EventId> {
    event
        .extra
        .get("redacts")
        .or_else(|| event.content.get("redacts"))
        .and_then(Value::as_str)
        .map(EventId::from_raw)
}
