//! SQLite-backed event index.
//!
//! Historic pages and their checkpoint swap share one transaction. Live
//! events are staged in memory and only become durable (and searchable) on
//! `commit_live_events`.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use lore_core::checkpoint::Checkpoint;
use lore_core::errors::BridgeError;
use lore_core::event::{EventAndProfile, MatrixEvent, Profile};
use lore_core::ids::{EventId, RoomId};
use lore_core::index::{CheckpointStore, EventIndex};
use lore_core::search::{IndexStats, LoadFileArgs, SearchArgs, SearchResults};

use crate::checkpoints::{self, CheckpointRepo};
use crate::database::Database;
use crate::error::StoreError;
use crate::events::{self, EventRepo};

pub struct SqliteIndex {
    db: Database,
    events: EventRepo,
    checkpoints: CheckpointRepo,
    pending: Mutex<Vec<EventAndProfile>>,
}

impl SqliteIndex {
    pub fn new(db: Database) -> Self {
        Self {
            events: EventRepo::new(db.clone()),
            checkpoints: CheckpointRepo::new(db.clone()),
            db,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn checkpoints(&self) -> &CheckpointRepo {
        &self.checkpoints
    }

    /// Number of staged live events.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Insert a historic page and swap the checkpoint in one transaction.
    /// Returns true when the page was non-empty and nothing in it was new.
    /// A replay of a write that already committed (same page, same swap)
    /// returns false: its events were inserted by the first attempt, not
    /// found in earlier history.
    #[instrument(skip_all, fields(count = page.len()))]
    pub fn add_historic(
        &self,
        page: &[EventAndProfile],
        checkpoint: Option<&Checkpoint>,
        old_checkpoint: Option<&Checkpoint>,
    ) -> Result<bool, StoreError> {
        let keys = checkpoints::lock_set(old_checkpoint, checkpoint);
        self.checkpoints.with_key_locks(&keys, || {
            self.db.with_tx(|tx| {
                let mut inserted = 0usize;
                for item in page {
                    if events::insert_in_tx(tx, &item.event, &item.profile)? {
                        inserted += 1;
                    }
                }
                let replayed = checkpoints::swap_in_tx(tx, old_checkpoint, checkpoint)?;
                debug!(inserted, replayed, "historic page written");
                Ok(!page.is_empty() && inserted == 0 && !replayed)
            })
        })
    }

    /// Flush staged live events in one transaction.
    pub fn commit_pending(&self) -> Result<usize, StoreError> {
        let staged = std::mem::take(&mut *self.pending.lock());
        if staged.is_empty() {
            return Ok(0);
        }
        let result = self.db.with_tx(|tx| {
            let mut inserted = 0usize;
            for item in &staged {
                if events::insert_in_tx(tx, &item.event, &item.profile)? {
                    inserted += 1;
                }
            }
            Ok(inserted)
        });
        match result {
            Ok(inserted) => {
                debug!(staged = staged.len(), inserted, "live events committed");
                Ok(inserted)
            }
            Err(e) => {
                // Put the batch back in front of anything staged meanwhile.
                let mut pending = self.pending.lock();
                let later = std::mem::replace(&mut *pending, staged);
                pending.extend(later);
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> Result<IndexStats, StoreError> {
        let (event_count, room_count) = self.events.count()?;
        Ok(IndexStats {
            event_count,
            room_count,
            size: self.db.size_bytes()?,
        })
    }

    /// Drop every event, checkpoint and the stored user version.
    pub fn wipe(&self) -> Result<(), StoreError> {
        self.pending.lock().clear();
        self.events.clear()?;
        self.checkpoints.clear()?;
        self.events.clear_user_version()?;
        info!(path = %self.db.path().display(), "event index wiped");
        Ok(())
    }
}

#[async_trait]
impl EventIndex for SqliteIndex {
    async fn supports_event_indexing(&self) -> Result<bool, BridgeError> {
        Ok(true)
    }

    async fn init_event_index(&self) -> Result<(), BridgeError> {
        // Schema is created when the database is opened.
        Ok(())
    }

    async fn close_event_index(&self) -> Result<(), BridgeError> {
        self.commit_pending()?;
        Ok(())
    }

    async fn delete_event_index(&self) -> Result<(), BridgeError> {
        Ok(self.wipe()?)
    }

    async fn is_event_index_empty(&self) -> Result<bool, BridgeError> {
        Ok(self.events.is_empty()?)
    }

    async fn is_room_indexed(&self, room_id: &RoomId) -> Result<bool, BridgeError> {
        Ok(self.events.is_room_indexed(room_id)?)
    }

    async fn add_event_to_index(
        &self,
        event: &MatrixEvent,
        profile: &Profile,
    ) -> Result<(), BridgeError> {
        self.pending
            .lock()
            .push(EventAndProfile::new(event.clone(), profile.clone()));
        Ok(())
    }

    async fn commit_live_events(&self) -> Result<(), BridgeError> {
        self.commit_pending()?;
        Ok(())
    }

    async fn delete_event(&self, event_id: &EventId) -> Result<bool, BridgeError> {
        self.pending.lock().retain(|p| p.event.event_id != *event_id);
        Ok(self.events.delete(event_id)?)
    }

    async fn add_historic_events(
        &self,
        events: &[EventAndProfile],
        checkpoint: Option<&Checkpoint>,
        old_checkpoint: Option<&Checkpoint>,
    ) -> Result<bool, BridgeError> {
        Ok(self.add_historic(events, checkpoint, old_checkpoint)?)
    }

    async fn search_event_index(&self, args: &SearchArgs) -> Result<SearchResults, BridgeError> {
        Ok(self.events.search(args)?)
    }

    async fn load_file_events(
        &self,
        args: &LoadFileArgs,
    ) -> Result<Vec<EventAndProfile>, BridgeError> {
        Ok(self.events.load_file_events(args)?)
    }

    async fn get_stats(&self) -> Result<IndexStats, BridgeError> {
        Ok(self.stats()?)
    }

    async fn get_user_version(&self) -> Result<u32, BridgeError> {
        Ok(self.events.user_version()?)
    }

    async fn set_user_version(&self, version: u32) -> Result<(), BridgeError> {
        Ok(self.events.set_user_version(version)?)
    }
}

#[async_trait]
impl CheckpointStore for SqliteIndex {
    async fn add_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), BridgeError> {
        Ok(self.checkpoints.add(checkpoint)?)
    }

    async fn remove_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), BridgeError> {
        self.checkpoints.remove(checkpoint)?;
        Ok(())
    }

    async fn load_checkpoints(&self) -> Result<Vec<Checkpoint>, BridgeError> {
        Ok(self.checkpoints.list()?)
    }

    async fn replace_checkpoint(
        &self,
        old: &Checkpoint,
        new: Option<&Checkpoint>,
    ) -> Result<(), BridgeError> {
        Ok(self.checkpoints.replace(old, new)?)
    }
}
