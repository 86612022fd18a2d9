//! Capabilities the crawler and the boundary are written against.
//!
//! Each trait has two kinds of implementors: the engine itself on the
//! privileged side (`lore-store`), and a proxy that forwards every call
//! through an envelope channel on the unprivileged side (`lore-bridge`).

use async_trait::async_trait;

use crate::checkpoint::Checkpoint;
use crate::errors::BridgeError;
use crate::event::{EventAndProfile, HistoricEventBatch, MatrixEvent, Profile};
use crate::ids::{EventId, RoomId};
use crate::keys::{KeyOwner, PickleKey};
use crate::search::{IndexStats, LoadFileArgs, SearchArgs, SearchResults};

/// Search index surface. Every write must be safe to retry: the engine
/// dedupes by event id.
#[async_trait]
pub trait EventIndex: Send + Sync {
    async fn supports_event_indexing(&self) -> Result<bool, BridgeError>;
    async fn init_event_index(&self) -> Result<(), BridgeError>;
    async fn close_event_index(&self) -> Result<(), BridgeError>;
    async fn delete_event_index(&self) -> Result<(), BridgeError>;
    async fn is_event_index_empty(&self) -> Result<bool, BridgeError>;
    async fn is_room_indexed(&self, room_id: &RoomId) -> Result<bool, BridgeError>;

    /// Stage a live event. Not durable until `commit_live_events`.
    async fn add_event_to_index(
        &self,
        event: &MatrixEvent,
        profile: &Profile,
    ) -> Result<(), BridgeError>;

    /// Durability boundary for live events.
    async fn commit_live_events(&self) -> Result<(), BridgeError>;

    async fn delete_event(&self, event_id: &EventId) -> Result<bool, BridgeError>;

    /// Write a crawled page and swap `old_checkpoint` for `checkpoint` as one
    /// unit. Returns true when every event was already indexed.
    async fn add_historic_events(
        &self,
        events: &[EventAndProfile],
        checkpoint: Option<&Checkpoint>,
        old_checkpoint: Option<&Checkpoint>,
    ) -> Result<bool, BridgeError>;

    async fn search_event_index(&self, args: &SearchArgs) -> Result<SearchResults, BridgeError>;
    async fn load_file_events(&self, args: &LoadFileArgs)
        -> Result<Vec<EventAndProfile>, BridgeError>;
    async fn get_stats(&self) -> Result<IndexStats, BridgeError>;
    async fn get_user_version(&self) -> Result<u32, BridgeError>;
    async fn set_user_version(&self, version: u32) -> Result<(), BridgeError>;
}

/// Durable room -> crawl position map.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Fails with `DuplicateCheckpoint` if `(room_id, direction)` is taken.
    async fn add_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), BridgeError>;
    /// No-op when absent.
    async fn remove_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), BridgeError>;
    /// Ordered by insertion.
    async fn load_checkpoints(&self) -> Result<Vec<Checkpoint>, BridgeError>;
    /// Remove `old` and add `new` inside one durability boundary.
    async fn replace_checkpoint(
        &self,
        old: &Checkpoint,
        new: Option<&Checkpoint>,
    ) -> Result<(), BridgeError>;
}

/// Fetches one page of history for a checkpoint. Must be idempotent for an
/// unchanged checkpoint.
#[async_trait]
pub trait HistoryLoader: Send + Sync {
    async fn load_events(&self, checkpoint: &Checkpoint) -> Result<HistoricEventBatch, BridgeError>;
}

/// Privileged secret storage for pickle keys.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn get_pickle_key(&self, owner: &KeyOwner) -> Result<Option<PickleKey>, BridgeError>;
    async fn create_pickle_key(&self, owner: &KeyOwner) -> Result<PickleKey, BridgeError>;
    async fn destroy_pickle_key(&self, owner: &KeyOwner) -> Result<(), BridgeError>;
}
