//! Unprivileged side: the index and checkpoint store as seen through a
//! channel. Every call is one envelope round trip with a timeout.

use async_trait::async_trait;
use serde_json::Value;

use lore_core::checkpoint::Checkpoint;
use lore_core::errors::BridgeError;
use lore_core::event::{EventAndProfile, MatrixEvent, Profile};
use lore_core::ids::{EventId, RoomId};
use lore_core::index::{CheckpointStore, EventIndex};
use lore_core::search::{IndexStats, LoadFileArgs, SearchArgs, SearchResults};

use crate::channel::BridgeClient;
use crate::envelope::{IndexRequest, PlatformRequest};

#[derive(Clone)]
pub struct IndexProxy {
    client: BridgeClient,
}

impl IndexProxy {
    pub fn new(client: BridgeClient) -> Self {
        Self { client }
    }

    async fn unit(&self, request: IndexRequest) -> Result<(), BridgeError> {
        self.client.request::<_, Value>(&request).await.map(|_| ())
    }

    pub async fn platform_version(&self) -> Result<String, BridgeError> {
        self.client.request(&PlatformRequest::GetVersion).await
    }

    pub async fn platform_config(&self) -> Result<Value, BridgeError> {
        self.client.request(&PlatformRequest::GetConfig).await
    }
}

#[async_trait]
impl EventIndex for IndexProxy {
    async fn supports_event_indexing(&self) -> Result<bool, BridgeError> {
        self.client.request(&IndexRequest::SupportsEventIndexing).await
    }

    async fn init_event_index(&self) -> Result<(), BridgeError> {
        self.unit(IndexRequest::InitEventIndex).await
    }

    async fn close_event_index(&self) -> Result<(), BridgeError> {
        self.unit(IndexRequest::CloseEventIndex).await
    }

    async fn delete_event_index(&self) -> Result<(), BridgeError> {
        self.unit(IndexRequest::DeleteEventIndex).await
    }

    async fn is_event_index_empty(&self) -> Result<bool, BridgeError> {
        self.client.request(&IndexRequest::IsEventIndexEmpty).await
    }

    async fn is_room_indexed(&self, room_id: &RoomId) -> Result<bool, BridgeError> {
        self.client
            .request(&IndexRequest::IsRoomIndexed {
                room_id: room_id.clone(),
            })
            .await
    }

    async fn add_event_to_index(&self, event: &MatrixEvent, profile: &Profile) -> Result<(), BridgeError> {
        self.unit(IndexRequest::AddEventToIndex {
            ev: event.clone(),
            profile: profile.clone(),
        })
        .await
    }

    async fn commit_live_events(&self) -> Result<(), BridgeError> {
        self.unit(IndexRequest::CommitLiveEvents).await
    }

    async fn delete_event(&self, event_id: &EventId) -> Result<bool, BridgeError> {
        self.client
            .request(&IndexRequest::DeleteEvent {
                event_id: event_id.clone(),
            })
            .await
    }

    async fn add_historic_events(
        &self,
        events: &[EventAndProfile],
        checkpoint: Option<&Checkpoint>,
        old_checkpoint: Option<&Checkpoint>,
    ) -> Result<bool, BridgeError> {
        self.client
            .request(&IndexRequest::AddHistoricEvents {
                events: events.to_vec(),
                checkpoint: checkpoint.cloned(),
                old_checkpoint: old_checkpoint.cloned(),
            })
            .await
    }

    async fn search_event_index(&self, args: &SearchArgs) -> Result<SearchResults, BridgeError> {
        self.client
            .request(&IndexRequest::SearchEventIndex {
                term: None,
                config: args.clone(),
            })
            .await
    }

    async fn load_file_events(&self, args: &LoadFileArgs) -> Result<Vec<EventAndProfile>, BridgeError> {
        self.client
            .request(&IndexRequest::LoadFileEvents(args.clone()))
            .await
    }

    async fn get_stats(&self) -> Result<IndexStats, BridgeError> {
        self.client.request(&IndexRequest::GetStats).await
    }

    async fn get_user_version(&self) -> Result<u32, BridgeError> {
        self.client.request(&IndexRequest::GetUserVersion).await
    }

    async fn set_user_version(&self, version: u32) -> Result<(), BridgeError> {
        self.unit(IndexRequest::SetUserVersion { version }).await
    }
}

#[async_trait]
impl CheckpointStore for IndexProxy {
    async fn add_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), BridgeError> {
        self.unit(IndexRequest::AddCrawlerCheckpoint {
            checkpoint: checkpoint.clone(),
        })
        .await
    }

    async fn remove_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), BridgeError> {
        self.unit(IndexRequest::RemoveCrawlerCheckpoint {
            old_checkpoint: checkpoint.clone(),
        })
        .await
    }

    async fn load_checkpoints(&self) -> Result<Vec<Checkpoint>, BridgeError> {
        self.client.request(&IndexRequest::LoadCheckpoints).await
    }

    async fn replace_checkpoint(
        &self,
        old: &Checkpoint,
        new: Option<&Checkpoint>,
    ) -> Result<(), BridgeError> {
        self.unit(IndexRequest::ReplaceCrawlerCheckpoint {
            old_checkpoint: old.clone(),
            checkpoint: new.cloned(),
        })
        .await
    }
}
