use tracing::{info, warn};

use lore_core::errors::BridgeError;
use lore_core::index::EventIndex;

use crate::error::CrawlerError;

/// Open the index and make sure its stored version matches
/// `expected_version`. A mismatch wipes and rebuilds the index.
///
/// Returns `Ok(false)` when the platform cannot index at all.
pub async fn open_index(index: &dyn EventIndex, expected_version: u32) -> Result<bool, CrawlerError> {
    if !index.supports_event_indexing().await? {
        info!("event indexing is not supported here");
        return Ok(false);
    }
    index.init_event_index().await?;

    match check_version(index, expected_version).await {
        Ok(()) => Ok(true),
        Err(BridgeError::SchemaVersionMismatch { expected, found }) => {
            warn!(expected, found, "event index version changed, rebuilding");
            index.delete_event_index().await?;
            index.init_event_index().await?;
            index.set_user_version(expected).await?;
            Ok(true)
        }
        Err(e) => Err(e.into()),
    }
}

async fn check_version(index: &dyn EventIndex, expected: u32) -> Result<(), BridgeError> {
    let found = index.get_user_version().await?;
    if found == expected {
        return Ok(());
    }
    // Fresh index: stamp it instead of rebuilding.
    if found == 0 && index.is_event_index_empty().await? {
        index.set_user_version(expected).await?;
        return Ok(());
    }
    Err(BridgeError::SchemaVersionMismatch { expected, found })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use lore_core::checkpoint::Checkpoint;
    use lore_core::event::{EventAndProfile, MatrixEvent, Profile};
    use lore_core::ids::{EventId, RoomId};
    use lore_core::index::CheckpointStore;
    use lore_core::search::{IndexStats, LoadFileArgs, SearchArgs, SearchResults};
    use lore_store::SqliteIndex;

    use super::*;
    use crate::mock::messages;

    #[tokio::test]
    async fn fresh_index_gets_stamped() {
        let index = SqliteIndex::in_memory().unwrap();
        assert!(open_index(&index, 3).await.unwrap());
        assert_eq!(index.get_user_version().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn matching_version_keeps_data() {
        let index = SqliteIndex::in_memory().unwrap();
        open_index(&index, 3).await.unwrap();
        let room = RoomId::from_raw("!r:localhost");
        index
            .add_historic_events(&messages(&room, "m", 4), None, None)
            .await
            .unwrap();

        assert!(open_index(&index, 3).await.unwrap());
        assert_eq!(index.get_stats().await.unwrap().event_count, 4);
    }

    #[tokio::test]
    async fn version_mismatch_wipes_and_restamps() {
        let index = SqliteIndex::in_memory().unwrap();
        open_index(&index, 1).await.unwrap();
        let room = RoomId::from_raw("!r:localhost");
        index
            .add_historic_events(&messages(&room, "m", 4), None, None)
            .await
            .unwrap();
        index
            .add_checkpoint(&Checkpoint::backward(room, "t0"))
            .await
            .unwrap();

        assert!(open_index(&index, 2).await.unwrap());
        assert_eq!(index.get_user_version().await.unwrap(), 2);
        assert!(index.is_event_index_empty().await.unwrap());
        assert!(index.load_checkpoints().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unversioned_index_with_data_is_rebuilt() {
        let index = SqliteIndex::in_memory().unwrap();
        let room = RoomId::from_raw("!r:localhost");
        index
            .add_historic_events(&messages(&room, "m", 2), None, None)
            .await
            .unwrap();

        assert!(open_index(&index, 5).await.unwrap());
        assert!(index.is_event_index_empty().await.unwrap());
        assert_eq!(index.get_user_version().await.unwrap(), 5);
    }

    struct Unsupported;

    #[async_trait]
    impl EventIndex for Unsupported {
        async fn supports_event_indexing(&self) -> Result<bool, BridgeError> {
            Ok(false)
        }
        async fn init_event_index(&self) -> Result<(), BridgeError> {
            Err(BridgeError::Engine("must not be called".into()))
        }
        async fn close_event_index(&self) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn delete_event_index(&self) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn is_event_index_empty(&self) -> Result<bool, BridgeError> {
            Ok(true)
        }
        async fn is_room_indexed(&self, _: &RoomId) -> Result<bool, BridgeError> {
            Ok(false)
        }
        async fn add_event_to_index(&self, _: &MatrixEvent, _: &Profile) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn commit_live_events(&self) -> Result<(), BridgeError> {
            Ok(())
        }
        async fn delete_event(&self, _: &EventId) -> Result<bool, BridgeError> {
            Ok(false)
        }
        async fn add_historic_events(
            &self,
            _: &[EventAndProfile],
            _: Option<&Checkpoint>,
            _: Option<&Checkpoint>,
        ) -> Result<bool, BridgeError> {
            Ok(false)
        }
        async fn search_event_index(&self, _: &SearchArgs) -> Result<SearchResults, BridgeError> {
            Ok(SearchResults::default())
        }
        async fn load_file_events(&self, _: &LoadFileArgs) -> Result<Vec<EventAndProfile>, BridgeError> {
            Ok(Vec::new())
        }
        async fn get_stats(&self) -> Result<IndexStats, BridgeError> {
            Ok(IndexStats::default())
        }
        async fn get_user_version(&self) -> Result<u32, BridgeError> {
            Ok(0)
        }
        async fn set_user_version(&self, _: u32) -> Result<(), BridgeError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn unsupported_platform_is_not_an_error() {
        let index: Arc<dyn EventIndex> = Arc::new(Unsupported);
        assert!(!open_index(index.as_ref(), 1).await.unwrap());
    }

    #[tokio::test]
    async fn gate_works_through_a_wrapped_index() {
        let index = SqliteIndex::in_memory().unwrap();
        let flaky = crate::mock::FlakyIndex::new(Arc::new(index), 0);
        assert!(open_index(&flaky, 1).await.unwrap());
    }
}
