//! Privileged side of the boundary: decodes envelopes and calls the engine,
//! the checkpoint store and the key store.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use lore_core::errors::BridgeError;
use lore_core::index::{CheckpointStore, EventIndex, KeyStore};

use crate::envelope::{Boundary, Envelope, IndexRequest, KeyRequest, PlatformRequest, Reply};

/// What `getVersion` / `getConfig` answer with.
#[derive(Clone, Debug, Default)]
pub struct PlatformInfo {
    pub version: String,
    /// Client-facing configuration. Must not carry credentials.
    pub config: Value,
}

pub struct Host {
    index: Arc<dyn EventIndex>,
    checkpoints: Arc<dyn CheckpointStore>,
    keys: Arc<dyn KeyStore>,
    platform: PlatformInfo,
}

impl Host {
    pub fn new(
        index: Arc<dyn EventIndex>,
        checkpoints: Arc<dyn CheckpointStore>,
        keys: Arc<dyn KeyStore>,
        platform: PlatformInfo,
    ) -> Self {
        Self {
            index,
            checkpoints,
            keys,
            platform,
        }
    }

    pub fn index(&self) -> &Arc<dyn EventIndex> {
        &self.index
    }

    /// Never fails: every error becomes a failed reply.
    pub async fn handle(&self, envelope: Envelope) -> Reply {
        let id = envelope.id;
        let result = match envelope.boundary {
            Boundary::Index => match envelope.decode::<IndexRequest>() {
                Ok(req) => self.dispatch_index(req).await,
                Err(e) => Err(e),
            },
            Boundary::Keys => match envelope.decode::<KeyRequest>() {
                Ok(req) => self.dispatch_keys(req).await,
                Err(e) => Err(e),
            },
            Boundary::Platform => match envelope.decode::<PlatformRequest>() {
                Ok(req) => Ok(self.dispatch_platform(req)),
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(value) => Reply::ok(id, value),
            Err(e) => {
                debug!(method = %envelope.method, code = e.wire_code(), error = %e, "request failed");
                Reply::err(id, &e)
            }
        }
    }

    async fn dispatch_index(&self, req: IndexRequest) -> Result<Value, BridgeError> {
        let index = &self.index;
        match req {
            IndexRequest::SupportsEventIndexing => to_value(index.supports_event_indexing().await?),
            IndexRequest::InitEventIndex => to_value(index.init_event_index().await?),
            IndexRequest::CloseEventIndex => to_value(index.close_event_index().await?),
            IndexRequest::DeleteEventIndex => to_value(index.delete_event_index().await?),
            IndexRequest::IsEventIndexEmpty => to_value(index.is_event_index_empty().await?),
            IndexRequest::IsRoomIndexed { room_id } => {
                to_value(index.is_room_indexed(&room_id).await?)
            }
            IndexRequest::AddEventToIndex { ev, profile } => {
                to_value(index.add_event_to_index(&ev, &profile).await?)
            }
            IndexRequest::CommitLiveEvents => to_value(index.commit_live_events().await?),
            IndexRequest::DeleteEvent { event_id } => to_value(index.delete_event(&event_id).await?),
            IndexRequest::AddHistoricEvents {
                events,
                checkpoint,
                old_checkpoint,
            } => to_value(
                index
                    .add_historic_events(&events, checkpoint.as_ref(), old_checkpoint.as_ref())
                    .await?,
            ),
            IndexRequest::SearchEventIndex { term, mut config } => {
                if let Some(term) = term.filter(|t| !t.is_empty()) {
                    config.search_term = term;
                }
                to_value(index.search_event_index(&config).await?)
            }
            IndexRequest::LoadFileEvents(args) => to_value(index.load_file_events(&args).await?),
            IndexRequest::GetStats => to_value(index.get_stats().await?),
            IndexRequest::GetUserVersion => to_value(index.get_user_version().await?),
            IndexRequest::SetUserVersion { version } => {
                to_value(index.set_user_version(version).await?)
            }
            IndexRequest::AddCrawlerCheckpoint { checkpoint } => {
                to_value(self.checkpoints.add_checkpoint(&checkpoint).await?)
            }
            IndexRequest::RemoveCrawlerCheckpoint { old_checkpoint } => {
                to_value(self.checkpoints.remove_checkpoint(&old_checkpoint).await?)
            }
            IndexRequest::ReplaceCrawlerCheckpoint {
                old_checkpoint,
                checkpoint,
            } => to_value(
                self.checkpoints
                    .replace_checkpoint(&old_checkpoint, checkpoint.as_ref())
                    .await?,
            ),
            IndexRequest::LoadCheckpoints => to_value(self.checkpoints.load_checkpoints().await?),
        }
    }

    async fn dispatch_keys(&self, req: KeyRequest) -> Result<Value, BridgeError> {
        let result = match &req {
            KeyRequest::GetPickleKey(owner) => self
                .keys
                .get_pickle_key(owner)
                .await
                .map(|key| key.map_or(Value::Null, |k| Value::String(k.expose().to_string()))),
            KeyRequest::CreatePickleKey(owner) => self
                .keys
                .create_pickle_key(owner)
                .await
                .map(|k| Value::String(k.expose().to_string())),
            KeyRequest::DestroyPickleKey(owner) => {
                self.keys.destroy_pickle_key(owner).await.map(|()| Value::Null)
            }
        };
        if let Err(e) = &result {
            let owner = req.owner();
            warn!(user_id = %owner.user_id, device_id = %owner.device_id, error = %e, "key store request failed");
        }
        result
    }

    fn dispatch_platform(&self, req: PlatformRequest) -> Value {
        match req {
            PlatformRequest::GetVersion => Value::String(self.platform.version.clone()),
            PlatformRequest::GetConfig => self.platform.config.clone(),
        }
    }
}

/// Host over a fresh in-memory database.
#[cfg(test)]
pub(crate) fn test_host() -> Host {
    use lore_store::{Database, SqliteIndex};

    use crate::keystore::EncryptedKeyStore;
    use crate::secrets::MasterKey;

    let db = Database::in_memory().expect("in-memory database");
    let index = Arc::new(SqliteIndex::new(db.clone()));
    let keys = Arc::new(EncryptedKeyStore::new(db, MasterKey::generate()));
    Host::new(
        index.clone(),
        index,
        keys,
        PlatformInfo {
            version: "0.1.0".into(),
            config: serde_json::json!({"brand": "lore"}),
        },
    )
}

fn to_value<T: Serialize>(value: T) -> Result<Value, BridgeError> {
    serde_json::to_value(value).map_err(|e| BridgeError::Codec(e.to_string()))
}
