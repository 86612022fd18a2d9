pub mod checkpoint;
pub mod crawl;
pub mod errors;
pub mod event;
pub mod ids;
pub mod index;
pub mod keys;
pub mod search;

pub use checkpoint::{Checkpoint, CheckpointKey, Direction};
pub use errors::BridgeError;
pub use event::{EventAndProfile, HistoricEventBatch, MatrixEvent, Profile};
pub use ids::{DeviceId, EventId, RoomId, UserId};
pub use index::{CheckpointStore, EventIndex, HistoryLoader, KeyStore};
