pub mod checkpoints;
pub mod database;
pub mod engine;
pub mod error;
pub mod events;
pub mod keys;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use engine::SqliteIndex;
pub use error::StoreError;
