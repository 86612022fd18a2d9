//! Resumable history crawler and the pieces around it: the Matrix page
//! loader, live ingestion and the index version gate.

pub mod backoff;
pub mod bootstrap;
pub mod config;
pub mod crawler;
pub mod error;
pub mod live;
pub mod loader;
pub mod mock;

pub use backoff::Backoff;
pub use bootstrap::open_index;
pub use config::CrawlerConfig;
pub use crawler::{CrawlStatus, Crawler, StalledPair};
pub use error::CrawlerError;
pub use live::{LiveIndexer, LiveOutcome};
pub use loader::MatrixHistoryLoader;
