use lore_core::errors::BridgeError;

#[derive(Debug, thiserror::Error)]
pub enum CrawlerError {
    #[error("crawler is already running")]
    AlreadyRunning,

    #[error("index unavailable: {0}")]
    Index(#[from] BridgeError),

    #[error("invalid homeserver URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("http client: {0}")]
    Http(String),
}

impl From<reqwest::Error> for CrawlerError {
    fn from(e: reqwest::Error) -> Self {
        CrawlerError::Http(e.to_string())
    }
}
