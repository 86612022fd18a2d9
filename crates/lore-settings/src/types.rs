use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoreSettings {
    pub crawler: CrawlerSettings,
    pub bridge: BridgeSettings,
    pub index: IndexSettings,
    pub matrix: MatrixSettings,
    pub telemetry: TelemetrySettings,
}

impl LoreSettings {
    /// Reject combinations the crawler cannot run with.
    pub fn validate(&self) -> Result<()> {
        let c = &self.crawler;
        let invalid = |msg: &str| Err(SettingsError::InvalidValue(msg.to_string()));
        if c.page_size == 0 {
            return invalid("crawler.pageSize must be > 0");
        }
        if c.max_concurrent_rooms == 0 {
            return invalid("crawler.maxConcurrentRooms must be > 0");
        }
        if c.max_failures == 0 {
            return invalid("crawler.maxFailures must be > 0");
        }
        if !(0.0..=1.0).contains(&c.backoff_jitter) {
            return invalid("crawler.backoffJitter must be within 0..=1");
        }
        if c.backoff_cap_ms < c.backoff_base_ms {
            return invalid("crawler.backoffCapMs must be >= crawler.backoffBaseMs");
        }
        if self.index.user_version == 0 {
            return invalid("index.userVersion must be > 0");
        }
        Ok(())
    }
}

/// Crawl pacing, retry and concurrency.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrawlerSettings {
    /// Events requested per `/messages` page.
    pub page_size: u32,
    pub max_concurrent_rooms: usize,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Fraction of the delay added or removed at random.
    pub backoff_jitter: f64,
    /// Consecutive failures before a room-direction is stalled.
    pub max_failures: u32,
    /// Minimum gap between two steps of the same room-direction.
    pub step_interval_ms: u64,
    /// Per-call timeout for loader and index calls.
    pub request_timeout_ms: u64,
    /// Live events staged before an automatic commit.
    pub live_commit_every: usize,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_concurrent_rooms: 4,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            backoff_jitter: 0.2,
            max_failures: 3,
            step_interval_ms: 3_000,
            request_timeout_ms: 30_000,
            live_commit_every: 100,
        }
    }
}

/// Where the background host listens.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSettings {
    pub host: String,
    pub port: u16,
    pub request_timeout_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9810,
            request_timeout_ms: 30_000,
        }
    }
}

impl BridgeSettings {
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.host, self.port)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexSettings {
    /// Relative paths resolve under `~/.lore`.
    pub db_path: String,
    pub master_key_path: String,
    /// Index layout version the crawler expects. A stored version that
    /// differs triggers a wipe and rebuild.
    pub user_version: u32,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            db_path: "index.db".to_string(),
            master_key_path: "master.key".to_string(),
            user_version: 1,
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatrixSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub homeserver_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl std::fmt::Debug for MatrixSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixSettings")
            .field("homeserver_url", &self.homeserver_url)
            .field("access_token", &self.access_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    pub level: String,
    pub log_to_sqlite: bool,
    pub log_db_path: String,
    pub metrics_enabled: bool,
    pub metrics_db_path: String,
    pub metrics_snapshot_interval_secs: u64,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_sqlite: true,
            log_db_path: "logs.db".to_string(),
            metrics_enabled: true,
            metrics_db_path: "metrics.db".to_string(),
            metrics_snapshot_interval_secs: 60,
        }
    }
}

/// Resolve a configured path: absolute paths pass through, relative ones
/// land under `home`.
pub fn resolve_path(home: &Path, configured: &str) -> PathBuf {
    let path = Path::new(configured);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        home.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = LoreSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.crawler.page_size, 100);
        assert_eq!(settings.crawler.step_interval_ms, 3_000);
        assert_eq!(settings.crawler.max_failures, 3);
        assert_eq!(settings.bridge.ws_url(), "ws://127.0.0.1:9810/ws");
    }

    #[test]
    fn wire_names_are_camel_case() {
        let json = serde_json::to_value(LoreSettings::default()).unwrap();
        assert_eq!(json["crawler"]["maxConcurrentRooms"], 4);
        assert_eq!(json["index"]["userVersion"], 1);
        assert!(json["matrix"].get("accessToken").is_none());
    }

    #[test]
    fn validate_rejects_bad_backoff() {
        let mut settings = LoreSettings::default();
        settings.crawler.backoff_cap_ms = 10;
        assert!(settings.validate().is_err());

        let mut settings = LoreSettings::default();
        settings.crawler.backoff_jitter = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn access_token_not_in_debug() {
        let matrix = MatrixSettings {
            homeserver_url: Some("https://hs".into()),
            access_token: Some("syt_secret".into()),
        };
        let printed = format!("{matrix:?}");
        assert!(!printed.contains("syt_secret"));
        assert!(printed.contains("REDACTED"));
    }

    #[test]
    fn relative_paths_resolve_under_home() {
        let home = Path::new("/home/u/.lore");
        assert_eq!(resolve_path(home, "index.db"), home.join("index.db"));
        assert_eq!(resolve_path(home, "/var/lore.db"), PathBuf::from("/var/lore.db"));
    }
}
