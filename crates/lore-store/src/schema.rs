/// SQL DDL for the lore index database.
/// WAL mode enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL,
    sender TEXT NOT NULL,
    type TEXT NOT NULL,
    origin_server_ts INTEGER NOT NULL,
    body TEXT,
    url TEXT,
    source TEXT NOT NULL,
    profile TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS crawler_checkpoints (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id TEXT NOT NULL,
    direction TEXT NOT NULL,
    token TEXT NOT NULL,
    full_crawl INTEGER NOT NULL DEFAULT 0,
    UNIQUE (room_id, direction)
);

CREATE TABLE IF NOT EXISTS index_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pickle_keys (
    user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    ciphertext TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (user_id, device_id)
);

CREATE INDEX IF NOT EXISTS idx_events_room_ts ON events(room_id, origin_server_ts);
CREATE INDEX IF NOT EXISTS idx_events_url ON events(room_id, url) WHERE url IS NOT NULL;

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

/// `index_meta` key holding the caller-managed index version.
pub const USER_VERSION_KEY: &str = "user_version";
