use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::instrument;

use lore_core::checkpoint::Direction;
use lore_core::event::{EventAndProfile, MatrixEvent, Profile};
use lore_core::ids::{EventId, RoomId};
use lore_core::search::{EventContext, LoadFileArgs, SearchArgs, SearchHit, SearchResults};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::schema::USER_VERSION_KEY;

const COLUMNS: &str = "rowid, origin_server_ts, source, profile";

/// A stored event with its position in the table.
struct EventRow {
    rowid: i64,
    ts: i64,
    event: MatrixEvent,
    profile: Profile,
}

impl EventRow {
    fn into_pair(self) -> EventAndProfile {
        EventAndProfile::new(self.event, self.profile)
    }
}

pub struct EventRepo {
    db: Database,
}

impl EventRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert one event unless its id is already indexed.
    pub fn insert(&self, event: &MatrixEvent, profile: &Profile) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| insert_in_tx(conn, event, profile))
    }

    #[instrument(skip(self), fields(event_id = %event_id))]
    pub fn delete(&self, event_id: &EventId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM events WHERE event_id = ?1", [event_id.as_str()])?;
            Ok(changed > 0)
        })
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let any: Option<i64> = conn
                .query_row("SELECT 1 FROM events LIMIT 1", [], |row| row.get(0))
                .optional()?;
            Ok(any.is_none())
        })
    }

    pub fn is_room_indexed(&self, room_id: &RoomId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let any: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM events WHERE room_id = ?1 LIMIT 1",
                    [room_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(any.is_some())
        })
    }

    pub fn count(&self) -> Result<(u64, u64), StoreError> {
        self.db.with_conn(|conn| {
            let (events, rooms): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COUNT(DISTINCT room_id) FROM events",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok((events.max(0) as u64, rooms.max(0) as u64))
        })
    }

    /// Case-insensitive substring search, newest first. `next_batch` is the
    /// offset of the next page.
    #[instrument(skip(self, args), fields(room_id = ?args.room_id, limit = args.limit))]
    pub fn search(&self, args: &SearchArgs) -> Result<SearchResults, StoreError> {
        let term = args.search_term.trim().to_lowercase();
        if term.is_empty() {
            return Ok(SearchResults::default());
        }

        let offset: u64 = match args.next_batch.as_deref() {
            None => 0,
            Some(raw) => raw
                .parse()
                .map_err(|_| StoreError::InvalidArgument(format!("next_batch: {raw}")))?,
        };
        let pattern = format!("%{}%", row_helpers::escape_like(&term));
        let room = args.room_id.as_ref().map(RoomId::as_str);

        self.db.with_conn(|conn| {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM events
                 WHERE body IS NOT NULL AND lower(body) LIKE ?1 ESCAPE '\\'
                   AND (?2 IS NULL OR room_id = ?2)",
                params![pattern, room],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM events
                 WHERE body IS NOT NULL AND lower(body) LIKE ?1 ESCAPE '\\'
                   AND (?2 IS NULL OR room_id = ?2)
                 ORDER BY origin_server_ts DESC, rowid DESC
                 LIMIT ?3 OFFSET ?4"
            ))?;
            let mut rows = stmt.query(params![pattern, room, args.limit, offset as i64])?;

            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                let hit = row_to_event(row)?;
                let context = load_context(conn, &hit, args.before_limit, args.after_limit)?;
                let rank = hit
                    .event
                    .text()
                    .map(|text| text.to_lowercase().matches(term.as_str()).count())
                    .unwrap_or(0) as f32;
                results.push(SearchHit {
                    rank,
                    result: hit.event,
                    context,
                });
            }

            if !args.order_by_recency {
                results.sort_by(|a, b| b.rank.total_cmp(&a.rank));
            }

            let total = total.max(0) as u64;
            let consumed = offset + results.len() as u64;
            Ok(SearchResults {
                count: total,
                results,
                highlights: vec![term.clone()],
                next_batch: (consumed < total).then(|| consumed.to_string()),
            })
        })
    }

    /// Page through events that carry a media URL.
    #[instrument(skip(self, args), fields(room_id = %args.room_id, limit = args.limit))]
    pub fn load_file_events(&self, args: &LoadFileArgs) -> Result<Vec<EventAndProfile>, StoreError> {
        self.db.with_conn(|conn| {
            let anchor: Option<(i64, i64)> = match &args.from_event {
                None => None,
                Some(event_id) => {
                    let found = conn
                        .query_row(
                            "SELECT origin_server_ts, rowid FROM events WHERE event_id = ?1",
                            [event_id.as_str()],
                            |row| Ok((row.get(0)?, row.get(1)?)),
                        )
                        .optional()?;
                    match found {
                        Some(pos) => Some(pos),
                        // Unknown anchor: nothing to page from.
                        None => return Ok(Vec::new()),
                    }
                }
            };

            let (cmp, order) = match args.direction {
                Direction::Backward => ("<", "DESC"),
                Direction::Forward => (">", "ASC"),
            };
            let (anchor_ts, anchor_rowid) = anchor.unwrap_or(match args.direction {
                Direction::Backward => (i64::MAX, i64::MAX),
                Direction::Forward => (i64::MIN, i64::MIN),
            });

            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM events
                 WHERE room_id = ?1 AND url IS NOT NULL
                   AND (origin_server_ts, rowid) {cmp} (?2, ?3)
                 ORDER BY origin_server_ts {order}, rowid {order}
                 LIMIT ?4"
            ))?;
            let mut rows = stmt.query(params![
                args.room_id.as_str(),
                anchor_ts,
                anchor_rowid,
                args.limit
            ])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?.into_pair());
            }
            Ok(results)
        })
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM events", [])?;
            Ok(())
        })
    }

    /// Caller-managed index version. 0 when never set.
    pub fn user_version(&self) -> Result<u32, StoreError> {
        self.db.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM index_meta WHERE key = ?1",
                    [USER_VERSION_KEY],
                    |row| row.get(0),
                )
                .optional()?;
            match raw {
                None => Ok(0),
                Some(raw) => raw.parse().map_err(|_| StoreError::CorruptRow {
                    table: "index_meta",
                    column: "value",
                    detail: format!("user version: {raw}"),
                }),
            }
        })
    }

    pub fn set_user_version(&self, version: u32) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO index_meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![USER_VERSION_KEY, version.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn clear_user_version(&self) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM index_meta WHERE key = ?1", [USER_VERSION_KEY])?;
            Ok(())
        })
    }
}

/// `INSERT OR IGNORE` keyed by event id. Returns whether a row was written.
pub fn insert_in_tx(
    conn: &Connection,
    event: &MatrixEvent,
    profile: &Profile,
) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO events
             (event_id, room_id, sender, type, origin_server_ts, body, url, source, profile)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            event.event_id.as_str(),
            event.room_id.as_str(),
            event.sender.as_str(),
            event.event_type,
            event.origin_server_ts,
            event.text(),
            event.url(),
            serde_json::to_string(event)?,
            serde_json::to_string(profile)?,
        ],
    )?;
    Ok(changed > 0)
}

/// Events from the hit's room immediately before and after it, both in
/// timeline order, plus the profiles of every sender involved.
fn load_context(
    conn: &Connection,
    hit: &EventRow,
    before_limit: u32,
    after_limit: u32,
) -> Result<EventContext, StoreError> {
    let mut profile_info = HashMap::new();
    profile_info.insert(hit.event.sender.clone(), hit.profile.clone());

    let mut fetch = |cmp: &str, order: &str, limit: u32| -> Result<Vec<MatrixEvent>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM events
             WHERE room_id = ?1 AND (origin_server_ts, rowid) {cmp} (?2, ?3)
             ORDER BY origin_server_ts {order}, rowid {order}
             LIMIT ?4"
        ))?;
        let mut rows = stmt.query(params![hit.event.room_id.as_str(), hit.ts, hit.rowid, limit])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            let row = row_to_event(row)?;
            profile_info
                .entry(row.event.sender.clone())
                .or_insert(row.profile);
            events.push(row.event);
        }
        Ok(events)
    };

    let mut events_before = fetch("<", "DESC", before_limit)?;
    events_before.reverse();
    let events_after = fetch(">", "ASC", after_limit)?;

    Ok(EventContext {
        events_before,
        events_after,
        profile_info,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<EventRow, StoreError> {
    const T: &str = "events";
    let source: String = row_helpers::get(row, 2, T, "source")?;
    let profile: String = row_helpers::get(row, 3, T, "profile")?;
    Ok(EventRow {
        rowid: row_helpers::get(row, 0, T, "rowid")?,
        ts: row_helpers::get(row, 1, T, "origin_server_ts")?,
        event: row_helpers::parse_json(&source, T, "source")?,
        profile: row_helpers::parse_json(&profile, T, "profile")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> EventRepo {
        EventRepo::new(Database::in_memory().unwrap())
    }

    fn room(s: &str) -> RoomId {
        RoomId::from_raw(s)
    }

    fn msg(id: &str, room_id: &str, ts: i64, body: &str) -> MatrixEvent {
        MatrixEvent::message(id, room(room_id), "@alice:x", ts, body)
    }

    fn file(id: &str, room_id: &str, ts: i64) -> MatrixEvent {
        let mut ev = msg(id, room_id, ts, "photo.png");
        ev.content = json!({"msgtype": "m.image", "body": "photo.png", "url": format!("mxc://x/{id}")});
        ev
    }

    #[test]
    fn insert_dedupes_by_event_id() {
        let repo = setup();
        let ev = msg("$1", "!r:x", 1, "hello");
        assert!(repo.insert(&ev, &Profile::default()).unwrap());
        assert!(!repo.insert(&ev, &Profile::default()).unwrap());
        assert_eq!(repo.count().unwrap(), (1, 1));
    }

    #[test]
    fn empty_and_room_indexed() {
        let repo = setup();
        assert!(repo.is_empty().unwrap());
        repo.insert(&msg("$1", "!r:x", 1, "hi"), &Profile::default()).unwrap();
        assert!(!repo.is_empty().unwrap());
        assert!(repo.is_room_indexed(&room("!r:x")).unwrap());
        assert!(!repo.is_room_indexed(&room("!other:x")).unwrap());
    }

    #[test]
    fn delete_reports_presence() {
        let repo = setup();
        repo.insert(&msg("$1", "!r:x", 1, "hi"), &Profile::default()).unwrap();
        assert!(repo.delete(&EventId::from_raw("$1")).unwrap());
        assert!(!repo.delete(&EventId::from_raw("$1")).unwrap());
        assert!(repo.is_empty().unwrap());
    }

    #[test]
    fn extra_fields_survive_storage() {
        let repo = setup();
        let mut ev = msg("$1", "!r:x", 1, "lunch?");
        ev.extra.insert("unsigned".into(), json!({"age": 12}));
        repo.insert(&ev, &Profile::named("Alice")).unwrap();

        let results = repo.search(&SearchArgs::term("lunch")).unwrap();
        assert_eq!(results.results[0].result, ev);
    }

    #[test]
    fn search_is_case_insensitive_and_newest_first() {
        let repo = setup();
        repo.insert(&msg("$1", "!r:x", 10, "Lunch at noon"), &Profile::default()).unwrap();
        repo.insert(&msg("$2", "!r:x", 20, "no match here"), &Profile::default()).unwrap();
        repo.insert(&msg("$3", "!r:x", 30, "lunch again"), &Profile::default()).unwrap();

        let results = repo.search(&SearchArgs::term("LUNCH")).unwrap();
        assert_eq!(results.count, 2);
        let ids: Vec<&str> = results.results.iter().map(|h| h.result.event_id.as_str()).collect();
        assert_eq!(ids, vec!["$3", "$1"]);
        assert_eq!(results.highlights, vec!["lunch"]);
        assert!(results.next_batch.is_none());
    }

    #[test]
    fn search_escapes_like_wildcards() {
        let repo = setup();
        repo.insert(&msg("$1", "!r:x", 1, "100% done"), &Profile::default()).unwrap();
        repo.insert(&msg("$2", "!r:x", 2, "1000 things"), &Profile::default()).unwrap();

        let results = repo.search(&SearchArgs::term("100%")).unwrap();
        assert_eq!(results.count, 1);
        assert_eq!(results.results[0].result.event_id.as_str(), "$1");
    }

    #[test]
    fn search_restricted_to_room() {
        let repo = setup();
        repo.insert(&msg("$1", "!a:x", 1, "deploy"), &Profile::default()).unwrap();
        repo.insert(&msg("$2", "!b:x", 2, "deploy"), &Profile::default()).unwrap();

        let results = repo.search(&SearchArgs::term("deploy").in_room(room("!a:x"))).unwrap();
        assert_eq!(results.count, 1);
        assert_eq!(results.results[0].result.room_id.as_str(), "!a:x");
    }

    #[test]
    fn search_pages_with_next_batch() {
        let repo = setup();
        for i in 0..5 {
            repo.insert(&msg(&format!("${i}"), "!r:x", i, "ping"), &Profile::default()).unwrap();
        }
        let mut args = SearchArgs::term("ping");
        args.limit = 2;

        let first = repo.search(&args).unwrap();
        assert_eq!(first.results.len(), 2);
        assert_eq!(first.next_batch.as_deref(), Some("2"));

        args.next_batch = first.next_batch;
        let second = repo.search(&args).unwrap();
        assert_eq!(second.results[0].result.event_id.as_str(), "$2");

        args.next_batch = Some("4".into());
        let last = repo.search(&args).unwrap();
        assert_eq!(last.results.len(), 1);
        assert!(last.next_batch.is_none());
    }

    #[test]
    fn bad_next_batch_is_invalid_argument() {
        let repo = setup();
        let mut args = SearchArgs::term("x");
        args.next_batch = Some("abc".into());
        assert!(matches!(repo.search(&args), Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn search_context_and_profiles() {
        let repo = setup();
        repo.insert(&msg("$1", "!r:x", 1, "before one"), &Profile::default()).unwrap();
        repo.insert(
            &MatrixEvent::message("$2", room("!r:x"), "@bob:x", 2, "before two"),
            &Profile::named("Bob"),
        )
        .unwrap();
        repo.insert(&msg("$3", "!r:x", 3, "the needle"), &Profile::named("Alice")).unwrap();
        repo.insert(&msg("$4", "!r:x", 4, "after"), &Profile::default()).unwrap();
        repo.insert(&msg("$5", "!other:x", 5, "elsewhere"), &Profile::default()).unwrap();

        let mut args = SearchArgs::term("needle");
        args.before_limit = 2;
        args.after_limit = 5;
        let results = repo.search(&args).unwrap();
        let ctx = &results.results[0].context;

        let before: Vec<&str> = ctx.events_before.iter().map(|e| e.event_id.as_str()).collect();
        let after: Vec<&str> = ctx.events_after.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(before, vec!["$1", "$2"]);
        assert_eq!(after, vec!["$4"]);
        assert_eq!(
            ctx.profile_info[&lore_core::ids::UserId::from_raw("@bob:x")].displayname.as_deref(),
            Some("Bob")
        );
        assert_eq!(
            ctx.profile_info[&lore_core::ids::UserId::from_raw("@alice:x")].displayname.as_deref(),
            Some("Alice")
        );
    }

    #[test]
    fn rank_order_when_not_by_recency() {
        let repo = setup();
        repo.insert(&msg("$1", "!r:x", 1, "go go go"), &Profile::default()).unwrap();
        repo.insert(&msg("$2", "!r:x", 2, "go"), &Profile::default()).unwrap();

        let mut args = SearchArgs::term("go");
        args.order_by_recency = false;
        let results = repo.search(&args).unwrap();
        assert_eq!(results.results[0].result.event_id.as_str(), "$1");
        assert_eq!(results.results[0].rank, 3.0);
    }

    #[test]
    fn blank_term_matches_nothing() {
        let repo = setup();
        repo.insert(&msg("$1", "!r:x", 1, "anything"), &Profile::default()).unwrap();
        assert_eq!(repo.search(&SearchArgs::term("  ")).unwrap().count, 0);
    }

    #[test]
    fn file_events_page_backward_and_forward() {
        let repo = setup();
        for (i, id) in ["$f1", "$f2", "$f3"].iter().enumerate() {
            repo.insert(&file(id, "!r:x", i as i64 + 1), &Profile::default()).unwrap();
        }
        repo.insert(&msg("$m", "!r:x", 10, "text only"), &Profile::default()).unwrap();

        let latest = repo.load_file_events(&LoadFileArgs::latest(room("!r:x"), 2)).unwrap();
        let ids: Vec<&str> = latest.iter().map(|p| p.event.event_id.as_str()).collect();
        assert_eq!(ids, vec!["$f3", "$f2"]);

        let mut older = LoadFileArgs::latest(room("!r:x"), 10);
        older.from_event = Some(EventId::from_raw("$f2"));
        let ids: Vec<String> = repo
            .load_file_events(&older)
            .unwrap()
            .into_iter()
            .map(|p| p.event.event_id.to_string())
            .collect();
        assert_eq!(ids, vec!["$f1"]);

        older.direction = Direction::Forward;
        let ids: Vec<String> = repo
            .load_file_events(&older)
            .unwrap()
            .into_iter()
            .map(|p| p.event.event_id.to_string())
            .collect();
        assert_eq!(ids, vec!["$f3"]);
    }

    #[test]
    fn file_events_unknown_anchor_is_empty() {
        let repo = setup();
        repo.insert(&file("$f1", "!r:x", 1), &Profile::default()).unwrap();
        let mut args = LoadFileArgs::latest(room("!r:x"), 10);
        args.from_event = Some(EventId::from_raw("$missing"));
        assert!(repo.load_file_events(&args).unwrap().is_empty());
    }

    #[test]
    fn user_version_roundtrip() {
        let repo = setup();
        assert_eq!(repo.user_version().unwrap(), 0);
        repo.set_user_version(2).unwrap();
        repo.set_user_version(3).unwrap();
        assert_eq!(repo.user_version().unwrap(), 3);
        repo.clear_user_version().unwrap();
        assert_eq!(repo.user_version().unwrap(), 0);
    }
}
