use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument};

use lore_core::checkpoint::{Checkpoint, CheckpointKey, Direction};
use lore_core::ids::RoomId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Per-(room, direction) lock. Operations on one key are linearized;
/// different keys never wait on each other.
#[derive(Default)]
struct KeyLocks {
    locks: HashMap<CheckpointKey, Arc<Mutex<()>>>,
}

impl KeyLocks {
    fn get(&mut self, key: &CheckpointKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct CheckpointRepo {
    db: Database,
    key_locks: Mutex<KeyLocks>,
}

impl CheckpointRepo {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            key_locks: Mutex::new(KeyLocks::default()),
        }
    }

    /// Run `f` while holding the locks of every key in `keys`.
    /// Keys are locked in sorted order so two multi-key callers cannot deadlock.
    pub fn with_key_locks<F, T>(&self, keys: &[CheckpointKey], f: F) -> Result<T, StoreError>
    where
        F: FnOnce() -> Result<T, StoreError>,
    {
        let mut keys: Vec<&CheckpointKey> = keys.iter().collect();
        keys.sort();
        keys.dedup();

        let locks: Vec<Arc<Mutex<()>>> = {
            let mut table = self.key_locks.lock();
            keys.iter().map(|k| table.get(k)).collect()
        };
        let _guards: Vec<_> = locks.iter().map(|l| l.lock()).collect();
        f()
    }

    #[instrument(skip(self), fields(room_id = %checkpoint.room_id, direction = %checkpoint.direction))]
    pub fn add(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.with_key_locks(&[checkpoint.key()], || {
            self.db.with_tx(|tx| {
                if find_by_key(tx, &checkpoint.key())?.is_some() {
                    return Err(StoreError::DuplicateCheckpoint(checkpoint.key()));
                }
                insert(tx, checkpoint)
            })
        })
    }

    /// Delete the exact checkpoint (identity and token). Returns whether a
    /// row was removed.
    #[instrument(skip(self), fields(room_id = %checkpoint.room_id, direction = %checkpoint.direction))]
    pub fn remove(&self, checkpoint: &Checkpoint) -> Result<bool, StoreError> {
        self.with_key_locks(&[checkpoint.key()], || {
            self.db.with_conn(|conn| delete_exact(conn, checkpoint))
        })
    }

    /// All checkpoints in insertion order.
    pub fn list(&self) -> Result<Vec<Checkpoint>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT room_id, direction, token, full_crawl
                 FROM crawler_checkpoints ORDER BY seq ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_checkpoint(row)?);
            }
            Ok(results)
        })
    }

    pub fn get(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, StoreError> {
        self.db.with_conn(|conn| find_by_key(conn, key))
    }

    /// Remove `old` and add `new` in one transaction.
    #[instrument(skip(self, new), fields(room_id = %old.room_id, direction = %old.direction))]
    pub fn replace(&self, old: &Checkpoint, new: Option<&Checkpoint>) -> Result<(), StoreError> {
        let keys = lock_set(Some(old), new);
        self.with_key_locks(&keys, || {
            self.db.with_tx(|tx| swap_in_tx(tx, Some(old), new).map(|_| ()))
        })
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM crawler_checkpoints", [])?;
            Ok(())
        })
    }
}

/// Keys touched by a swap.
pub fn lock_set(old: Option<&Checkpoint>, new: Option<&Checkpoint>) -> Vec<CheckpointKey> {
    old.into_iter().chain(new).map(Checkpoint::key).collect()
}

/// Checkpoint swap on an open transaction. Callers hold the key locks.
///
/// Fails with `DuplicateCheckpoint` when `new`'s key is occupied by anything
/// other than `old`. A retried swap whose first attempt already committed
/// (old gone, `new` stored verbatim) succeeds without changes and returns
/// true.
pub fn swap_in_tx(
    conn: &Connection,
    old: Option<&Checkpoint>,
    new: Option<&Checkpoint>,
) -> Result<bool, StoreError> {
    let removed = match old {
        Some(old) => delete_exact(conn, old)?,
        None => false,
    };

    let Some(new) = new else {
        debug!(removed, "checkpoint retired");
        return Ok(false);
    };

    match find_by_key(conn, &new.key())? {
        None => insert(conn, new).map(|()| false),
        Some(existing) if !removed && existing == *new => {
            debug!("checkpoint swap already applied");
            Ok(true)
        }
        Some(_) => Err(StoreError::DuplicateCheckpoint(new.key())),
    }
}

fn insert(conn: &Connection, checkpoint: &Checkpoint) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO crawler_checkpoints (room_id, direction, token, full_crawl)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            checkpoint.room_id.as_str(),
            checkpoint.direction.as_str(),
            checkpoint.token,
            checkpoint.full_crawl,
        ],
    )?;
    Ok(())
}

fn delete_exact(conn: &Connection, checkpoint: &Checkpoint) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "DELETE FROM crawler_checkpoints
         WHERE room_id = ?1 AND direction = ?2 AND token = ?3",
        params![
            checkpoint.room_id.as_str(),
            checkpoint.direction.as_str(),
            checkpoint.token,
        ],
    )?;
    Ok(changed > 0)
}

fn find_by_key(conn: &Connection, key: &CheckpointKey) -> Result<Option<Checkpoint>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT room_id, direction, token, full_crawl
         FROM crawler_checkpoints WHERE room_id = ?1 AND direction = ?2",
    )?;
    stmt.query_row(
        params![key.room_id.as_str(), key.direction.as_str()],
        |row| Ok(row_to_checkpoint(row)),
    )
    .optional()?
    .transpose()
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> Result<Checkpoint, StoreError> {
    const T: &str = "crawler_checkpoints";
    let room_id: String = row_helpers::get(row, 0, T, "room_id")?;
    let direction_str: String = row_helpers::get(row, 1, T, "direction")?;
    let direction: Direction = row_helpers::parse_enum(&direction_str, T, "direction")?;
    let token: String = row_helpers::get(row, 2, T, "token")?;
    let full_crawl: bool = row_helpers::get(row, 3, T, "full_crawl")?;

    Ok(Checkpoint::new(RoomId::from_raw(room_id), token, direction).with_full_crawl(full_crawl))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> CheckpointRepo {
        CheckpointRepo::new(Database::in_memory().unwrap())
    }

    fn room(s: &str) -> RoomId {
        RoomId::from_raw(s)
    }

    #[test]
    fn add_and_list_in_insertion_order() {
        let repo = setup();
        repo.add(&Checkpoint::backward(room("!b:x"), "t1")).unwrap();
        repo.add(&Checkpoint::backward(room("!a:x"), "t2")).unwrap();
        repo.add(&Checkpoint::forward(room("!a:x"), "t3")).unwrap();

        let tokens: Vec<String> = repo.list().unwrap().into_iter().map(|c| c.token).collect();
        assert_eq!(tokens, vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn full_crawl_flag_persists() {
        let repo = setup();
        let cp = Checkpoint::backward(room("!r:x"), "t0").with_full_crawl(true);
        repo.add(&cp).unwrap();
        assert_eq!(repo.get(&cp.key()).unwrap(), Some(cp));
    }

    #[test]
    fn duplicate_add_fails_and_leaves_store_unchanged() {
        let repo = setup();
        let first = Checkpoint::backward(room("!r:x"), "t0");
        repo.add(&first).unwrap();

        let err = repo
            .add(&Checkpoint::backward(room("!r:x"), "other"))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateCheckpoint(ref k) if *k == first.key()));
        assert_eq!(repo.list().unwrap(), vec![first]);
    }

    #[test]
    fn same_room_other_direction_is_not_duplicate() {
        let repo = setup();
        repo.add(&Checkpoint::backward(room("!r:x"), "t0")).unwrap();
        repo.add(&Checkpoint::forward(room("!r:x"), "t0")).unwrap();
        assert_eq!(repo.list().unwrap().len(), 2);
    }

    #[test]
    fn remove_absent_is_noop() {
        let repo = setup();
        let removed = repo.remove(&Checkpoint::backward(room("!r:x"), "t0")).unwrap();
        assert!(!removed);
    }

    #[test]
    fn stale_remove_keeps_newer_checkpoint() {
        let repo = setup();
        let old = Checkpoint::backward(room("!r:x"), "t0");
        let new = old.advance("t1");
        repo.add(&old).unwrap();
        repo.replace(&old, Some(&new)).unwrap();

        assert!(!repo.remove(&old).unwrap());
        assert_eq!(repo.get(&old.key()).unwrap(), Some(new));
    }

    #[test]
    fn replace_swaps_token() {
        let repo = setup();
        let old = Checkpoint::backward(room("!r:x"), "t0");
        repo.add(&old).unwrap();
        repo.replace(&old, Some(&old.advance("t1"))).unwrap();

        let all = repo.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].token, "t1");
    }

    #[test]
    fn replace_with_none_retires_checkpoint() {
        let repo = setup();
        let old = Checkpoint::forward(room("!r:x"), "t0");
        repo.add(&old).unwrap();
        repo.replace(&old, None).unwrap();
        assert!(repo.list().unwrap().is_empty());
    }

    #[test]
    fn conflicting_replace_rolls_back() {
        let repo = setup();
        let a = Checkpoint::backward(room("!a:x"), "ta");
        let b = Checkpoint::backward(room("!b:x"), "tb");
        repo.add(&a).unwrap();
        repo.add(&b).unwrap();

        // Moving a's cursor onto b's identity must not delete a.
        let err = repo
            .replace(&a, Some(&Checkpoint::backward(room("!b:x"), "tz")))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateCheckpoint(_)));
        assert_eq!(repo.list().unwrap(), vec![a, b]);
    }

    #[test]
    fn retried_replace_is_idempotent() {
        let repo = setup();
        let old = Checkpoint::backward(room("!r:x"), "t0");
        let new = old.advance("t1");
        repo.add(&old).unwrap();
        repo.replace(&old, Some(&new)).unwrap();
        repo.replace(&old, Some(&new)).unwrap();
        assert_eq!(repo.list().unwrap(), vec![new]);
    }

    #[test]
    fn stale_replace_cannot_clobber_newer_cursor() {
        let repo = setup();
        let t0 = Checkpoint::backward(room("!r:x"), "t0");
        let t1 = t0.advance("t1");
        let t2 = t1.advance("t2");
        repo.add(&t0).unwrap();
        repo.replace(&t0, Some(&t1)).unwrap();
        repo.replace(&t1, Some(&t2)).unwrap();

        let err = repo.replace(&t0, Some(&t1)).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateCheckpoint(_)));
        assert_eq!(repo.list().unwrap(), vec![t2]);
    }

    #[test]
    fn concurrent_adds_on_one_key_admit_exactly_one() {
        let repo = Arc::new(setup());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let repo = repo.clone();
                std::thread::spawn(move || {
                    repo.add(&Checkpoint::backward(room("!r:x"), format!("t{i}")))
                        .is_ok()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(repo.list().unwrap().len(), 1);
    }

    #[test]
    fn clear_removes_everything() {
        let repo = setup();
        repo.add(&Checkpoint::backward(room("!r:x"), "t0")).unwrap();
        repo.clear().unwrap();
        assert!(repo.list().unwrap().is_empty());
    }
}
