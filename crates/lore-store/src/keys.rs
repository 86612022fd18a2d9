use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::instrument;

use lore_core::keys::KeyOwner;

use crate::database::Database;
use crate::error::StoreError;

/// Encrypted pickle keys at rest. The repo only ever sees ciphertext.
pub struct KeyRepo {
    db: Database,
}

impl KeyRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(user_id = %owner.user_id, device_id = %owner.device_id))]
    pub fn get(&self, owner: &KeyOwner) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT ciphertext FROM pickle_keys WHERE user_id = ?1 AND device_id = ?2",
                    params![owner.user_id.as_str(), owner.device_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Store `ciphertext`, replacing any previous key for the owner.
    #[instrument(skip(self, ciphertext), fields(user_id = %owner.user_id, device_id = %owner.device_id))]
    pub fn put(&self, owner: &KeyOwner, ciphertext: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pickle_keys (user_id, device_id, ciphertext, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, device_id) DO UPDATE
                 SET ciphertext = excluded.ciphertext, created_at = excluded.created_at",
                params![
                    owner.user_id.as_str(),
                    owner.device_id.as_str(),
                    ciphertext,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(user_id = %owner.user_id, device_id = %owner.device_id))]
    pub fn delete(&self, owner: &KeyOwner) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM pickle_keys WHERE user_id = ?1 AND device_id = ?2",
                params![owner.user_id.as_str(), owner.device_id.as_str()],
            )?;
            Ok(changed > 0)
        })
    }
}
