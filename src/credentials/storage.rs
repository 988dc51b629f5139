//! Credential storage backed by SQLite.
//!
//! Holds exactly one row (`id = 1`). When encryption is enabled the token pair is
//! sealed into `sealed_tokens` and the cleartext token columns stay NULL.

use super::{
    check_tokens, default_token_type, parse_timestamp, sealed_aad, CipherMode, CredentialRecord,
    CredentialStore, SealedTokens, StoreError,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Fixed key of the singleton row.
const SINGLETON_ID: i64 = 1;

/// SQLite credential store.
///
/// # Schema
/// ```sql
/// CREATE TABLE oauth_credentials (
///     id INTEGER PRIMARY KEY CHECK (id = 1),
///     access_token TEXT,            -- NULL when sealed
///     refresh_token TEXT,           -- NULL when sealed
///     sealed_tokens BLOB,           -- nonce || AES-256-GCM(json pair), NULL when cleartext
///     expires_at TEXT NOT NULL,     -- RFC 3339
///     token_type TEXT NOT NULL,
///     updated_at TEXT NOT NULL      -- RFC 3339
/// );
/// ```
///
/// No row means absent, `sealed_tokens IS NULL` means cleartext, anything else is
/// encrypted. A CHECK constraint rejects rows that mix the two shapes.
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
    cipher: CipherMode,
}

impl SqliteCredentialStore {
    /// Creates or opens a credential database at `db_path`.
    pub fn open<P: AsRef<Path>>(db_path: P, cipher: CipherMode) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path.as_ref())?;
        debug!(path = %db_path.as_ref().display(), "Opened credential database");
        Self::with_connection(conn, cipher)
    }

    /// Creates a store on a private in-memory database.
    pub fn in_memory(cipher: CipherMode) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, cipher)
    }

    fn with_connection(conn: Connection, cipher: CipherMode) -> Result<Self, StoreError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_credentials (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                access_token TEXT,
                refresh_token TEXT,
                sealed_tokens BLOB,
                expires_at TEXT NOT NULL,
                token_type TEXT NOT NULL DEFAULT 'bearer',
                updated_at TEXT NOT NULL,
                CHECK (
                    (sealed_tokens IS NULL AND access_token IS NOT NULL AND refresh_token IS NOT NULL)
                    OR (sealed_tokens IS NOT NULL AND access_token IS NULL AND refresh_token IS NULL)
                )
            )
            "#,
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    /// Returns true if the stored row is sealed. `None` when no row exists.
    pub fn is_sealed(&self) -> Result<Option<bool>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let sealed = conn
            .query_row(
                "SELECT sealed_tokens IS NOT NULL FROM oauth_credentials WHERE id = ?1",
                params![SINGLETON_ID],
                |row| row.get::<_, bool>(0),
            )
            .optional()?;
        Ok(sealed)
    }

    fn open_sealed(&self, blob: &[u8], aad: &[u8]) -> Result<SealedTokens, StoreError> {
        if !self.cipher.is_authenticated() {
            return Err(StoreError::KeyRequired);
        }
        let plaintext = self.cipher.open(blob, aad)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| StoreError::Corrupt(format!("sealed token payload: {}", e)))
    }
}

/// Raw row as read from the table.
struct StoredRow {
    access_token: Option<String>,
    refresh_token: Option<String>,
    sealed_tokens: Option<Vec<u8>>,
    expires_at: String,
    token_type: Option<String>,
    updated_at: String,
}

impl CredentialStore for SqliteCredentialStore {
    fn load(&self) -> Result<Option<CredentialRecord>, StoreError> {
        let row = {
            let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
            conn.query_row(
                r#"
                SELECT access_token, refresh_token, sealed_tokens,
                       expires_at, token_type, updated_at
                FROM oauth_credentials
                WHERE id = ?1
                "#,
                params![SINGLETON_ID],
                |row| {
                    Ok(StoredRow {
                        access_token: row.get(0)?,
                        refresh_token: row.get(1)?,
                        sealed_tokens: row.get(2)?,
                        expires_at: row.get(3)?,
                        token_type: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?
        };

        let Some(row) = row else {
            return Ok(None);
        };

        let expires_at = parse_timestamp("expires_at", &row.expires_at)?;
        let updated_at = parse_timestamp("updated_at", &row.updated_at)?;
        let token_type = row.token_type.unwrap_or_else(default_token_type);

        let tokens = match (row.sealed_tokens, row.access_token, row.refresh_token) {
            (Some(blob), _, _) => {
                self.open_sealed(&blob, &sealed_aad(&expires_at, &token_type, &updated_at))?
            }
            (None, Some(access_token), Some(refresh_token)) => {
                if self.cipher.is_authenticated() {
                    warn!("Stored credentials are not encrypted, they will be sealed on next save");
                }
                SealedTokens {
                    access_token,
                    refresh_token,
                }
            }
            _ => {
                return Err(StoreError::Corrupt(
                    "row has neither sealed nor cleartext tokens".to_string(),
                ))
            }
        };

        check_tokens(&tokens.access_token, &tokens.refresh_token)?;

        Ok(Some(CredentialRecord {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at,
            token_type,
            updated_at,
        }))
    }

    fn save(&self, record: &CredentialRecord) -> Result<(), StoreError> {
        check_tokens(&record.access_token, &record.refresh_token)?;

        let (access_token, refresh_token, sealed_tokens) = if self.cipher.is_authenticated() {
            let payload = serde_json::to_vec(&SealedTokens {
                access_token: record.access_token.clone(),
                refresh_token: record.refresh_token.clone(),
            })
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
            let aad = sealed_aad(&record.expires_at, &record.token_type, &record.updated_at);
            (None, None, Some(self.cipher.seal(&payload, &aad)?))
        } else {
            (
                Some(record.access_token.as_str()),
                Some(record.refresh_token.as_str()),
                None,
            )
        };

        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO oauth_credentials (
                id, access_token, refresh_token, sealed_tokens,
                expires_at, token_type, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                sealed_tokens = excluded.sealed_tokens,
                expires_at = excluded.expires_at,
                token_type = excluded.token_type,
                updated_at = excluded.updated_at
            "#,
            params![
                SINGLETON_ID,
                access_token,
                refresh_token,
                sealed_tokens,
                record.expires_at.to_rfc3339(),
                record.token_type,
                record.updated_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        info!(
            expires_at = %record.expires_at,
            encrypted = self.cipher.is_authenticated(),
            "Credentials saved to database"
        );
        Ok(())
    }

    fn clear(&self) -> Result<bool, StoreError> {
        let rows_affected = self
            .conn
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .execute(
                "DELETE FROM oauth_credentials WHERE id = ?1",
                params![SINGLETON_ID],
            )?;

        if rows_affected > 0 {
            info!("Credentials cleared from database");
        }
        Ok(rows_affected > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CipherError, CipherKey};
    use chrono::{Duration, Utc};

    fn sealed_store() -> SqliteCredentialStore {
        let cipher = CipherMode::Authenticated(CipherKey::from([0u8; 32]));
        SqliteCredentialStore::in_memory(cipher).expect("Failed to create test store")
    }

    fn test_record() -> CredentialRecord {
        CredentialRecord::new(
            "access-token-12345".to_string(),
            "refresh-token-67890".to_string(),
            Utc::now() + Duration::hours(1),
        )
    }

    #[test]
    fn test_save_and_load() {
        let store = sealed_store();
        let record = test_record();

        store.save(&record).expect("Failed to save");

        let loaded = store
            .load()
            .expect("Failed to load")
            .expect("Credentials not found");

        assert_eq!(loaded.access_token, record.access_token);
        assert_eq!(loaded.refresh_token, record.refresh_token);
        assert_eq!(loaded.expires_at.timestamp(), record.expires_at.timestamp());
        assert_eq!(loaded.token_type, "bearer");
    }

    #[test]
    fn test_load_empty_is_absent() {
        let store = sealed_store();
        assert!(store.load().expect("Failed to load").is_none());
        assert_eq!(store.is_sealed().unwrap(), None);
    }

    #[test]
    fn test_save_replaces_whole_record() {
        let store = sealed_store();
        store.save(&test_record()).unwrap();

        let replacement = CredentialRecord::new(
            "new-access-token".to_string(),
            "new-refresh-token".to_string(),
            Utc::now() + Duration::hours(2),
        );
        store.save(&replacement).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.access_token, "new-access-token");
        assert_eq!(loaded.refresh_token, "new-refresh-token");
    }

    #[test]
    fn test_repeated_save_is_idempotent() {
        let store = sealed_store();
        let record = test_record();

        store.save(&record).unwrap();
        store.save(&record).unwrap();

        let count: i64 = store
            .conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM oauth_credentials", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.access_token, record.access_token);
        assert_eq!(loaded.refresh_token, record.refresh_token);
    }

    #[test]
    fn test_sealed_row_without_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.db");

        let key = CipherKey::from([3u8; 32]);
        SqliteCredentialStore::open(&path, CipherMode::Authenticated(key))
            .unwrap()
            .save(&test_record())
            .unwrap();

        let plain = SqliteCredentialStore::open(&path, CipherMode::Plain).unwrap();
        assert!(matches!(plain.load(), Err(StoreError::KeyRequired)));
    }

    #[test]
    fn test_sealed_row_with_wrong_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.db");

        SqliteCredentialStore::open(&path, CipherMode::Authenticated(CipherKey::from([3u8; 32])))
            .unwrap()
            .save(&test_record())
            .unwrap();

        let other =
            SqliteCredentialStore::open(&path, CipherMode::Authenticated(CipherKey::from([4u8; 32])))
                .unwrap();
        assert!(matches!(
            other.load(),
            Err(StoreError::Cipher(CipherError::AuthenticationFailed))
        ));
    }

    #[test]
    fn test_cleartext_row_is_sealed_on_next_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.db");

        SqliteCredentialStore::open(&path, CipherMode::Plain)
            .unwrap()
            .save(&test_record())
            .unwrap();

        let sealed =
            SqliteCredentialStore::open(&path, CipherMode::Authenticated(CipherKey::from([5u8; 32])))
                .unwrap();
        let record = sealed.load().unwrap().unwrap();
        assert_eq!(record.access_token, "access-token-12345");
        assert_eq!(sealed.is_sealed().unwrap(), Some(false));

        sealed.save(&record).unwrap();
        assert_eq!(sealed.is_sealed().unwrap(), Some(true));
    }

    #[test]
    fn test_tokens_are_not_stored_in_cleartext() {
        let store = sealed_store();
        store.save(&test_record()).unwrap();

        assert_eq!(store.is_sealed().unwrap(), Some(true));

        let (access, refresh): (Option<String>, Option<String>) = store
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT access_token, refresh_token FROM oauth_credentials WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(access.is_none());
        assert!(refresh.is_none());
    }

    #[test]
    fn test_plain_mode_stores_cleartext() {
        let store = SqliteCredentialStore::in_memory(CipherMode::Plain).unwrap();
        store.save(&test_record()).unwrap();

        assert_eq!(store.is_sealed().unwrap(), Some(false));
        assert_eq!(
            store.load().unwrap().unwrap().refresh_token,
            "refresh-token-67890"
        );
    }

    #[test]
    fn test_tampered_blob_fails_authentication() {
        let store = sealed_store();
        store.save(&test_record()).unwrap();

        store
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE oauth_credentials SET sealed_tokens = ?1 WHERE id = 1",
                params![vec![0u8; 64]],
            )
            .unwrap();

        assert!(matches!(
            store.load(),
            Err(StoreError::Cipher(CipherError::AuthenticationFailed))
        ));
    }

    #[test]
    fn test_edited_expiry_on_sealed_row_fails_authentication() {
        let store = sealed_store();
        store.save(&test_record()).unwrap();

        store
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE oauth_credentials SET expires_at = ?1 WHERE id = 1",
                params!["2099-01-01T00:00:00Z"],
            )
            .unwrap();

        assert!(matches!(
            store.load(),
            Err(StoreError::Cipher(CipherError::AuthenticationFailed))
        ));
    }

    #[test]
    fn test_clear() {
        let store = sealed_store();
        store.save(&test_record()).unwrap();

        assert!(store.clear().unwrap());
        assert!(store.load().unwrap().is_none());

        // Clearing again should return false
        assert!(!store.clear().unwrap());
    }

    #[test]
    fn test_save_rejects_empty_refresh_token() {
        let store = sealed_store();
        let mut record = test_record();
        record.refresh_token = String::new();

        assert!(matches!(store.save(&record), Err(StoreError::Corrupt(_))));
        assert!(store.load().unwrap().is_none());
    }
}
