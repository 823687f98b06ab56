//! `SQLite` persistence layer.
//!
//! All collections share one database. Record fields are stored as a single
//! CBOR-encoded map per row; ids come from one `AUTOINCREMENT` sequence and
//! are never reused.

use alive_sync_core::{Fields, Record, RecordId, Storage, StorageError};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};
use std::path::Path;
use std::sync::Arc;

/// Shared `SQLite` database handle.
#[derive(Clone)]
pub struct SqliteDatabase {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDatabase {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    #[allow(dead_code)]
    pub fn in_memory() -> SqliteResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                fields BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection, id);
            ",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Storage view of one collection.
    #[must_use]
    pub fn collection(&self, name: &str) -> SqliteStore {
        SqliteStore {
            conn: Arc::clone(&self.conn),
            collection: name.to_string(),
        }
    }
}

/// [`Storage`] over the rows of one collection.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    collection: String,
}

impl SqliteStore {
    fn read_fields(
        &self,
        conn: &Connection,
        id: RecordId,
    ) -> Result<Option<Fields>, StorageError> {
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT fields FROM records WHERE collection = ?1 AND id = ?2",
                (&self.collection, to_i64(id)?),
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;

        blob.map(|bytes| decode_fields(id, &bytes)).transpose()
    }
}

impl Storage for SqliteStore {
    fn get(&self, id: RecordId) -> Result<Option<Record>, StorageError> {
        let conn = self.conn.lock();
        Ok(self
            .read_fields(&conn, id)?
            .map(|fields| Record::new(id, fields)))
    }

    fn list(&self) -> Result<Vec<Record>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, fields FROM records WHERE collection = ?1 ORDER BY id ASC")
            .map_err(backend)?;

        let rows = stmt
            .query_map([&self.collection], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(backend)?
            .collect::<SqliteResult<Vec<_>>>()
            .map_err(backend)?;

        rows.into_iter()
            .map(|(id, bytes)| {
                let id = from_i64(id)?;
                Ok(Record::new(id, decode_fields(id, &bytes)?))
            })
            .collect()
    }

    fn set(&self, id: RecordId, field: &str, value: serde_json::Value) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        let mut fields = self
            .read_fields(&conn, id)?
            .ok_or(StorageError::NotFound(id))?;
        fields.insert(field.to_string(), value);

        conn.execute(
            "UPDATE records SET fields = ?1, updated_at = ?2 WHERE collection = ?3 AND id = ?4",
            (
                encode_fields(&fields)?,
                now_ms(),
                &self.collection,
                to_i64(id)?,
            ),
        )
        .map_err(backend)?;

        tracing::debug!(collection = %self.collection, record_id = %id, field, "Stored field");
        Ok(())
    }

    fn create(&self, fields: Fields) -> Result<RecordId, StorageError> {
        let conn = self.conn.lock();
        let now = now_ms();
        conn.execute(
            "INSERT INTO records (collection, fields, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            (&self.collection, encode_fields(&fields)?, now, now),
        )
        .map_err(backend)?;

        from_i64(conn.last_insert_rowid())
    }

    fn delete(&self, id: RecordId) -> Result<bool, StorageError> {
        let conn = self.conn.lock();
        let deleted = conn
            .execute(
                "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                (&self.collection, to_i64(id)?),
            )
            .map_err(backend)?;
        Ok(deleted > 0)
    }
}

fn encode_fields(fields: &Fields) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(fields, &mut bytes)
        .map_err(|e| StorageError::Backend(format!("CBOR encode failed: {e}")))?;
    Ok(bytes)
}

fn decode_fields(id: RecordId, bytes: &[u8]) -> Result<Fields, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Corrupt {
        id,
        reason: e.to_string(),
    })
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[allow(clippy::needless_pass_by_value)]
fn backend(err: rusqlite::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn to_i64(id: RecordId) -> Result<i64, StorageError> {
    i64::try_from(id.0).map_err(|e| StorageError::Backend(e.to_string()))
}

fn from_i64(id: i64) -> Result<RecordId, StorageError> {
    u64::try_from(id)
        .map(RecordId)
        .map_err(|e| StorageError::Backend(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn card(title: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("title".into(), json!(title));
        fields.insert("tags".into(), json!(["a", 2, null]));
        fields
    }

    #[test]
    fn sqlite_store_basic_operations() {
        let db = SqliteDatabase::in_memory().unwrap();
        let cards = db.collection("cards");

        let first = cards.create(card("Soup")).unwrap();
        let second = cards.create(card("Salad")).unwrap();
        assert!(second > first);

        cards.set(first, "title", json!("Pasta")).unwrap();
        let record = cards.get(first).unwrap().unwrap();
        assert_eq!(record.value("title"), json!("Pasta"));
        assert_eq!(record.value("tags"), json!(["a", 2, null]));

        assert!(cards.delete(second).unwrap());
        assert!(!cards.delete(second).unwrap());
        assert!(cards.get(second).unwrap().is_none());
        assert!(matches!(
            cards.set(second, "title", json!("x")),
            Err(StorageError::NotFound(id)) if id == second
        ));
    }

    #[test]
    fn collections_are_isolated_and_ids_not_reused() {
        let db = SqliteDatabase::in_memory().unwrap();
        let cards = db.collection("cards");
        let meals = db.collection("meals");

        let card_id = cards.create(card("Soup")).unwrap();
        let meal_id = meals.create(card("Stew")).unwrap();
        assert_ne!(card_id, meal_id);
        assert!(meals.get(card_id).unwrap().is_none());

        cards.delete(card_id).unwrap();
        let next = cards.create(card("Again")).unwrap();
        assert!(next > meal_id);

        let ids: Vec<RecordId> = cards.list().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![next]);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alive.db");

        let id = {
            let db = SqliteDatabase::open(&path).unwrap();
            db.collection("cards").create(card("Soup")).unwrap()
        };

        let db = SqliteDatabase::open(&path).unwrap();
        let record = db.collection("cards").get(id).unwrap().unwrap();
        assert_eq!(record.value("title"), json!("Soup"));
    }

    #[test]
    fn corrupt_blob_is_reported() {
        let db = SqliteDatabase::in_memory().unwrap();
        db.conn
            .lock()
            .execute(
                "INSERT INTO records (id, collection, fields, created_at, updated_at) VALUES (7, 'cards', x'ff00', 0, 0)",
                [],
            )
            .unwrap();

        assert!(matches!(
            db.collection("cards").get(RecordId(7)),
            Err(StorageError::Corrupt { id: RecordId(7), .. })
        ));
    }
}
