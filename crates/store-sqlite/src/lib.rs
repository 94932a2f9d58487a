use std::fmt::Display;
use std::path::{Path, PathBuf};

use core_model::schema::SCHEMA;
use core_model::{
    Collection, CollectionSchema, IndexSchema, KeyKind, Record, RecordKey, RecordStore,
    StoreError, require_key,
};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

const MEMORY_PATH: &str = ":memory:";

/// Indexed collection store backed by one SQLite database. The connection is
/// opened lazily by `initialize` and reused for the life of the value.
pub struct SqliteStore {
    path: PathBuf,
    conn: Option<Connection>,
}

impl SqliteStore {
    pub fn default_path() -> PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("focus").join("focus.db")
    }

    pub fn open_default() -> Self {
        Self::new(Self::default_path())
    }

    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            conn: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    pub fn integrity_check(&self) -> anyhow::Result<String> {
        self.conn()?
            .query_row("PRAGMA integrity_check;", [], |r| r.get(0))
            .map_err(Into::into)
    }

    fn open_connection(&self) -> Result<Connection, StoreError> {
        if self.path.as_os_str() != MEMORY_PATH
            && let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::StorageUnavailable(format!(
                    "creating parent dir for {}: {e}",
                    self.path.display()
                ))
            })?;
        }
        let conn = Connection::open(&self.path).map_err(|e| {
            StoreError::StorageUnavailable(format!(
                "opening sqlite db {}: {e}",
                self.path.display()
            ))
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL; PRAGMA foreign_keys = ON;",
        )
        .map_err(unavailable)?;
        Ok(conn)
    }

    fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn
            .as_ref()
            .ok_or_else(|| StoreError::StorageUnavailable("store not initialized".to_string()))
    }

    fn conn_mut(&mut self) -> Result<&mut Connection, StoreError> {
        self.conn
            .as_mut()
            .ok_or_else(|| StoreError::StorageUnavailable("store not initialized".to_string()))
    }
}

impl RecordStore for SqliteStore {
    fn initialize(&mut self) -> Result<Vec<Collection>, StoreError> {
        if self.conn.is_none() {
            info!(path = %self.path.display(), "opening database");
            self.conn = Some(self.open_connection()?);
        } else {
            debug!("database already open");
        }
        let conn = self.conn_mut()?;
        let tx = conn.transaction().map_err(unavailable)?;
        let mut created = Vec::new();
        for schema in &SCHEMA {
            let table = schema.collection.as_str();
            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                    params![table],
                    |r| r.get(0),
                )
                .map_err(unavailable)?;
            if exists {
                continue;
            }
            tx.execute_batch(&create_collection_sql(schema))
                .map_err(unavailable)?;
            created.push(schema.collection);
        }
        tx.commit().map_err(unavailable)?;
        if !created.is_empty() {
            info!(collections = created.len(), "created collections");
        }
        Ok(created)
    }

    fn set<R: Record>(&mut self, record: &R) -> Result<R, StoreError> {
        let key = require_key(record)?;
        let data = encode(record)?;
        self.conn()?
            .execute(&upsert_sql(R::COLLECTION), params![key_value(&key), data])
            .map_err(write_err)?;
        debug!(collection = %R::COLLECTION, key = %key, "record stored");
        Ok(record.clone())
    }

    fn get<R: Record>(&self, key: &RecordKey) -> Result<Option<R>, StoreError> {
        let data: Option<String> = self
            .conn()?
            .query_row(
                &format!("SELECT data FROM {} WHERE key = ?1", R::COLLECTION.as_str()),
                params![key_value(key)],
                |r| r.get(0),
            )
            .optional()
            .map_err(read_err)?;
        data.map(|d| decode::<R>(&d)).transpose()
    }

    fn get_all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        let sql = format!("SELECT data FROM {} ORDER BY key ASC", R::COLLECTION.as_str());
        let mut stmt = self.conn()?.prepare(&sql).map_err(read_err)?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))
            .map_err(read_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(read_err)?;
        rows.iter().map(|d| decode::<R>(d)).collect()
    }

    fn get_all_by_index<R: Record>(
        &self,
        index: &str,
        lower: &str,
        upper: &str,
    ) -> Result<Vec<R>, StoreError> {
        let schema = R::COLLECTION.schema();
        let Some(index_schema) = schema.index(index) else {
            return Err(StoreError::UnknownIndex {
                collection: R::COLLECTION,
                index: index.to_string(),
            });
        };
        let sql = format!(
            "SELECT data FROM {} WHERE {} BETWEEN ?1 AND ?2 ORDER BY key ASC",
            R::COLLECTION.as_str(),
            index_expr(index_schema)
        );
        let mut stmt = self.conn()?.prepare(&sql).map_err(read_err)?;
        let rows = stmt
            .query_map(params![lower, upper], |r| r.get::<_, String>(0))
            .map_err(read_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(read_err)?;
        rows.iter().map(|d| decode::<R>(d)).collect()
    }

    fn count<R: Record>(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .conn()?
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", R::COLLECTION.as_str()),
                [],
                |r| r.get(0),
            )
            .map_err(read_err)?;
        Ok(n as usize)
    }

    fn bulk_add<R: Record>(&mut self, records: &[R]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let conn = self.conn_mut()?;
        let tx = conn.transaction().map_err(write_err)?;
        {
            let mut stmt = tx
                .prepare_cached(&upsert_sql(R::COLLECTION))
                .map_err(write_err)?;
            for record in records {
                let key = require_key(record)?;
                stmt.execute(params![key_value(&key), encode(record)?])
                    .map_err(write_err)?;
            }
        }
        tx.commit().map_err(write_err)?;
        debug!(collection = %R::COLLECTION, records = records.len(), "bulk add committed");
        Ok(())
    }

    fn delete<R: Record>(&mut self, key: &RecordKey) -> Result<(), StoreError> {
        let removed = self
            .conn()?
            .execute(
                &format!("DELETE FROM {} WHERE key = ?1", R::COLLECTION.as_str()),
                params![key_value(key)],
            )
            .map_err(write_err)?;
        debug!(collection = %R::COLLECTION, key = %key, removed, "record deleted");
        Ok(())
    }
}

fn create_collection_sql(schema: &CollectionSchema) -> String {
    let table = schema.collection.as_str();
    let key_type = match schema.key_kind {
        KeyKind::Integer => "INTEGER",
        KeyKind::Text => "TEXT",
    };
    let mut sql = format!(
        "CREATE TABLE {table} (\n  key {key_type} PRIMARY KEY NOT NULL,\n  data TEXT NOT NULL\n);"
    );
    for index in schema.indexes {
        sql.push_str(&format!(
            "\nCREATE INDEX idx_{table}_{} ON {table} ({});",
            index.name,
            index_expr(index)
        ));
    }
    sql
}

fn index_expr(index: &IndexSchema) -> String {
    format!("json_extract(data, '$.{}')", index.field)
}

fn upsert_sql(collection: Collection) -> String {
    format!(
        "INSERT INTO {} (key, data) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET data = excluded.data",
        collection.as_str()
    )
}

fn key_value(key: &RecordKey) -> Value {
    match key {
        RecordKey::Int(v) => Value::Integer(*v),
        RecordKey::Text(v) => Value::Text(v.clone()),
    }
}

fn encode<R: Record>(record: &R) -> Result<String, StoreError> {
    serde_json::to_string(record)
        .map_err(|e| StoreError::Write(format!("encoding {} record: {e}", R::COLLECTION)))
}

fn decode<R: Record>(data: &str) -> Result<R, StoreError> {
    serde_json::from_str(data)
        .map_err(|e| StoreError::Read(format!("decoding {} record: {e}", R::COLLECTION)))
}

fn unavailable(e: impl Display) -> StoreError {
    StoreError::StorageUnavailable(e.to_string())
}

fn write_err(e: impl Display) -> StoreError {
    StoreError::Write(e.to_string())
}

fn read_err(e: impl Display) -> StoreError {
    StoreError::Read(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_model::{SessionRecord, SettingsRecord, SiteVisitRecord};

    const DAY_MS: i64 = 86_400_000;
    const NOV_26: i64 = 1_732_579_200_000;

    fn session(start: i64, duration: i64) -> SessionRecord {
        SessionRecord {
            duration: Some(duration),
            ..SessionRecord::started(start, format!("s{start}"))
        }
    }

    fn memory_store() -> SqliteStore {
        let mut store = SqliteStore::new(":memory:");
        store.initialize().expect("initialize");
        store
    }

    #[test]
    fn initialize_creates_four_collections_once() {
        let mut store = SqliteStore::new(":memory:");
        let created = store.initialize().unwrap();
        assert_eq!(created, Collection::ALL.to_vec());
        let again = store.initialize().unwrap();
        assert!(again.is_empty());

        let tables: i64 = store
            .conn
            .as_ref()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
        let indexes: i64 = store
            .conn
            .as_ref()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(indexes, 5);
        assert_eq!(store.integrity_check().unwrap(), "ok");
    }

    #[test]
    fn reopened_database_keeps_records_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("focus.db");
        {
            let mut store = SqliteStore::new(&path);
            assert_eq!(store.initialize().unwrap().len(), 4);
            store.set(&session(NOV_26, 1_800_000)).unwrap();
        }
        let mut store = SqliteStore::new(&path);
        assert!(store.initialize().unwrap().is_empty());
        let got: SessionRecord = store.get(&RecordKey::Int(NOV_26)).unwrap().unwrap();
        assert_eq!(got.duration, Some(1_800_000));
    }

    #[test]
    fn unopenable_path_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let mut store = SqliteStore::new(blocker.join("focus.db"));
        let err = store.initialize().unwrap_err();
        assert!(matches!(err, StoreError::StorageUnavailable(_)));
        assert!(!store.is_open());
    }

    #[test]
    fn use_before_initialize_is_unavailable() {
        let mut store = SqliteStore::new(":memory:");
        let err = store.set(&session(NOV_26, 1)).unwrap_err();
        assert!(matches!(err, StoreError::StorageUnavailable(_)));
    }

    #[test]
    fn set_is_last_write_wins() {
        let mut store = memory_store();
        for duration in [1, 2, 3] {
            store.set(&session(NOV_26, duration)).unwrap();
        }
        let got: SessionRecord = store.get(&RecordKey::Int(NOV_26)).unwrap().unwrap();
        assert_eq!(got.duration, Some(3));
        assert_eq!(store.count::<SessionRecord>().unwrap(), 1);
    }

    #[test]
    fn missing_key_is_absent_and_delete_is_quiet() {
        let mut store = memory_store();
        let missing: Option<SessionRecord> = store.get(&RecordKey::Int(42)).unwrap();
        assert!(missing.is_none());
        store.delete::<SessionRecord>(&RecordKey::Int(42)).unwrap();
        let still: Option<SessionRecord> = store.get(&RecordKey::Int(42)).unwrap();
        assert!(still.is_none());
    }

    #[test]
    fn delete_removes_record() {
        let mut store = memory_store();
        store.set(&session(NOV_26, 5)).unwrap();
        store.delete::<SessionRecord>(&RecordKey::Int(NOV_26)).unwrap();
        assert_eq!(store.count::<SessionRecord>().unwrap(), 0);
    }

    #[test]
    fn get_all_returns_key_order() {
        let mut store = memory_store();
        for start in [NOV_26 + 2, NOV_26, NOV_26 + 1] {
            store.set(&session(start, 1)).unwrap();
        }
        let all: Vec<SessionRecord> = store.get_all().unwrap();
        let starts: Vec<_> = all.iter().filter_map(|s| s.start_time).collect();
        assert_eq!(starts, vec![NOV_26, NOV_26 + 1, NOV_26 + 2]);
    }

    #[test]
    fn bulk_add_is_all_or_nothing() {
        let mut store = memory_store();
        let batch = vec![
            session(NOV_26, 1),
            SessionRecord {
                duration: Some(2),
                ..SessionRecord::default()
            },
            session(NOV_26 + 1, 3),
        ];
        let err = store.bulk_add(&batch).unwrap_err();
        assert!(matches!(err, StoreError::Write(_)));
        assert_eq!(store.count::<SessionRecord>().unwrap(), 0);
    }

    #[test]
    fn bulk_add_overwrites_duplicate_keys() {
        let mut store = memory_store();
        let batch: Vec<_> = (0..3).map(|i| session(NOV_26 + i, 10)).collect();
        store.bulk_add(&batch).unwrap();
        store.bulk_add(&batch).unwrap();
        assert_eq!(store.count::<SessionRecord>().unwrap(), 3);
    }

    #[test]
    fn sessions_queryable_by_day_range() {
        let mut store = memory_store();
        let batch: Vec<_> = (0..5).map(|i| session(NOV_26 + i * DAY_MS, 10)).collect();
        store.bulk_add(&batch).unwrap();
        let hits: Vec<SessionRecord> = store
            .get_all_by_index("date", "2024-11-27", "2024-11-28")
            .unwrap();
        let days: Vec<_> = hits.iter().filter_map(|s| s.date.clone()).collect();
        assert_eq!(days, vec!["2024-11-27", "2024-11-28"]);
    }

    #[test]
    fn unknown_index_is_rejected() {
        let store = memory_store();
        let err = store
            .get_all_by_index::<SessionRecord>("hostname", "a", "z")
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownIndex { .. }));
    }

    #[test]
    fn text_keyed_collections() {
        let mut store = memory_store();
        let settings = SettingsRecord {
            streak: 5,
            last_session_date: Some("2024-11-26".to_string()),
        };
        store.set(&settings).unwrap();
        let got: SettingsRecord = store.get(&SettingsRecord::key()).unwrap().unwrap();
        assert_eq!(got, settings);

        let visit = SiteVisitRecord {
            site: "example.com".to_string(),
            session_id: "s1".to_string(),
            time_spent: 1_000,
        };
        store.set(&visit).unwrap();
        let by_site: Vec<SiteVisitRecord> = store
            .get_all_by_index("site", "example.com", "example.com")
            .unwrap();
        assert_eq!(by_site, vec![visit]);
    }
}
