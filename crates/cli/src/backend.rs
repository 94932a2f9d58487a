use core_model::{Collection, Record, RecordKey, RecordStore, StoreError};
use store_memory::MemoryStore;
use store_sqlite::SqliteStore;
use tracing::warn;

/// The store the commands run against. Falls back to memory when the
/// database cannot be opened, so commands still work for the process lifetime.
pub enum Backend {
    Sqlite(SqliteStore),
    Memory(MemoryStore),
}

impl Backend {
    pub fn open(mut store: SqliteStore) -> anyhow::Result<(Self, Vec<Collection>)> {
        match store.initialize() {
            Ok(created) => Ok((Backend::Sqlite(store), created)),
            Err(StoreError::StorageUnavailable(reason)) => {
                warn!(
                    path = %store.path().display(),
                    reason = %reason,
                    "persistent storage unavailable; using in-memory store"
                );
                let mut memory = MemoryStore::new();
                let created = memory.initialize()?;
                Ok((Backend::Memory(memory), created))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Backend::Memory(_))
    }

    pub fn integrity_check(&self) -> anyhow::Result<String> {
        match self {
            Backend::Sqlite(s) => s.integrity_check(),
            Backend::Memory(_) => Ok("in-memory".to_string()),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $s:ident => $e:expr) => {
        match $self {
            Backend::Sqlite($s) => $e,
            Backend::Memory($s) => $e,
        }
    };
}

impl RecordStore for Backend {
    fn initialize(&mut self) -> Result<Vec<Collection>, StoreError> {
        dispatch!(self, s => s.initialize())
    }

    fn set<R: Record>(&mut self, record: &R) -> Result<R, StoreError> {
        dispatch!(self, s => s.set(record))
    }

    fn get<R: Record>(&self, key: &RecordKey) -> Result<Option<R>, StoreError> {
        dispatch!(self, s => s.get(key))
    }

    fn get_all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        dispatch!(self, s => s.get_all())
    }

    fn get_all_by_index<R: Record>(
        &self,
        index: &str,
        lower: &str,
        upper: &str,
    ) -> Result<Vec<R>, StoreError> {
        dispatch!(self, s => s.get_all_by_index(index, lower, upper))
    }

    fn count<R: Record>(&self) -> Result<usize, StoreError> {
        dispatch!(self, s => s.count::<R>())
    }

    fn bulk_add<R: Record>(&mut self, records: &[R]) -> Result<(), StoreError> {
        dispatch!(self, s => s.bulk_add(records))
    }

    fn delete<R: Record>(&mut self, key: &RecordKey) -> Result<(), StoreError> {
        dispatch!(self, s => s.delete::<R>(key))
    }
}
