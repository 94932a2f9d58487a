use std::collections::BTreeMap;

use core_model::{Collection, Record, RecordKey, RecordStore, StoreError, require_key};
use serde_json::Value;
use tracing::debug;

/// Volatile collection store. Used when the persistent database cannot be
/// opened, so tracking keeps working for the rest of the run.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: BTreeMap<Collection, BTreeMap<RecordKey, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collection<R: Record>(&self) -> Result<&BTreeMap<RecordKey, Value>, StoreError> {
        self.collections
            .get(&R::COLLECTION)
            .ok_or_else(|| StoreError::StorageUnavailable("store not initialized".to_string()))
    }

    fn collection_mut<R: Record>(&mut self) -> Result<&mut BTreeMap<RecordKey, Value>, StoreError> {
        self.collections
            .get_mut(&R::COLLECTION)
            .ok_or_else(|| StoreError::StorageUnavailable("store not initialized".to_string()))
    }
}

impl RecordStore for MemoryStore {
    fn initialize(&mut self) -> Result<Vec<Collection>, StoreError> {
        let mut created = Vec::new();
        for c in Collection::ALL {
            if !self.collections.contains_key(&c) {
                self.collections.insert(c, BTreeMap::new());
                created.push(c);
            }
        }
        Ok(created)
    }

    fn set<R: Record>(&mut self, record: &R) -> Result<R, StoreError> {
        let key = require_key(record)?;
        let value = encode(record)?;
        self.collection_mut::<R>()?.insert(key, value);
        Ok(record.clone())
    }

    fn get<R: Record>(&self, key: &RecordKey) -> Result<Option<R>, StoreError> {
        self.collection::<R>()?
            .get(key)
            .map(|v| decode::<R>(v))
            .transpose()
    }

    fn get_all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        self.collection::<R>()?.values().map(decode::<R>).collect()
    }

    fn get_all_by_index<R: Record>(
        &self,
        index: &str,
        lower: &str,
        upper: &str,
    ) -> Result<Vec<R>, StoreError> {
        let Some(index_schema) = R::COLLECTION.schema().index(index) else {
            return Err(StoreError::UnknownIndex {
                collection: R::COLLECTION,
                index: index.to_string(),
            });
        };
        self.collection::<R>()?
            .values()
            .filter(|v| {
                v.get(index_schema.field)
                    .and_then(Value::as_str)
                    .is_some_and(|s| lower <= s && s <= upper)
            })
            .map(decode::<R>)
            .collect()
    }

    fn count<R: Record>(&self) -> Result<usize, StoreError> {
        Ok(self.collection::<R>()?.len())
    }

    fn bulk_add<R: Record>(&mut self, records: &[R]) -> Result<(), StoreError> {
        // Encode everything first so a bad record leaves the map untouched.
        let staged = records
            .iter()
            .map(|r| Ok((require_key(r)?, encode(r)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        let target = self.collection_mut::<R>()?;
        for (key, value) in staged {
            target.insert(key, value);
        }
        debug!(collection = %R::COLLECTION, records = records.len(), "bulk add applied");
        Ok(())
    }

    fn delete<R: Record>(&mut self, key: &RecordKey) -> Result<(), StoreError> {
        self.collection_mut::<R>()?.remove(key);
        Ok(())
    }
}

fn encode<R: Record>(record: &R) -> Result<Value, StoreError> {
    serde_json::to_value(record)
        .map_err(|e| StoreError::Write(format!("encoding {} record: {e}", R::COLLECTION)))
}

fn decode<R: Record>(value: &Value) -> Result<R, StoreError> {
    serde_json::from_value(value.clone())
        .map_err(|e| StoreError::Read(format!("decoding {} record: {e}", R::COLLECTION)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_model::{SessionRecord, SettingsRecord};

    fn store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.initialize().unwrap();
        store
    }

    #[test]
    fn initialize_is_idempotent() {
        let mut store = MemoryStore::new();
        assert_eq!(store.initialize().unwrap().len(), 4);
        assert!(store.initialize().unwrap().is_empty());
    }

    #[test]
    fn uninitialized_store_is_unavailable() {
        let store = MemoryStore::new();
        let err = store.get_all::<SessionRecord>().unwrap_err();
        assert!(matches!(err, StoreError::StorageUnavailable(_)));
    }

    #[test]
    fn last_write_wins_and_copies_are_detached() {
        let mut store = store();
        let mut settings = SettingsRecord::default();
        for streak in 1..=3 {
            settings.streak = streak;
            store.set(&settings).unwrap();
        }
        let mut got: SettingsRecord = store.get(&SettingsRecord::key()).unwrap().unwrap();
        assert_eq!(got.streak, 3);
        got.streak = 99;
        let again: SettingsRecord = store.get(&SettingsRecord::key()).unwrap().unwrap();
        assert_eq!(again.streak, 3);
    }

    #[test]
    fn bulk_add_rejects_whole_batch() {
        let mut store = store();
        let batch = vec![
            SessionRecord::started(1, "a".to_string()),
            SessionRecord::default(),
        ];
        assert!(store.bulk_add(&batch).is_err());
        assert_eq!(store.count::<SessionRecord>().unwrap(), 0);
    }

    #[test]
    fn delete_of_missing_key_is_ok() {
        let mut store = store();
        store.delete::<SessionRecord>(&RecordKey::Int(7)).unwrap();
        assert!(store.get::<SessionRecord>(&RecordKey::Int(7)).unwrap().is_none());
    }

    #[test]
    fn index_range_matches_text_values() {
        let mut store = store();
        let day = 86_400_000;
        let batch: Vec<_> = (0..3)
            .map(|i| SessionRecord::started(1_732_579_200_000 + i * day, format!("s{i}")))
            .collect();
        store.bulk_add(&batch).unwrap();
        let hits: Vec<SessionRecord> = store
            .get_all_by_index("date", "2024-11-27", "2024-12-31")
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(store.get_all_by_index::<SessionRecord>("nope", "a", "b").is_err());
    }
}
