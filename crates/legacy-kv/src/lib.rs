use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use core_model::{LegacyStore, StoreError};
use serde_json::{Map, Value};
use tracing::debug;

/// Legacy store persisted as one JSON object, mirroring the old flat
/// key/value layout (`sessionHistory`, `streak`, ...).
#[derive(Debug)]
pub struct JsonFileKv {
    path: PathBuf,
    entries: Map<String, Value>,
}

impl JsonFileKv {
    pub fn default_path() -> PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("focus").join("legacy.json")
    }

    /// A missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Map::new(),
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(map)) => map,
                Ok(_) => {
                    return Err(StoreError::Read(format!(
                        "legacy store {} is not a JSON object",
                        path.display()
                    )));
                }
                Err(e) => {
                    return Err(StoreError::Read(format!(
                        "parsing legacy store {}: {e}",
                        path.display()
                    )));
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => {
                return Err(StoreError::Read(format!(
                    "reading legacy store {}: {e}",
                    path.display()
                )));
            }
        };
        debug!(path = %path.display(), keys = entries.len(), "legacy store loaded");
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(&self.entries)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
    }
}

impl LegacyStore for JsonFileKv {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        let previous = self.entries.insert(key.to_string(), value);
        if let Err(e) = self.persist() {
            // Keep memory in step with the file.
            match previous {
                Some(v) => self.entries.insert(key.to_string(), v),
                None => self.entries.remove(key),
            };
            return Err(StoreError::Write(format!(
                "writing legacy store {}: {e}",
                self.path.display()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryKv {
    entries: Map<String, Value>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-object values yield an empty store.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(entries) => Self { entries },
            _ => Self::default(),
        }
    }
}

impl LegacyStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}
