use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod schema;

pub use schema::{Collection, CollectionSchema, IndexSchema, KeyKind};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

pub const SETTINGS_KEY: &str = "userSettings";

/// Milestone cutoffs in milliseconds, ascending.
pub const MILESTONE_THRESHOLDS_MS: [u64; 5] = [
    30 * 60 * 1000,
    60 * 60 * 1000,
    2 * 60 * 60 * 1000,
    4 * 60 * 60 * 1000,
    6 * 60 * 60 * 1000,
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("read failed: {0}")]
    Read(String),
    #[error("collection {collection} has no index named {index}")]
    UnknownIndex {
        collection: Collection,
        index: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    Int(i64),
    Text(String),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Int(v) => write!(f, "{v}"),
            RecordKey::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for RecordKey {
    fn from(v: i64) -> Self {
        RecordKey::Int(v)
    }
}

impl From<&str> for RecordKey {
    fn from(v: &str) -> Self {
        RecordKey::Text(v.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(v: String) -> Self {
        RecordKey::Text(v)
    }
}

/// A value that lives in exactly one collection and knows its own primary key.
pub trait Record: Serialize + DeserializeOwned + Clone {
    const COLLECTION: Collection;

    /// `None` when the record lacks the field its key is derived from.
    fn key(&self) -> Option<RecordKey>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<Timestamp>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default)]
    pub distractions: u32,
    #[serde(default)]
    pub site_visits: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl SessionRecord {
    pub fn started(start_time: Timestamp, session_id: String) -> Self {
        Self {
            start_time: Some(start_time),
            date: day_string(start_time),
            session_id: Some(session_id),
            ..Self::default()
        }
    }

    /// Started, and neither ended nor given a duration.
    pub fn is_active(&self) -> bool {
        self.start_time.is_some() && self.end_time.is_none() && self.duration.is_none()
    }
}

impl Record for SessionRecord {
    const COLLECTION: Collection = Collection::Sessions;

    fn key(&self) -> Option<RecordKey> {
        self.start_time.map(RecordKey::Int)
    }
}

/// A session body exactly as stored. Reading through this type never fails
/// on a malformed field, so maintenance passes can still see every row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawSession(pub serde_json::Value);

impl RawSession {
    pub fn start_time(&self) -> Option<Timestamp> {
        self.0.get("startTime").and_then(serde_json::Value::as_i64)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.0.get("sessionId").and_then(serde_json::Value::as_str)
    }

    pub fn decode(&self) -> Result<SessionRecord, serde_json::Error> {
        serde_json::from_value(self.0.clone())
    }
}

impl Record for RawSession {
    const COLLECTION: Collection = Collection::Sessions;

    fn key(&self) -> Option<RecordKey> {
        self.start_time().map(RecordKey::Int)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteVisitRecord {
    pub site: String,
    pub session_id: String,
    /// Accumulated milliseconds.
    pub time_spent: u64,
}

impl SiteVisitRecord {
    pub fn key_for(site: &str, session_id: &str) -> RecordKey {
        RecordKey::Text(deterministic_id(&["site_visit", site, session_id]))
    }
}

impl Record for SiteVisitRecord {
    const COLLECTION: Collection = Collection::SiteVisits;

    fn key(&self) -> Option<RecordKey> {
        Some(Self::key_for(&self.site, &self.session_id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneRecord {
    pub duration_threshold_ms: u64,
    pub acknowledged_in_session_id: String,
}

impl MilestoneRecord {
    pub fn key_for(session_id: &str, threshold_ms: u64) -> RecordKey {
        RecordKey::Text(deterministic_id(&[
            "milestone",
            session_id,
            &threshold_ms.to_string(),
        ]))
    }
}

impl Record for MilestoneRecord {
    const COLLECTION: Collection = Collection::Milestones;

    fn key(&self) -> Option<RecordKey> {
        Some(Self::key_for(
            &self.acknowledged_in_session_id,
            self.duration_threshold_ms,
        ))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsRecord {
    #[serde(default)]
    pub streak: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_session_date: Option<String>,
}

impl SettingsRecord {
    pub fn key() -> RecordKey {
        RecordKey::Text(SETTINGS_KEY.to_string())
    }
}

impl Record for SettingsRecord {
    const COLLECTION: Collection = Collection::Settings;

    fn key(&self) -> Option<RecordKey> {
        Some(Self::key())
    }
}

/// Indexed collection store. Every call completes (and is durable, for
/// persistent backends) before it returns.
pub trait RecordStore {
    /// Creates missing collections and returns the ones it created.
    fn initialize(&mut self) -> Result<Vec<Collection>, StoreError>;
    fn set<R: Record>(&mut self, record: &R) -> Result<R, StoreError>;
    fn get<R: Record>(&self, key: &RecordKey) -> Result<Option<R>, StoreError>;
    /// All records in key order.
    fn get_all<R: Record>(&self) -> Result<Vec<R>, StoreError>;
    /// Records whose indexed value lies in `lower..=upper`, in key order.
    fn get_all_by_index<R: Record>(
        &self,
        index: &str,
        lower: &str,
        upper: &str,
    ) -> Result<Vec<R>, StoreError>;
    fn count<R: Record>(&self) -> Result<usize, StoreError>;
    /// Either every record lands or none does.
    fn bulk_add<R: Record>(&mut self, records: &[R]) -> Result<(), StoreError>;
    fn delete<R: Record>(&mut self, key: &RecordKey) -> Result<(), StoreError>;
}

/// The flat key-value store that predates the indexed collections.
pub trait LegacyStore {
    fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;
    fn set(&mut self, key: &str, value: serde_json::Value) -> Result<(), StoreError>;
}

pub fn require_key<R: Record>(record: &R) -> Result<RecordKey, StoreError> {
    record.key().ok_or_else(|| {
        StoreError::Write(format!(
            "record for {} is missing its primary key",
            R::COLLECTION
        ))
    })
}

pub fn day_of(ts: Timestamp) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(ts).map(|dt| dt.date_naive())
}

pub fn day_string(ts: Timestamp) -> Option<String> {
    day_of(ts).map(|d| d.format("%Y-%m-%d").to_string())
}

/// Accepts either a bare `YYYY-MM-DD` day or a full RFC 3339 timestamp.
pub fn parse_day(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok().or_else(|| {
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.naive_utc().date())
    })
}

pub fn session_id_for(start_time: Timestamp) -> String {
    let id = deterministic_id(&["session", &start_time.to_string()]);
    format!("session_{}", &id[..13])
}

pub fn deterministic_id(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[0x1f]);
    }
    hasher.finalize().to_hex().to_string()
}
