use core_model::{
    MilestoneRecord, RawSession, Record, RecordKey, RecordStore, SiteVisitRecord, StoreError,
    Timestamp,
};
use serde::Deserialize;
use tracing::{debug, info};

pub const SESSION_RETENTION_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub max_sessions: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_sessions: SESSION_RETENTION_CAP,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub examined: usize,
    /// Start times of evicted sessions, oldest first.
    pub evicted: Vec<Timestamp>,
    /// Site-visit and milestone records removed alongside them.
    pub cascaded: usize,
}

/// Evicts the oldest sessions until at most `max_sessions` remain. The
/// session starting at `active_start` is never a candidate.
pub fn cleanup<S: RecordStore>(
    store: &mut S,
    policy: &RetentionPolicy,
    active_start: Option<Timestamp>,
) -> Result<CleanupReport, StoreError> {
    let sessions: Vec<RawSession> = store.get_all()?;
    let mut report = CleanupReport {
        examined: sessions.len(),
        ..CleanupReport::default()
    };
    if sessions.len() <= policy.max_sessions {
        debug!(sessions = sessions.len(), cap = policy.max_sessions, "within retention cap");
        return Ok(report);
    }
    let excess = sessions.len() - policy.max_sessions;

    // Ordered by the integer key alone; bodies are never decoded here.
    let mut candidates: Vec<(Timestamp, &RawSession)> = sessions
        .iter()
        .filter_map(|s| s.start_time().map(|start| (start, s)))
        .filter(|(start, _)| Some(*start) != active_start)
        .collect();
    candidates.sort_by_key(|(start, _)| *start);

    for (start, session) in candidates.into_iter().take(excess) {
        store.delete::<RawSession>(&RecordKey::Int(start))?;
        if let Some(id) = session.session_id() {
            report.cascaded += delete_session_children(store, id)?;
        }
        report.evicted.push(start);
    }
    info!(
        examined = report.examined,
        evicted = report.evicted.len(),
        cascaded = report.cascaded,
        "retention cleanup done"
    );
    Ok(report)
}

fn delete_session_children<S: RecordStore>(
    store: &mut S,
    session_id: &str,
) -> Result<usize, StoreError> {
    let visits: Vec<SiteVisitRecord> =
        store.get_all_by_index("sessionId", session_id, session_id)?;
    let milestones: Vec<MilestoneRecord> =
        store.get_all_by_index("sessionId", session_id, session_id)?;
    for key in visits.iter().filter_map(Record::key) {
        store.delete::<SiteVisitRecord>(&key)?;
    }
    for key in milestones.iter().filter_map(Record::key) {
        store.delete::<MilestoneRecord>(&key)?;
    }
    Ok(visits.len() + milestones.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_model::SessionRecord;
    use serde_json::json;
    use store_memory::MemoryStore;
    use store_sqlite::SqliteStore;

    const NOW: i64 = 1_732_579_200_000;
    const DAY_MS: i64 = 86_400_000;

    fn seed<S: RecordStore>(store: &mut S, n: i64) {
        let sessions: Vec<_> = (0..n)
            .map(|i| SessionRecord {
                duration: Some(1_800_000),
                ..SessionRecord::started(NOW - i * DAY_MS, format!("s{i}"))
            })
            .collect();
        store.bulk_add(&sessions).unwrap();
    }

    fn assert_keeps_newest_hundred<S: RecordStore>(store: &mut S) {
        seed(store, 150);
        let report = cleanup(store, &RetentionPolicy::default(), None).unwrap();
        assert_eq!(report.examined, 150);
        assert_eq!(report.evicted.len(), 50);

        let remaining: Vec<SessionRecord> = store.get_all().unwrap();
        assert_eq!(remaining.len(), 100);
        let oldest_kept = remaining.iter().filter_map(|s| s.start_time).min().unwrap();
        assert_eq!(oldest_kept, NOW - 99 * DAY_MS);
        assert!(report.evicted.iter().all(|t| *t < oldest_kept));
    }

    #[test]
    fn keeps_newest_hundred_in_memory() {
        let mut store = MemoryStore::new();
        store.initialize().unwrap();
        assert_keeps_newest_hundred(&mut store);
    }

    #[test]
    fn keeps_newest_hundred_in_sqlite() {
        let mut store = SqliteStore::new(":memory:");
        store.initialize().unwrap();
        assert_keeps_newest_hundred(&mut store);
    }

    #[test]
    fn under_cap_is_untouched() {
        let mut store = MemoryStore::new();
        store.initialize().unwrap();
        seed(&mut store, 100);
        let report = cleanup(&mut store, &RetentionPolicy::default(), None).unwrap();
        assert!(report.evicted.is_empty());
        assert_eq!(store.count::<SessionRecord>().unwrap(), 100);
    }

    #[test]
    fn active_session_is_never_evicted() {
        let mut store = MemoryStore::new();
        store.initialize().unwrap();
        seed(&mut store, 5);
        let oldest = NOW - 4 * DAY_MS;
        let policy = RetentionPolicy { max_sessions: 3 };
        let report = cleanup(&mut store, &policy, Some(oldest)).unwrap();
        assert_eq!(report.evicted, vec![NOW - 3 * DAY_MS, NOW - 2 * DAY_MS]);
        assert!(store.get::<SessionRecord>(&RecordKey::Int(oldest)).unwrap().is_some());
        assert_eq!(store.count::<SessionRecord>().unwrap(), 3);
    }

    #[test]
    fn malformed_rows_do_not_block_eviction() {
        let mut store = SqliteStore::new(":memory:");
        store.initialize().unwrap();
        seed(&mut store, 3);
        store
            .set(&RawSession(json!({"startTime": 5, "duration": "30"})))
            .unwrap();

        let report = cleanup(&mut store, &RetentionPolicy { max_sessions: 2 }, None).unwrap();
        assert_eq!(report.examined, 4);
        assert_eq!(report.evicted, vec![5, NOW - 2 * DAY_MS]);
        let remaining: Vec<SessionRecord> = store.get_all().unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn eviction_cascades_to_session_children() {
        let mut store = MemoryStore::new();
        store.initialize().unwrap();
        seed(&mut store, 2);
        for id in ["s0", "s1"] {
            store
                .set(&SiteVisitRecord {
                    site: "docs.rs".to_string(),
                    session_id: id.to_string(),
                    time_spent: 10,
                })
                .unwrap();
            store
                .set(&MilestoneRecord {
                    duration_threshold_ms: core_model::MILESTONE_THRESHOLDS_MS[0],
                    acknowledged_in_session_id: id.to_string(),
                })
                .unwrap();
        }
        let report = cleanup(&mut store, &RetentionPolicy { max_sessions: 1 }, None).unwrap();
        assert_eq!(report.evicted, vec![NOW - DAY_MS]);
        assert_eq!(report.cascaded, 2);
        let visits: Vec<SiteVisitRecord> = store.get_all().unwrap();
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].session_id, "s0");
        assert_eq!(store.count::<MilestoneRecord>().unwrap(), 1);
    }
}
