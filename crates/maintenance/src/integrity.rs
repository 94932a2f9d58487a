use core_model::{RawSession, Record, RecordStore, StoreError, Timestamp};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

pub const INVALID_SESSION: &str = "Invalid session data";
pub const UNREADABLE_SESSIONS: &str = "Unreadable session data";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub issue: String,
    /// The stored body, as found.
    pub record: Option<Value>,
}

/// A body is valid when it decodes as a session and carries a start time
/// and a non-negative duration.
fn is_valid(raw: &RawSession) -> bool {
    raw.decode()
        .is_ok_and(|s| s.start_time.is_some() && s.duration.is_some_and(|d| d >= 0))
}

/// One issue per invalid record, however many of its fields are wrong.
pub fn validate_sessions(records: &[RawSession]) -> Vec<Issue> {
    records
        .iter()
        .filter(|raw| !is_valid(raw))
        .map(|raw| Issue {
            issue: INVALID_SESSION.to_string(),
            record: Some(raw.0.clone()),
        })
        .collect()
}

/// Read-only pass over the stored sessions. The in-progress session, which
/// has no duration yet, is skipped. A failed read is reported, not raised.
pub fn validate_data<S: RecordStore>(store: &S, active_start: Option<Timestamp>) -> Vec<Issue> {
    let sessions: Vec<RawSession> = match store.get_all() {
        Ok(sessions) => sessions,
        Err(e) => {
            warn!(error = %e, "session collection could not be read");
            return vec![Issue {
                issue: UNREADABLE_SESSIONS.to_string(),
                record: None,
            }];
        }
    };
    let candidates: Vec<RawSession> = sessions
        .into_iter()
        .filter(|s| active_start.is_none() || s.start_time() != active_start)
        .collect();
    let issues = validate_sessions(&candidates);
    info!(sessions = candidates.len(), issues = issues.len(), "validation done");
    issues
}

/// Deletes the stored records named by `issues`. Returns how many were removed.
pub fn repair_invalid<S: RecordStore>(store: &mut S, issues: &[Issue]) -> Result<usize, StoreError> {
    let mut removed = 0;
    for key in issues
        .iter()
        .filter_map(|i| i.record.clone())
        .filter_map(|v| RawSession(v).key())
    {
        store.delete::<RawSession>(&key)?;
        removed += 1;
    }
    if removed > 0 {
        info!(removed, "invalid sessions removed");
    }
    Ok(removed)
}
