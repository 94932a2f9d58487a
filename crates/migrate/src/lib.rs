use anyhow::Context;
use chrono::DateTime;
use core_model::{
    LegacyStore, RecordStore, SessionRecord, SettingsRecord, SiteVisitRecord, day_string,
    parse_day, session_id_for,
};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

pub mod keys {
    pub const SESSION_HISTORY: &str = "sessionHistory";
    pub const STREAK: &str = "streak";
    pub const LAST_SESSION_DATE: &str = "lastSessionDate";
    pub const ACTIVE_SESSION: &str = "activeSession";
    pub const MIGRATION_COMPLETED: &str = "migrationCompleted";
}

#[derive(Debug, Clone)]
pub enum MigrationPhase {
    Checking,
    Reading { entries: usize },
    Writing { sessions: usize, site_visits: usize },
    Settings,
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub already_completed: bool,
    pub sessions: usize,
    pub site_visits: usize,
    pub skipped: usize,
    pub active_session: bool,
    pub settings_writes: usize,
}

pub fn is_migrated(legacy: &impl LegacyStore) -> anyhow::Result<bool> {
    Ok(legacy
        .get(keys::MIGRATION_COMPLETED)?
        .and_then(|v| v.as_bool())
        .unwrap_or(false))
}

/// Imports the legacy flat store into the collections. The completion flag is
/// written last, so any failure before it makes the next run retry; re-import
/// overwrites by `startTime` instead of duplicating.
pub fn migrate_from_legacy_store<L, S>(
    legacy: &mut L,
    store: &mut S,
    on_progress: impl Fn(MigrationPhase),
) -> anyhow::Result<MigrationReport>
where
    L: LegacyStore,
    S: RecordStore,
{
    on_progress(MigrationPhase::Checking);
    if is_migrated(&*legacy)? {
        info!("legacy migration already completed");
        return Ok(MigrationReport {
            already_completed: true,
            ..MigrationReport::default()
        });
    }

    let history = match legacy.get(keys::SESSION_HISTORY)? {
        Some(Value::Array(entries)) => entries,
        None | Some(Value::Null) => Vec::new(),
        Some(_) => {
            warn!("legacy sessionHistory is not a list; ignoring it");
            Vec::new()
        }
    };
    on_progress(MigrationPhase::Reading {
        entries: history.len(),
    });

    let mut report = MigrationReport::default();
    let mut sessions = Vec::with_capacity(history.len());
    for (index, entry) in history.into_iter().enumerate() {
        match legacy_session(entry) {
            Some(session) => sessions.push(session),
            None => {
                warn!(index, "skipping legacy session without a usable startTime");
                report.skipped += 1;
            }
        }
    }
    let visits = standalone_site_visits(&sessions);

    on_progress(MigrationPhase::Writing {
        sessions: sessions.len(),
        site_visits: visits.len(),
    });
    if !sessions.is_empty() {
        store
            .bulk_add(&sessions)
            .context("importing legacy session history")?;
    }
    if !visits.is_empty() {
        store
            .bulk_add(&visits)
            .context("importing legacy site visits")?;
    }
    report.sessions = sessions.len();
    report.site_visits = visits.len();

    if let Some(value) = legacy.get(keys::ACTIVE_SESSION)?
        && let Some(active) = legacy_session(value)
    {
        let active = SessionRecord {
            end_time: None,
            duration: None,
            ..active
        };
        store
            .set(&active)
            .context("importing legacy active session")?;
        report.active_session = true;
    }

    on_progress(MigrationPhase::Settings);
    let mut settings: SettingsRecord = store.get(&SettingsRecord::key())?.unwrap_or_default();
    if let Some(streak) = legacy.get(keys::STREAK)?.and_then(|v| v.as_u64()) {
        settings.streak = u32::try_from(streak).unwrap_or(u32::MAX);
        store.set(&settings).context("importing legacy streak")?;
        report.settings_writes += 1;
    }
    if let Some(day) = legacy
        .get(keys::LAST_SESSION_DATE)?
        .as_ref()
        .and_then(Value::as_str)
        .and_then(parse_day)
    {
        settings.last_session_date = Some(day.format("%Y-%m-%d").to_string());
        store
            .set(&settings)
            .context("importing legacy last session date")?;
        report.settings_writes += 1;
    }

    legacy
        .set(keys::MIGRATION_COMPLETED, Value::Bool(true))
        .context("marking legacy migration complete")?;
    on_progress(MigrationPhase::Done);
    info!(
        sessions = report.sessions,
        site_visits = report.site_visits,
        skipped = report.skipped,
        "legacy migration completed"
    );
    Ok(report)
}

/// Shapes one legacy history entry into a session record. Durations are
/// recomputed from the timestamps when both are present, since one legacy
/// writer stored minutes. A finished entry with only a duration gets its
/// `endTime` back; a fractional duration with no `endTime` is dropped and
/// left for validation to report.
fn legacy_session(mut value: Value) -> Option<SessionRecord> {
    let obj = value.as_object_mut()?;
    let start = obj.get("startTime").and_then(as_millis)?;
    obj.insert("startTime".to_string(), json!(start));

    match obj.get("endTime").and_then(as_millis) {
        Some(end) => {
            obj.insert("endTime".to_string(), json!(end));
            obj.insert("duration".to_string(), json!(end - start));
        }
        None => match obj.get("duration").and_then(Value::as_i64) {
            Some(duration) if duration >= 0 => {
                obj.insert("endTime".to_string(), json!(start + duration));
            }
            Some(_) => {
                obj.remove("endTime");
            }
            None => {
                obj.remove("endTime");
                obj.remove("duration");
            }
        },
    }

    let distractions = obj.get("distractions").and_then(Value::as_u64).unwrap_or(0);
    obj.insert("distractions".to_string(), json!(distractions));

    let visits = match obj.get("siteVisits") {
        Some(Value::Object(map)) => map
            .iter()
            .filter_map(|(site, ms)| {
                as_millis(ms)
                    .filter(|v| *v >= 0)
                    .map(|v| (site.clone(), json!(v)))
            })
            .collect::<Map<_, _>>(),
        _ => Map::new(),
    };
    obj.insert("siteVisits".to_string(), Value::Object(visits));

    if !obj.get("date").is_some_and(Value::is_string) {
        match day_string(start) {
            Some(day) => obj.insert("date".to_string(), json!(day)),
            None => obj.remove("date"),
        };
    }
    if !obj.get("sessionId").is_some_and(Value::is_string) {
        obj.insert("sessionId".to_string(), json!(session_id_for(start)));
    }

    match serde_json::from_value(value) {
        Ok(session) => Some(session),
        Err(e) => {
            warn!(error = %e, start, "legacy session did not decode");
            None
        }
    }
}

fn as_millis(v: &Value) -> Option<i64> {
    if let Some(i) = v.as_i64() {
        return Some(i);
    }
    if let Some(f) = v.as_f64().filter(|f| f.is_finite()) {
        return Some(f.round() as i64);
    }
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp_millis())
}

fn standalone_site_visits(sessions: &[SessionRecord]) -> Vec<SiteVisitRecord> {
    sessions
        .iter()
        .filter_map(|s| s.session_id.as_ref().map(|id| (id, &s.site_visits)))
        .flat_map(|(id, visits)| {
            visits.iter().map(move |(site, ms)| SiteVisitRecord {
                site: site.clone(),
                session_id: id.clone(),
                time_spent: *ms,
            })
        })
        .collect()
}
