use anyhow::bail;
use chrono::{DateTime, NaiveDate, SecondsFormat};
use core_model::{
    MilestoneRecord, RawSession, Record, RecordStore, SessionRecord, SettingsRecord, Timestamp,
    day_of, session_id_for,
};
use serde_json::json;
use tracing::{debug, info, warn};

pub mod context;
pub mod milestones;
pub mod streak;
pub mod sync;

pub use context::{ActiveSession, OTHER_APPS, SessionContext};
pub use milestones::MilestoneTracker;
pub use streak::{advance_streak, effective_streak};
pub use sync::{NoopSync, RecordSync, SESSIONS_TABLE, SITE_VISITS_TABLE};

use sync::push_best_effort;

/// Drives one focus session at a time against a `RecordStore`. Store
/// failures are logged and the in-memory context stays authoritative.
pub struct SessionTracker<S, Y = NoopSync> {
    store: S,
    sync: Y,
    ctx: SessionContext,
    log_milestones: bool,
}

impl<S: RecordStore> SessionTracker<S, NoopSync> {
    pub fn new(store: S) -> Self {
        Self::with_sync(store, NoopSync)
    }
}

impl<S: RecordStore, Y: RecordSync> SessionTracker<S, Y> {
    pub fn with_sync(store: S, sync: Y) -> Self {
        Self {
            store,
            sync,
            ctx: SessionContext::default(),
            log_milestones: false,
        }
    }

    /// Persist each reached milestone to the milestones collection.
    pub fn log_milestones(mut self, enabled: bool) -> Self {
        self.log_milestones = enabled;
        self
    }

    /// Rebuilds the context from the store: the latest session without an
    /// `endTime` becomes the active one. Unreadable stores yield an idle tracker.
    pub fn resume(store: S, sync: Y) -> Self {
        let mut tracker = Self::with_sync(store, sync);
        let sessions: Vec<RawSession> = match tracker.store.get_all() {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "could not read sessions; starting idle");
                return tracker;
            }
        };
        tracker.ctx.last_start = sessions.iter().filter_map(RawSession::start_time).max();

        let open = sessions
            .iter()
            .rev()
            .filter_map(|raw| raw.decode().ok())
            .find(SessionRecord::is_active);
        let Some(open) = open else {
            debug!(sessions = sessions.len(), "no open session to resume");
            return tracker;
        };
        let Some(start) = open.start_time else {
            return tracker;
        };
        let session_id = open
            .session_id
            .clone()
            .unwrap_or_else(|| session_id_for(start));
        tracker.ctx.active = Some(ActiveSession {
            session_id: session_id.clone(),
            start_time: start,
            distractions: open.distractions,
        });
        tracker.ctx.site_visits = open.site_visits.clone();

        match tracker
            .store
            .get_all_by_index::<MilestoneRecord>("sessionId", &session_id, &session_id)
        {
            Ok(acks) => {
                for ack in acks {
                    tracker.ctx.milestones.mark_notified(ack.duration_threshold_ms);
                }
            }
            Err(e) => warn!(error = %e, "could not read milestone acknowledgements"),
        }
        info!(session_id = %session_id, start, "resumed open session");
        tracker
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn active_start(&self) -> Option<Timestamp> {
        self.ctx.active.as_ref().map(|a| a.start_time)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn start_session(&mut self, now: Timestamp) -> anyhow::Result<SessionRecord> {
        if let Some(active) = &self.ctx.active {
            bail!("session {} is already in progress", active.session_id);
        }
        let start = self.ctx.next_start(now);
        let session_id = session_id_for(start);
        self.ctx.begin(ActiveSession {
            session_id: session_id.clone(),
            start_time: start,
            distractions: 0,
        });

        let record = SessionRecord::started(start, session_id.clone());
        self.persist(&record);
        if self.log_milestones {
            self.clear_stale_milestones(&session_id);
        }
        push_best_effort(
            &self.sync,
            SESSIONS_TABLE,
            json!({
                "SessionID": session_id,
                "StartTime": rfc3339(start),
                "EndTime": null,
                "Duration": 0,
                "Distractions": 0,
            }),
        );
        info!(session_id = %session_id, start, "session started");
        Ok(record)
    }

    /// Returns the new distraction count, or `None` when no session is active.
    pub fn report_distraction(&mut self) -> Option<u32> {
        let active = self.ctx.active.as_mut()?;
        active.distractions += 1;
        let count = active.distractions;
        self.persist_snapshot();
        debug!(distractions = count, "distraction recorded");
        Some(count)
    }

    /// Makes `site` the current site, crediting the previous one. Ignored
    /// while idle.
    pub fn switch_site(&mut self, site: &str, now: Timestamp) -> bool {
        if self.ctx.active.is_none() {
            return false;
        }
        let credited = self.ctx.flush_current(now);
        self.ctx.current_site = Some((site.to_string(), now));
        if credited > 0 {
            self.persist_snapshot();
        }
        true
    }

    pub fn leave_browser(&mut self, now: Timestamp) -> bool {
        self.switch_site(OTHER_APPS, now)
    }

    /// Adds an explicit amount of time to `site`.
    pub fn record_site_time(&mut self, site: &str, ms: u64) -> bool {
        if self.ctx.active.is_none() {
            return false;
        }
        self.ctx.add_site_time(site, ms);
        self.persist_snapshot();
        true
    }

    /// Thresholds newly reached by the active session, ascending.
    pub fn check_milestones(&mut self, now: Timestamp) -> Vec<u64> {
        let Some(active) = self.ctx.active.clone() else {
            return Vec::new();
        };
        let elapsed = u64::try_from(now.saturating_sub(active.start_time)).unwrap_or(0);
        let reached = self.ctx.milestones.check(elapsed);
        for &threshold in &reached {
            info!(session_id = %active.session_id, threshold_ms = threshold, "milestone reached");
            if self.log_milestones {
                self.persist(&MilestoneRecord {
                    duration_threshold_ms: threshold,
                    acknowledged_in_session_id: active.session_id.clone(),
                });
            }
        }
        reached
    }

    /// Finalizes the active session. `None` when nothing was in progress.
    pub fn end_session(&mut self, now: Timestamp) -> Option<SessionRecord> {
        let active = self.ctx.active.clone()?;
        self.ctx.flush_current(now);
        let end = now.max(active.start_time);
        let duration = end - active.start_time;

        let record = SessionRecord {
            end_time: Some(end),
            duration: Some(duration),
            distractions: active.distractions,
            site_visits: self.ctx.site_visits.clone(),
            ..SessionRecord::started(active.start_time, active.session_id.clone())
        };
        self.persist(&record);
        if let Some(today) = day_of(end) {
            self.advance_settings(today);
        }
        self.push_completed(&record, &active.session_id);

        info!(
            session_id = %active.session_id,
            duration_ms = duration,
            distractions = active.distractions,
            sites = record.site_visits.len(),
            "session ended"
        );
        self.ctx.clear_session();
        Some(record)
    }

    /// Streak as of `today`; 0 when settings cannot be read.
    pub fn streak(&self, today: NaiveDate) -> u32 {
        effective_streak(&self.settings(), today)
    }

    fn settings(&self) -> SettingsRecord {
        match self.store.get::<SettingsRecord>(&SettingsRecord::key()) {
            Ok(settings) => settings.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "settings unreadable; using defaults");
                SettingsRecord::default()
            }
        }
    }

    fn advance_settings(&mut self, today: NaiveDate) {
        let updated = advance_streak(&self.settings(), today);
        debug!(streak = updated.streak, "streak advanced");
        self.persist(&updated);
    }

    fn persist_snapshot(&mut self) {
        if let Some(record) = self.ctx.snapshot() {
            self.persist(&record);
        }
    }

    fn persist<R: Record>(&mut self, record: &R) {
        if let Err(e) = self.store.set(record) {
            warn!(collection = %R::COLLECTION, error = %e, "write failed; keeping in-memory state");
        }
    }

    fn clear_stale_milestones(&mut self, keep_session: &str) {
        let acks: Vec<MilestoneRecord> = match self.store.get_all() {
            Ok(acks) => acks,
            Err(e) => {
                warn!(error = %e, "could not read milestone acknowledgements");
                return;
            }
        };
        let mut cleared = 0;
        for ack in acks
            .iter()
            .filter(|a| a.acknowledged_in_session_id != keep_session)
        {
            let Some(key) = ack.key() else { continue };
            match self.store.delete::<MilestoneRecord>(&key) {
                Ok(()) => cleared += 1,
                Err(e) => warn!(error = %e, "could not clear milestone acknowledgement"),
            }
        }
        if cleared > 0 {
            debug!(cleared, "cleared earlier milestone acknowledgements");
        }
    }

    fn push_completed(&self, record: &SessionRecord, session_id: &str) {
        for (site, ms) in &record.site_visits {
            push_best_effort(
                &self.sync,
                SITE_VISITS_TABLE,
                json!({
                    "URL": site,
                    "TimeSpent": ms / 1000,
                    "Session": session_id,
                }),
            );
        }
        push_best_effort(
            &self.sync,
            SESSIONS_TABLE,
            json!({
                "SessionID": session_id,
                "StartTime": record.start_time.map(rfc3339),
                "EndTime": record.end_time.map(rfc3339),
                "Duration": record.duration,
                "DistractionCount": record.distractions,
            }),
        );
    }
}

fn rfc3339(ts: Timestamp) -> Option<String> {
    DateTime::from_timestamp_millis(ts).map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}
