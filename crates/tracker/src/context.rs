use std::collections::BTreeMap;

use core_model::{SessionRecord, Timestamp, day_string};

use crate::milestones::MilestoneTracker;

/// Site name that absorbs time spent outside the browser.
pub const OTHER_APPS: &str = "other_apps";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSession {
    pub session_id: String,
    pub start_time: Timestamp,
    pub distractions: u32,
}

/// Everything the lifecycle knows about the session in progress. Owned by a
/// single `SessionTracker`; nothing here is global.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub(crate) active: Option<ActiveSession>,
    pub(crate) site_visits: BTreeMap<String, u64>,
    pub(crate) current_site: Option<(String, Timestamp)>,
    pub(crate) milestones: MilestoneTracker,
    pub(crate) last_start: Option<Timestamp>,
}

impl SessionContext {
    pub fn active(&self) -> Option<&ActiveSession> {
        self.active.as_ref()
    }

    pub fn site_visits(&self) -> &BTreeMap<String, u64> {
        &self.site_visits
    }

    pub fn current_site(&self) -> Option<&str> {
        self.current_site.as_ref().map(|(site, _)| site.as_str())
    }

    pub fn milestones(&self) -> &MilestoneTracker {
        &self.milestones
    }

    /// Start times handed out are strictly increasing, so two sessions never
    /// share a primary key even if the clock stalls or steps back.
    pub(crate) fn next_start(&self, now: Timestamp) -> Timestamp {
        match self.last_start {
            Some(last) if now <= last => last + 1,
            _ => now,
        }
    }

    pub(crate) fn add_site_time(&mut self, site: &str, ms: u64) {
        *self.site_visits.entry(site.to_string()).or_insert(0) += ms;
    }

    /// Credits the current site with the time since it became current and
    /// restarts its clock at `now`. Returns the credited milliseconds.
    pub(crate) fn flush_current(&mut self, now: Timestamp) -> u64 {
        let Some((site, since)) = self.current_site.take() else {
            return 0;
        };
        let elapsed = u64::try_from(now.saturating_sub(since)).unwrap_or(0);
        if elapsed > 0 {
            self.add_site_time(&site, elapsed);
        }
        self.current_site = Some((site, now));
        elapsed
    }

    /// The in-progress record as it should be persisted right now.
    pub(crate) fn snapshot(&self) -> Option<SessionRecord> {
        let active = self.active.as_ref()?;
        Some(SessionRecord {
            start_time: Some(active.start_time),
            end_time: None,
            duration: None,
            distractions: active.distractions,
            site_visits: self.site_visits.clone(),
            date: day_string(active.start_time),
            session_id: Some(active.session_id.clone()),
        })
    }

    pub(crate) fn begin(&mut self, active: ActiveSession) {
        self.last_start = Some(active.start_time);
        self.active = Some(active);
        self.site_visits.clear();
        self.current_site = None;
        self.milestones.reset();
    }

    pub(crate) fn clear_session(&mut self) {
        self.active = None;
        self.site_visits.clear();
        self.current_site = None;
        self.milestones.reset();
    }
}
