use chrono::{Days, NaiveDate};
use core_model::{SettingsRecord, parse_day};

/// Settings after a session finishes on `today`: same day keeps the streak,
/// the following day extends it, anything else starts over at 1.
pub fn advance_streak(settings: &SettingsRecord, today: NaiveDate) -> SettingsRecord {
    let last = settings.last_session_date.as_deref().and_then(parse_day);
    let streak = match last {
        Some(day) if day == today => settings.streak.max(1),
        Some(day) if Some(day) == today.checked_sub_days(Days::new(1)) => {
            settings.streak.saturating_add(1)
        }
        _ => 1,
    };
    SettingsRecord {
        streak,
        last_session_date: Some(today.format("%Y-%m-%d").to_string()),
    }
}

/// The streak as shown on `today`; it lapses to 0 once a full day is missed.
pub fn effective_streak(settings: &SettingsRecord, today: NaiveDate) -> u32 {
    let Some(last) = settings.last_session_date.as_deref().and_then(parse_day) else {
        return settings.streak;
    };
    match today.checked_sub_days(Days::new(1)) {
        Some(yesterday) if last < yesterday => 0,
        _ => settings.streak,
    }
}
