pub mod integrity;
pub mod retention;

pub use integrity::{
    INVALID_SESSION, Issue, UNREADABLE_SESSIONS, repair_invalid, validate_data, validate_sessions,
};
pub use retention::{CleanupReport, RetentionPolicy, SESSION_RETENTION_CAP, cleanup};
