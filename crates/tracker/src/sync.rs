use serde_json::Value;
use tracing::warn;

pub const SESSIONS_TABLE: &str = "Sessions";
pub const SITE_VISITS_TABLE: &str = "Site Visits";

/// Remote table the lifecycle mirrors records into. Calls are fire-and-forget.
pub trait RecordSync {
    fn create_record(&self, table: &str, fields: Value) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSync;

impl RecordSync for NoopSync {
    fn create_record(&self, _table: &str, _fields: Value) -> anyhow::Result<()> {
        Ok(())
    }
}

pub(crate) fn push_best_effort(sync: &impl RecordSync, table: &str, fields: Value) {
    if let Err(e) = sync.create_record(table, fields) {
        warn!(table, error = %e, "remote sync failed");
    }
}
