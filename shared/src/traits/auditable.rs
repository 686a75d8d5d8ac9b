use rusqlite::Connection;

/// Implemented by lifecycle events that get written to the telemetry
/// database: diagnostic/audit records, not the daemon's primary event
/// stream or anything it depends on for correctness.
pub trait Auditable {
    fn record(&self, conn: &Connection);
}
