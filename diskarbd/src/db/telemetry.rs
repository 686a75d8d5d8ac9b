//! Telemetry record types and their `Auditable` insertions: one plain
//! struct per recorded fact, one `INSERT` per struct, errors logged and
//! swallowed rather than propagated — a failed audit write must never
//! abort arbitration.

use log::error;
use rusqlite::{params, Connection};
use shared::traits::Auditable;

/// A disk lifecycle fact: appeared, claimed, probed, mounted, etc.
pub struct DiskEvent<'a> {
    pub disk_id: &'a str,
    pub unit_id: Option<&'a str>,
    pub event: &'a str,
    pub detail: &'a str,
}

impl Auditable for DiskEvent<'_> {
    fn record(&self, conn: &Connection) {
        conn.execute(
            "INSERT INTO disk_event (disk_id, unit_id, event, detail) VALUES (?1, ?2, ?3, ?4)",
            params![self.disk_id, self.unit_id, self.event, self.detail],
        )
        .inspect_err(|e| error!("telemetry: failed to record disk_event ({}): {e}", self.event))
        .ok();
    }
}

/// A unit-level fact: first disk, last disk, eligibility changes.
pub struct UnitEvent<'a> {
    pub unit_id: &'a str,
    pub event: &'a str,
    pub detail: &'a str,
}

impl Auditable for UnitEvent<'_> {
    fn record(&self, conn: &Connection) {
        conn.execute(
            "INSERT INTO unit_event (unit_id, event, detail) VALUES (?1, ?2, ?3)",
            params![self.unit_id, self.event, self.detail],
        )
        .inspect_err(|e| error!("telemetry: failed to record unit_event ({}): {e}", self.event))
        .ok();
    }
}

/// A session lifecycle fact: connected, disconnected, registered a
/// callback, was dropped for a stalled queue.
pub struct SessionEvent<'a> {
    pub session_id: &'a str,
    pub pid: Option<i64>,
    pub event: &'a str,
    pub detail: &'a str,
}

impl Auditable for SessionEvent<'_> {
    fn record(&self, conn: &Connection) {
        conn.execute(
            "INSERT INTO session_event (session_id, pid, event, detail) VALUES (?1, ?2, ?3, ?4)",
            params![self.session_id, self.pid, self.event, self.detail],
        )
        .inspect_err(|e| error!("telemetry: failed to record session_event ({}): {e}", self.event))
        .ok();
    }
}

/// A client-issued request's lifecycle: issued, completed, rejected.
pub struct RequestEvent<'a> {
    pub request_id: &'a str,
    pub disk_id: Option<&'a str>,
    pub kind: &'a str,
    pub status: Option<&'a str>,
    pub detail: &'a str,
}

impl Auditable for RequestEvent<'_> {
    fn record(&self, conn: &Connection) {
        conn.execute(
            "INSERT INTO request_event (request_id, disk_id, kind, status, detail) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![self.request_id, self.disk_id, self.kind, self.status, self.detail],
        )
        .inspect_err(|e| error!("telemetry: failed to record request_event ({}): {e}", self.kind))
        .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::init_database;

    #[test]
    fn disk_event_round_trips_through_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DatabaseConfig {
            path: "telemetry.db".into(),
            purge_on_restart: false,
            synchronous: "NORMAL".into(),
            journal_size_limit: 1_000_000,
        };
        let conn = init_database(dir.path(), &cfg).unwrap();

        DiskEvent {
            disk_id: "disk2",
            unit_id: Some("disk2"),
            event: "appeared",
            detail: "",
        }
        .record(&conn);

        let stored: String = conn
            .query_row("SELECT event FROM disk_event WHERE disk_id = 'disk2'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(stored, "appeared");
    }
}
