//! Opening and initializing the diagnostic SQLite database.
//!
//! Diagnostic-only: it stores a history of what happened, never state the
//! daemon depends on to function, so its schema is applied once and the
//! connection runs WAL mode with tuned `synchronous`/`journal_size_limit`
//! pragmas rather than anything stricter.

use crate::config::DatabaseConfig;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn open_db_connection(path: &Path, cfg: &DatabaseConfig) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(1_000))?;
    conn.pragma_update(None, "journal_mode", &"WAL")?;
    conn.pragma_update(None, "synchronous", &cfg.synchronous.as_str())?;
    Ok(conn)
}

/// Opens (creating if needed) the telemetry database, applies pragmas, and
/// on first run (or when `purge_on_restart` is set) applies `schema.sql`.
pub fn init_database(base_dir: &Path, cfg: &DatabaseConfig) -> Result<Connection, rusqlite::Error> {
    let path: PathBuf = base_dir.join(&cfg.path);

    if cfg.purge_on_restart && path.exists() {
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }

    let first_run = !path.exists();
    let conn = open_db_connection(&path, cfg)?;
    conn.pragma_update(None, "journal_size_limit", &(cfg.journal_size_limit as i64))?;

    if first_run {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
    }

    Ok(conn)
}
