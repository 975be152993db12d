//! Database setup and schema migrations for the trace store.
//!
//! Migrations are tracked through SQLite's `user_version` pragma via
//! `rusqlite_migration` and embedded at compile time. The trace schema is
//! append-only (definitions and invocations are never updated in place),
//! so migrations only ever add tables, columns, or indexes.

use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};

use crate::error::StorageError;

/// Trace schema migrations, oldest first.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // lmps / invocations / invocation_contents + call-graph edge tables.
        M::up(include_str!("migrations/001_initial_schema.sql")),
    ])
}

/// Opens (or creates) the trace database at `path`, configured and with
/// all pending migrations applied.
pub fn open_database(path: &str) -> Result<Connection, StorageError> {
    let mut conn = Connection::open(path)?;
    configure_and_migrate(&mut conn)?;
    Ok(conn)
}

/// Opens an in-memory trace database (for testing).
pub fn open_in_memory() -> Result<Connection, StorageError> {
    let mut conn = Connection::open_in_memory()?;
    configure_and_migrate(&mut conn)?;
    Ok(conn)
}

fn configure_and_migrate(conn: &mut Connection) -> Result<(), StorageError> {
    // Trace writes are append-mostly and serialized by the engine's write
    // gate; WAL lets readers proceed while an invocation commits.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    // NORMAL is durable enough under WAL. Losing the tail of a trace on
    // power failure is acceptable; corrupting it is not.
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    // The invocation -> lmp ownership edge relies on FK enforcement,
    // which SQLite leaves off by default.
    conn.pragma_update(None, "foreign_keys", "ON")?;

    migrations()
        .to_latest(conn)
        .map_err(|e| StorageError::Migration(e.to_string()))?;

    Ok(())
}
