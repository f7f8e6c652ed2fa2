//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.
//! Timestamps are stored as RFC 3339 UTC strings with millisecond precision,
//! so lexical order equals chronological order.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: production tables
    r#"
    CREATE TABLE IF NOT EXISTS machines (
        id               TEXT PRIMARY KEY,
        number           TEXT NOT NULL UNIQUE,
        name             TEXT
    );

    CREATE TABLE IF NOT EXISTS products (
        code             TEXT PRIMARY KEY,
        description      TEXT,
        ideal_cycle_secs INTEGER,
        cavities         INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS sessions (
        id               TEXT PRIMARY KEY,
        machine_id       TEXT NOT NULL,
        product_code     TEXT NOT NULL,
        plate            INTEGER NOT NULL DEFAULT 1,
        operator_id      TEXT NOT NULL,
        status           TEXT NOT NULL,
        started_at       DATETIME NOT NULL,
        ended_at         DATETIME,
        scrap_count      INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS pulses (
        id               TEXT PRIMARY KEY,
        session_id       TEXT NOT NULL REFERENCES sessions(id),
        external_id      TEXT NOT NULL UNIQUE,
        cycle_at         DATETIME NOT NULL,
        piece_count      INTEGER NOT NULL,
        interval_secs    INTEGER
    );

    CREATE TABLE IF NOT EXISTS stoppages (
        id               TEXT PRIMARY KEY,
        session_id       TEXT NOT NULL REFERENCES sessions(id),
        machine_id       TEXT NOT NULL,
        started_at       DATETIME NOT NULL,
        ended_at         DATETIME,
        justified        INTEGER NOT NULL DEFAULT 0,
        reason_code      TEXT,
        classification   TEXT NOT NULL,
        created_at       DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS stoppage_reasons (
        code             TEXT PRIMARY KEY,
        description      TEXT NOT NULL,
        active           INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS exports (
        id               TEXT PRIMARY KEY,
        session_id       TEXT NOT NULL REFERENCES sessions(id),
        item_code        TEXT,
        total_quantity   INTEGER NOT NULL,
        status           TEXT NOT NULL,
        created_at       DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sync_state (
        id               INTEGER PRIMARY KEY CHECK (id = 1),
        last_legacy_id   INTEGER NOT NULL DEFAULT 0,
        synced_at        DATETIME
    );

    INSERT OR IGNORE INTO sync_state (id, last_legacy_id) VALUES (1, 0);

    CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status, machine_id);
    CREATE INDEX IF NOT EXISTS idx_pulses_session_cycle ON pulses(session_id, cycle_at DESC);
    CREATE INDEX IF NOT EXISTS idx_stoppages_session ON stoppages(session_id);
    CREATE INDEX IF NOT EXISTS idx_exports_status ON exports(status);
    "#,
    // Version 2: enforce the one-open-stoppage and one-session-per-plate rules
    // in the store so concurrent writers get a rejected insert instead of a
    // duplicate.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_stoppages_one_open
        ON stoppages(session_id) WHERE ended_at IS NULL;

    CREATE UNIQUE INDEX IF NOT EXISTS uq_sessions_one_active_per_plate
        ON sessions(machine_id, plate) WHERE status = 'in_progress';
    "#,
    // Version 3: a finished session is exported once
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_exports_one_per_session ON exports(session_id);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}
