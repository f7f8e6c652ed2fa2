//! Database repository layer
//!
//! Implements the [`store`](crate::store) traits on top of SQLite.

use crate::error::{Error, Result};
use crate::store::*;
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Database handle (single connection behind a mutex)
pub struct Database {
    conn: Mutex<Connection>,
}

/// Formats a timestamp the way every table stores it.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn get_ts(row: &Row, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(col)?;
    parse_ts(&raw)
}

fn get_opt_ts(row: &Row, col: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    raw.as_deref().map(parse_ts).transpose()
}

fn get_enum<T: std::str::FromStr<Err = String>>(row: &Row, col: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(col)?;
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn limit_clause(limit: Option<usize>) -> String {
    limit.map(|n| format!(" LIMIT {}", n)).unwrap_or_default()
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<ProductionSession> {
        Ok(ProductionSession {
            id: row.get("id")?,
            machine_id: row.get("machine_id")?,
            product_code: row.get("product_code")?,
            plate: row.get("plate")?,
            operator_id: row.get("operator_id")?,
            status: get_enum(row, "status")?,
            started_at: get_ts(row, "started_at")?,
            ended_at: get_opt_ts(row, "ended_at")?,
            scrap_count: row.get("scrap_count")?,
        })
    }

    fn row_to_pulse(row: &Row) -> rusqlite::Result<ProductionPulse> {
        Ok(ProductionPulse {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            external_id: row.get("external_id")?,
            cycle_at: get_ts(row, "cycle_at")?,
            piece_count: row.get("piece_count")?,
            interval_secs: row.get("interval_secs")?,
        })
    }

    fn row_to_stoppage(row: &Row) -> rusqlite::Result<MachineStoppage> {
        Ok(MachineStoppage {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            machine_id: row.get("machine_id")?,
            started_at: get_ts(row, "started_at")?,
            ended_at: get_opt_ts(row, "ended_at")?,
            justified: row.get("justified")?,
            reason_code: row.get("reason_code")?,
            classification: get_enum(row, "classification")?,
            created_at: get_ts(row, "created_at")?,
        })
    }

    fn row_to_product(row: &Row) -> rusqlite::Result<ProductReference> {
        Ok(ProductReference {
            code: row.get("code")?,
            description: row.get("description")?,
            ideal_cycle_secs: row.get("ideal_cycle_secs")?,
            cavities: row.get("cavities")?,
        })
    }

    fn row_to_machine(row: &Row) -> rusqlite::Result<Machine> {
        Ok(Machine {
            id: row.get("id")?,
            number: row.get("number")?,
            name: row.get("name")?,
        })
    }

    fn row_to_reason(row: &Row) -> rusqlite::Result<StoppageReason> {
        Ok(StoppageReason {
            code: row.get("code")?,
            description: row.get("description")?,
            active: row.get("active")?,
        })
    }

    fn row_to_export(row: &Row) -> rusqlite::Result<ExportRecord> {
        Ok(ExportRecord {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            item_code: row.get("item_code")?,
            total_quantity: row.get("total_quantity")?,
            status: get_enum(row, "status")?,
            created_at: get_ts(row, "created_at")?,
        })
    }
}

// ============================================
// Session operations
// ============================================

impl SessionStore for Database {
    fn get_session(&self, id: &str) -> Result<Option<ProductionSession>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM sessions WHERE id = ?",
            [id],
            Self::row_to_session,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<ProductionSession>> {
        let mut sql = String::from("SELECT * FROM sessions WHERE 1=1");
        let mut values: Vec<Value> = Vec::new();

        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(ref machine_id) = filter.machine_id {
            sql.push_str(" AND machine_id = ?");
            values.push(Value::Text(machine_id.clone()));
        }
        if let Some(plate) = filter.plate {
            sql.push_str(" AND plate = ?");
            values.push(Value::Integer(i64::from(plate)));
        }
        sql.push_str(" ORDER BY started_at DESC");
        sql.push_str(&limit_clause(filter.limit));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let sessions = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    fn insert_session(&self, session: &ProductionSession) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO sessions (id, machine_id, product_code, plate, operator_id,
                                  status, started_at, ended_at, scrap_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                session.id,
                session.machine_id,
                session.product_code,
                session.plate,
                session.operator_id,
                session.status.as_str(),
                ts(session.started_at),
                session.ended_at.map(ts),
                session.scrap_count,
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) && session.is_in_progress() {
                Error::SessionAlreadyActive {
                    machine_id: session.machine_id.clone(),
                    plate: session.plate,
                }
            } else {
                Error::from(e)
            }
        })?;
        Ok(())
    }

    fn update_session(&self, session: &ProductionSession) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            UPDATE sessions SET
                product_code = ?2,
                operator_id = ?3,
                status = ?4,
                ended_at = ?5,
                scrap_count = ?6
            WHERE id = ?1
            "#,
            params![
                session.id,
                session.product_code,
                session.operator_id,
                session.status.as_str(),
                session.ended_at.map(ts),
                session.scrap_count,
            ],
        )?;
        if changed == 0 {
            return Err(Error::SessionNotFound(session.id.clone()));
        }
        Ok(())
    }
}

// ============================================
// Pulse operations
// ============================================

impl PulseStore for Database {
    fn latest_pulse(&self, session_id: &str) -> Result<Option<ProductionPulse>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM pulses WHERE session_id = ? ORDER BY cycle_at DESC LIMIT 1",
            [session_id],
            Self::row_to_pulse,
        )
        .optional()
        .map_err(Error::from)
    }

    fn insert_pulse(&self, pulse: &ProductionPulse) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            r#"
            INSERT INTO pulses (id, session_id, external_id, cycle_at, piece_count, interval_secs)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(external_id) DO NOTHING
            "#,
            params![
                pulse.id,
                pulse.session_id,
                pulse.external_id,
                ts(pulse.cycle_at),
                pulse.piece_count,
                pulse.interval_secs,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn total_pieces(&self, session_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(piece_count), 0) FROM pulses WHERE session_id = ?",
            [session_id],
            |r| r.get(0),
        )?;
        Ok(total)
    }
}

// ============================================
// Stoppage operations
// ============================================

impl StoppageStore for Database {
    fn open_stoppage(&self, session_id: &str) -> Result<Option<MachineStoppage>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM stoppages WHERE session_id = ? AND ended_at IS NULL LIMIT 1",
            [session_id],
            Self::row_to_stoppage,
        )
        .optional()
        .map_err(Error::from)
    }

    fn get_stoppage(&self, id: &str) -> Result<Option<MachineStoppage>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM stoppages WHERE id = ?",
            [id],
            Self::row_to_stoppage,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_stoppages(&self, filter: &StoppageFilter) -> Result<Vec<MachineStoppage>> {
        let mut sql = String::from("SELECT * FROM stoppages WHERE 1=1");
        let mut values: Vec<Value> = Vec::new();

        if let Some(ref session_id) = filter.session_id {
            sql.push_str(" AND session_id = ?");
            values.push(Value::Text(session_id.clone()));
        }
        if let Some(ref machine_id) = filter.machine_id {
            sql.push_str(" AND machine_id = ?");
            values.push(Value::Text(machine_id.clone()));
        }
        if filter.open_only {
            sql.push_str(" AND ended_at IS NULL");
        }
        if let Some(ref reason_code) = filter.reason_code {
            sql.push_str(" AND reason_code = ?");
            values.push(Value::Text(reason_code.clone()));
        }
        sql.push_str(" ORDER BY started_at DESC");
        sql.push_str(&limit_clause(filter.limit));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let stoppages = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_stoppage)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stoppages)
    }

    fn insert_stoppage(&self, stoppage: &MachineStoppage) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO stoppages (id, session_id, machine_id, started_at, ended_at,
                                   justified, reason_code, classification, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                stoppage.id,
                stoppage.session_id,
                stoppage.machine_id,
                ts(stoppage.started_at),
                stoppage.ended_at.map(ts),
                stoppage.justified,
                stoppage.reason_code,
                stoppage.classification.as_str(),
                ts(stoppage.created_at),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) && stoppage.is_open() {
                Error::StoppageAlreadyOpen(stoppage.session_id.clone())
            } else {
                Error::from(e)
            }
        })?;
        Ok(())
    }

    fn update_stoppage(&self, stoppage: &MachineStoppage) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            UPDATE stoppages SET
                ended_at = ?2,
                justified = ?3,
                reason_code = ?4,
                classification = ?5
            WHERE id = ?1
            "#,
            params![
                stoppage.id,
                stoppage.ended_at.map(ts),
                stoppage.justified,
                stoppage.reason_code,
                stoppage.classification.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(Error::StoppageNotFound(stoppage.id.clone()));
        }
        Ok(())
    }
}

// ============================================
// Catalog operations
// ============================================

impl ProductCatalog for Database {
    fn product(&self, code: &str) -> Result<Option<ProductReference>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM products WHERE code = ?",
            [code],
            Self::row_to_product,
        )
        .optional()
        .map_err(Error::from)
    }

    fn upsert_product(&self, product: &ProductReference) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO products (code, description, ideal_cycle_secs, cavities)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(code) DO UPDATE SET
                description = excluded.description,
                ideal_cycle_secs = excluded.ideal_cycle_secs,
                cavities = excluded.cavities
            "#,
            params![
                product.code,
                product.description,
                product.ideal_cycle_secs,
                product.cavities,
            ],
        )?;
        Ok(())
    }
}

impl MachineStore for Database {
    fn machine_by_number(&self, number: &str) -> Result<Option<Machine>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM machines WHERE number = ?",
            [number],
            Self::row_to_machine,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_machines(&self) -> Result<Vec<Machine>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM machines ORDER BY number")?;
        let machines = stmt
            .query_map([], Self::row_to_machine)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(machines)
    }

    fn upsert_machine(&self, machine: &Machine) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO machines (id, number, name)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                number = excluded.number,
                name = excluded.name
            "#,
            params![machine.id, machine.number, machine.name],
        )?;
        Ok(())
    }
}

impl ReasonStore for Database {
    fn get_reason(&self, code: &str) -> Result<Option<StoppageReason>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM stoppage_reasons WHERE code = ?",
            [code],
            Self::row_to_reason,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_reasons(&self) -> Result<Vec<StoppageReason>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM stoppage_reasons ORDER BY code")?;
        let reasons = stmt
            .query_map([], Self::row_to_reason)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(reasons)
    }

    fn insert_reason(&self, reason: &StoppageReason) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO stoppage_reasons (code, description, active) VALUES (?1, ?2, ?3)",
            params![reason.code, reason.description, reason.active],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::InvalidInput(format!("reason {} already exists", reason.code))
            } else {
                Error::from(e)
            }
        })?;
        Ok(())
    }

    fn update_reason(&self, reason: &StoppageReason) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE stoppage_reasons SET description = ?2, active = ?3 WHERE code = ?1",
            params![reason.code, reason.description, reason.active],
        )?;
        if changed == 0 {
            return Err(Error::ReasonNotFound(reason.code.clone()));
        }
        Ok(())
    }

    fn delete_reason(&self, code: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM stoppage_reasons WHERE code = ?", [code])?;
        Ok(deleted > 0)
    }
}

// ============================================
// Export queue and sync state
// ============================================

impl ExportQueue for Database {
    fn enqueue_export(&self, record: &ExportRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO exports (id, session_id, item_code, total_quantity, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.id,
                record.session_id,
                record.item_code,
                record.total_quantity,
                record.status.as_str(),
                ts(record.created_at),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::ExportAlreadyQueued(record.session_id.clone())
            } else {
                Error::from(e)
            }
        })?;
        Ok(())
    }

    fn export_for_session(&self, session_id: &str) -> Result<Option<ExportRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM exports WHERE session_id = ?",
            [session_id],
            Self::row_to_export,
        )
        .optional()
        .map_err(Error::from)
    }

    fn list_exports(&self, status: Option<ExportStatus>) -> Result<Vec<ExportRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM exports WHERE (?1 IS NULL OR status = ?1) ORDER BY created_at ASC",
        )?;
        let records = stmt
            .query_map([status.map(|s| s.as_str())], Self::row_to_export)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

impl SyncStateStore for Database {
    fn last_legacy_id(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let id: Option<i64> = conn
            .query_row(
                "SELECT last_legacy_id FROM sync_state WHERE id = 1",
                [],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id.unwrap_or(0))
    }

    fn set_last_legacy_id(&self, id: i64, synced_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO sync_state (id, last_legacy_id, synced_at) VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                last_legacy_id = excluded.last_legacy_id,
                synced_at = excluded.synced_at
            "#,
            params![id, ts(synced_at)],
        )?;
        Ok(())
    }
}

impl Store for Database {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn create_test_session(id: &str, plate: u32) -> ProductionSession {
        ProductionSession {
            id: id.to_string(),
            machine_id: "m-1".to_string(),
            product_code: "P-100".to_string(),
            plate,
            operator_id: "op-9".to_string(),
            status: SessionStatus::InProgress,
            started_at: t0(),
            ended_at: None,
            scrap_count: 0,
        }
    }

    fn create_test_pulse(session_id: &str, external_id: &str, offset_secs: i64) -> ProductionPulse {
        ProductionPulse {
            id: new_id(),
            session_id: session_id.to_string(),
            external_id: external_id.to_string(),
            cycle_at: t0() + chrono::Duration::seconds(offset_secs),
            piece_count: 2,
            interval_secs: None,
        }
    }

    #[test]
    fn test_session_round_trip() {
        let db = test_db();
        let session = create_test_session("s-1", 1);
        db.insert_session(&session).unwrap();

        let loaded = db.get_session("s-1").unwrap().unwrap();
        assert_eq!(loaded, session);
        assert!(db.get_session("missing").unwrap().is_none());
    }

    #[test]
    fn test_list_sessions_filters() {
        let db = test_db();
        db.insert_session(&create_test_session("s-1", 1)).unwrap();
        db.insert_session(&create_test_session("s-2", 2)).unwrap();

        let mut finished = create_test_session("s-3", 3);
        finished.status = SessionStatus::Finished;
        finished.ended_at = Some(t0() + chrono::Duration::hours(1));
        db.insert_session(&finished).unwrap();

        let active = db.list_sessions(&SessionFilter::in_progress(None)).unwrap();
        assert_eq!(active.len(), 2);

        let plate_two = db
            .list_sessions(&SessionFilter {
                plate: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(plate_two.len(), 1);
        assert_eq!(plate_two[0].id, "s-2");

        let other_machine = db
            .list_sessions(&SessionFilter::in_progress(Some("m-2")))
            .unwrap();
        assert!(other_machine.is_empty());
    }

    #[test]
    fn test_second_active_session_on_plate_rejected() {
        let db = test_db();
        db.insert_session(&create_test_session("s-1", 1)).unwrap();

        let err = db
            .insert_session(&create_test_session("s-2", 1))
            .unwrap_err();
        assert!(matches!(err, Error::SessionAlreadyActive { plate: 1, .. }));
    }

    #[test]
    fn test_update_missing_session() {
        let db = test_db();
        let err = db
            .update_session(&create_test_session("ghost", 1))
            .unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(id) if id == "ghost"));
    }

    #[test]
    fn test_latest_pulse_orders_by_cycle_time() {
        let db = test_db();
        db.insert_session(&create_test_session("s-1", 1)).unwrap();

        // Inserted out of order on purpose
        db.insert_pulse(&create_test_pulse("s-1", "10_p1", 120)).unwrap();
        db.insert_pulse(&create_test_pulse("s-1", "11_p1", 300)).unwrap();
        db.insert_pulse(&create_test_pulse("s-1", "9_p1", 60)).unwrap();

        let latest = db.latest_pulse("s-1").unwrap().unwrap();
        assert_eq!(latest.external_id, "11_p1");
        assert_eq!(db.total_pieces("s-1").unwrap(), 6);
        assert!(db.latest_pulse("s-2").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_pulse_ignored() {
        let db = test_db();
        db.insert_session(&create_test_session("s-1", 1)).unwrap();

        assert!(db.insert_pulse(&create_test_pulse("s-1", "42_p1", 10)).unwrap());
        assert!(!db.insert_pulse(&create_test_pulse("s-1", "42_p1", 10)).unwrap());
        assert_eq!(db.total_pieces("s-1").unwrap(), 2);
    }

    #[test]
    fn test_one_open_stoppage_per_session() {
        let db = test_db();
        let session = create_test_session("s-1", 1);
        db.insert_session(&session).unwrap();

        let first = MachineStoppage::detected(&session, t0(), t0());
        db.insert_stoppage(&first).unwrap();

        let second = MachineStoppage::detected(&session, t0(), t0());
        let err = db.insert_stoppage(&second).unwrap_err();
        assert!(matches!(err, Error::StoppageAlreadyOpen(id) if id == "s-1"));

        let open = db.open_stoppage("s-1").unwrap().unwrap();
        assert_eq!(open.id, first.id);

        let mut closed = open;
        closed.ended_at = Some(t0() + chrono::Duration::minutes(5));
        closed.justified = true;
        closed.reason_code = Some("SETUP".to_string());
        db.update_stoppage(&closed).unwrap();

        assert!(db.open_stoppage("s-1").unwrap().is_none());
        db.insert_stoppage(&second).unwrap();

        let all = db
            .list_stoppages(&StoppageFilter {
                session_id: Some("s-1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(all.len(), 2);

        let pending = db
            .list_stoppages(&StoppageFilter {
                open_only: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);

        let setup = db
            .list_stoppages(&StoppageFilter {
                reason_code: Some("SETUP".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(setup.len(), 1);
        assert_eq!(setup[0].id, first.id);
    }

    #[test]
    fn test_product_catalog_default() {
        let db = test_db();
        assert_eq!(db.ideal_cycle_secs("P-100", 300).unwrap(), 300);

        db.upsert_product(&ProductReference {
            code: "P-100".to_string(),
            description: Some("Gasket".to_string()),
            ideal_cycle_secs: Some(100),
            cavities: 4,
        })
        .unwrap();
        assert_eq!(db.ideal_cycle_secs("P-100", 300).unwrap(), 100);

        db.upsert_product(&ProductReference {
            code: "P-200".to_string(),
            description: None,
            ideal_cycle_secs: None,
            cavities: 1,
        })
        .unwrap();
        assert_eq!(db.ideal_cycle_secs("P-200", 300).unwrap(), 300);

        db.upsert_product(&ProductReference {
            code: "P-300".to_string(),
            description: None,
            ideal_cycle_secs: Some(0),
            cavities: 1,
        })
        .unwrap();
        assert_eq!(db.ideal_cycle_secs("P-300", 300).unwrap(), 300);
    }

    #[test]
    fn test_reasons_and_machines() {
        let db = test_db();
        db.insert_reason(&StoppageReason {
            code: "20".to_string(),
            description: "Mold change".to_string(),
            active: true,
        })
        .unwrap();
        db.insert_reason(&StoppageReason {
            code: "10".to_string(),
            description: "No material".to_string(),
            active: true,
        })
        .unwrap();

        let codes: Vec<_> = db
            .list_reasons()
            .unwrap()
            .into_iter()
            .map(|r| r.code)
            .collect();
        assert_eq!(codes, vec!["10", "20"]);
        assert!(db.delete_reason("20").unwrap());
        assert!(!db.delete_reason("20").unwrap());
        assert!(db.get_reason("20").unwrap().is_none());
        assert!(db
            .insert_reason(&StoppageReason {
                code: "10".to_string(),
                description: "dup".to_string(),
                active: true,
            })
            .is_err());

        db.upsert_machine(&Machine {
            id: "m-1".to_string(),
            number: "7".to_string(),
            name: Some("Press 7".to_string()),
        })
        .unwrap();
        assert_eq!(db.machine_by_number("7").unwrap().unwrap().id, "m-1");
        assert!(db.machine_by_number("8").unwrap().is_none());
    }

    #[test]
    fn test_sync_state_checkpoint() {
        let db = test_db();
        assert_eq!(db.last_legacy_id().unwrap(), 0);
        db.set_last_legacy_id(142, t0()).unwrap();
        assert_eq!(db.last_legacy_id().unwrap(), 142);
    }

    #[test]
    fn test_exports_filter_by_status() {
        let db = test_db();
        db.insert_session(&create_test_session("s-1", 1)).unwrap();
        db.enqueue_export(&ExportRecord {
            id: new_id(),
            session_id: "s-1".to_string(),
            item_code: Some("P-100".to_string()),
            total_quantity: 40,
            status: ExportStatus::Pending,
            created_at: t0(),
        })
        .unwrap();

        assert_eq!(db.list_exports(None).unwrap().len(), 1);
        assert_eq!(db.list_exports(Some(ExportStatus::Pending)).unwrap().len(), 1);
        assert!(db
            .list_exports(Some(ExportStatus::Imported))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_one_export_per_session() {
        let db = test_db();
        db.insert_session(&create_test_session("s-1", 1)).unwrap();
        let record = ExportRecord {
            id: new_id(),
            session_id: "s-1".to_string(),
            item_code: Some("P-100".to_string()),
            total_quantity: 40,
            status: ExportStatus::Pending,
            created_at: t0(),
        };
        db.enqueue_export(&record).unwrap();
        assert!(db.export_for_session("s-2").unwrap().is_none());
        assert_eq!(db.export_for_session("s-1").unwrap(), Some(record.clone()));

        let again = ExportRecord {
            id: new_id(),
            ..record
        };
        assert!(matches!(
            db.enqueue_export(&again),
            Err(Error::ExportAlreadyQueued(id)) if id == "s-1"
        ));
        assert_eq!(db.list_exports(None).unwrap().len(), 1);
    }
}
