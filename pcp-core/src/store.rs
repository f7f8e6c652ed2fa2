//! Data-access seams
//!
//! Every component that reads or writes production data does so through
//! these traits, so the same logic runs against the local SQLite
//! [`Database`](crate::db::Database), the hosted
//! [`RestStore`](crate::rest::RestStore), or a test double.
//!
//! Lookups return `Ok(None)` when the record is absent. `Err` is reserved
//! for the store itself failing.

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;
use crate::types::*;
use chrono::{DateTime, Utc};

/// Filter for session listings
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub machine_id: Option<String>,
    pub plate: Option<u32>,
    pub limit: Option<usize>,
}

impl SessionFilter {
    /// Sessions currently in progress, optionally for one machine
    pub fn in_progress(machine_id: Option<&str>) -> Self {
        Self {
            status: Some(SessionStatus::InProgress),
            machine_id: machine_id.map(str::to_string),
            ..Default::default()
        }
    }
}

/// Filter for stoppage listings
#[derive(Debug, Clone, Default)]
pub struct StoppageFilter {
    pub session_id: Option<String>,
    pub machine_id: Option<String>,
    /// Only stoppages that still have no end
    pub open_only: bool,
    /// Only stoppages justified with this reason
    pub reason_code: Option<String>,
    pub limit: Option<usize>,
}

pub trait SessionStore {
    fn get_session(&self, id: &str) -> Result<Option<ProductionSession>>;
    /// Newest first
    fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<ProductionSession>>;
    fn insert_session(&self, session: &ProductionSession) -> Result<()>;
    fn update_session(&self, session: &ProductionSession) -> Result<()>;
}

pub trait PulseStore {
    /// Most recent pulse of the session by cycle timestamp
    fn latest_pulse(&self, session_id: &str) -> Result<Option<ProductionPulse>>;
    /// Returns `false` when a pulse with the same `external_id` already exists
    fn insert_pulse(&self, pulse: &ProductionPulse) -> Result<bool>;
    fn total_pieces(&self, session_id: &str) -> Result<i64>;
}

pub trait StoppageStore {
    /// The unresolved stoppage of the session, if any
    fn open_stoppage(&self, session_id: &str) -> Result<Option<MachineStoppage>>;
    fn get_stoppage(&self, id: &str) -> Result<Option<MachineStoppage>>;
    /// Newest first
    fn list_stoppages(&self, filter: &StoppageFilter) -> Result<Vec<MachineStoppage>>;
    /// Fails with [`Error::StoppageAlreadyOpen`](crate::Error::StoppageAlreadyOpen)
    /// when inserting an open stoppage for a session that already has one.
    fn insert_stoppage(&self, stoppage: &MachineStoppage) -> Result<()>;
    fn update_stoppage(&self, stoppage: &MachineStoppage) -> Result<()>;
}

pub trait ProductCatalog {
    fn product(&self, code: &str) -> Result<Option<ProductReference>>;

    /// Ideal cycle time for `code`, or `default` when the catalog has none.
    /// A zero cycle time counts as none.
    fn ideal_cycle_secs(&self, code: &str, default: u32) -> Result<u32> {
        Ok(self
            .product(code)?
            .and_then(|p| p.ideal_cycle_secs)
            .filter(|secs| *secs > 0)
            .unwrap_or(default))
    }

    fn upsert_product(&self, product: &ProductReference) -> Result<()>;
}

pub trait MachineStore {
    fn machine_by_number(&self, number: &str) -> Result<Option<Machine>>;
    fn list_machines(&self) -> Result<Vec<Machine>>;
    fn upsert_machine(&self, machine: &Machine) -> Result<()>;
}

pub trait ReasonStore {
    fn get_reason(&self, code: &str) -> Result<Option<StoppageReason>>;
    /// Ordered by code
    fn list_reasons(&self) -> Result<Vec<StoppageReason>>;
    fn insert_reason(&self, reason: &StoppageReason) -> Result<()>;
    fn update_reason(&self, reason: &StoppageReason) -> Result<()>;
    /// Returns `false` when no reason has that code
    fn delete_reason(&self, code: &str) -> Result<bool>;
}

pub trait ExportQueue {
    /// Fails with [`Error::ExportAlreadyQueued`](crate::Error::ExportAlreadyQueued)
    /// when the session already has a record.
    fn enqueue_export(&self, record: &ExportRecord) -> Result<()>;
    fn export_for_session(&self, session_id: &str) -> Result<Option<ExportRecord>>;
    /// Oldest first
    fn list_exports(&self, status: Option<ExportStatus>) -> Result<Vec<ExportRecord>>;
}

/// Checkpoint of the legacy pulse feed
pub trait SyncStateStore {
    fn last_legacy_id(&self) -> Result<i64>;
    fn set_last_legacy_id(&self, id: i64, synced_at: DateTime<Utc>) -> Result<()>;
}

/// Everything a production backend provides.
pub trait Store:
    SessionStore
    + PulseStore
    + StoppageStore
    + ProductCatalog
    + MachineStore
    + ReasonStore
    + ExportQueue
    + SyncStateStore
{
    /// Short name for logs
    fn backend_name(&self) -> &'static str;
}

/// Open the backend selected in configuration.
pub fn open_store(config: &StoreConfig) -> Result<Box<dyn Store>> {
    config.validate()?;
    match config.backend {
        StoreBackend::Sqlite => {
            let path = config.resolved_database_path();
            tracing::info!(path = %path.display(), "Opening SQLite store");
            let db = crate::db::Database::open(&path)?;
            db.migrate()?;
            Ok(Box::new(db))
        }
        StoreBackend::Rest => {
            let store = crate::rest::RestStore::new(config)?;
            tracing::info!(url = %store.base_url(), schema = %config.schema, "Using REST store");
            Ok(Box::new(store))
        }
    }
}

// ============================================
// Clock
// ============================================

/// Source of "now".
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
