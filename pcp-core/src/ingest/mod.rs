//! Pulse ingestion from the line controller
//!
//! Copies new controller cycles into the production store as pulses.
//!
//! ```text
//! ┌──────────────────┐     ┌────────────────┐     ┌──────────────────┐
//! │ Legacy pulse feed│ ──► │ PulseIngestor  │ ──► │  Store           │
//! │ (prensavulc)     │     │  gap check     │     │  pulses          │
//! └──────────────────┘     │  fan-out/plate │     │  stoppages       │
//!                          └────────────────┘     │  sync_state      │
//!                                                 └──────────────────┘
//! ```
//!
//! One controller cycle produces one pulse for every session in progress on
//! the machine (one per plate). The external id `"{legacy_id}_p{plate}"`
//! keeps re-reads idempotent. The checkpoint advances only past rows that
//! were fully processed, or that were malformed and can never be.

mod legacy;
#[cfg(feature = "mysql")]
mod mysql;

pub use legacy::{LegacyBatch, LegacyPulse, LegacyPulseFeed, LegacySource, SqliteLegacyFeed};
#[cfg(feature = "mysql")]
pub use mysql::MySqlLegacyFeed;

use crate::error::Result;
use crate::store::{
    Clock, MachineStore, ProductCatalog, PulseStore, SessionFilter, SessionStore, StoppageStore,
    SyncStateStore,
};
use crate::types::{new_id, ProductionPulse, ProductionSession};
use crate::watchdog::open_stoppage_once;

/// Thresholds for the gap check run while ingesting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IngestPolicy {
    /// Cycle time assumed when the product has no reference
    pub default_cycle_secs: u32,
    /// An interval longer than `ideal × gap_multiplier` opens a stoppage
    pub gap_multiplier: f64,
}

impl Default for IngestPolicy {
    fn default() -> Self {
        Self {
            default_cycle_secs: 300,
            gap_multiplier: 1.0,
        }
    }
}

/// Result of one ingestion pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestReport {
    /// Controller rows read from the feed
    pub rows_read: usize,
    /// Rows skipped because they could not be parsed
    pub rows_malformed: usize,
    pub pulses_inserted: usize,
    /// Pulses already present under the same external id
    pub duplicates: usize,
    /// Rows for machines that are unknown or have no session in progress
    pub rows_skipped: usize,
    pub stoppages_opened: usize,
    /// Checkpoint after the pass
    pub last_id: i64,
}

/// Copies controller pulses into the store.
pub struct PulseIngestor<'a, S: ?Sized, F: ?Sized> {
    store: &'a S,
    feed: &'a F,
    clock: &'a dyn Clock,
    policy: IngestPolicy,
}

impl<'a, S, F> PulseIngestor<'a, S, F>
where
    S: SessionStore
        + PulseStore
        + StoppageStore
        + ProductCatalog
        + MachineStore
        + SyncStateStore
        + ?Sized,
    F: LegacyPulseFeed + ?Sized,
{
    pub fn new(store: &'a S, feed: &'a F, clock: &'a dyn Clock, policy: IngestPolicy) -> Self {
        Self {
            store,
            feed,
            clock,
            policy,
        }
    }

    /// Ingest every controller row after the stored checkpoint.
    ///
    /// On failure the checkpoint is still advanced past the rows processed
    /// before the error, then the error is returned.
    pub fn sync_once(&self) -> Result<IngestReport> {
        let last_id = self.store.last_legacy_id()?;
        let batch = self.feed.pulses_after(last_id)?;

        let mut report = IngestReport {
            rows_read: batch.len(),
            rows_malformed: batch.malformed.len(),
            last_id,
            ..Default::default()
        };
        if batch.is_empty() {
            return Ok(report);
        }

        tracing::info!(count = batch.len(), after_id = last_id, "New controller pulses");

        let mut malformed = batch.malformed.iter().copied().peekable();
        let result = batch.pulses.iter().try_for_each(|row| {
            while let Some(id) = malformed.next_if(|id| *id < row.id) {
                report.last_id = report.last_id.max(id);
            }
            self.ingest_row(row, &mut report)
        });
        if result.is_ok() {
            for id in malformed {
                report.last_id = report.last_id.max(id);
            }
        }

        if report.last_id > last_id {
            self.store
                .set_last_legacy_id(report.last_id, self.clock.now())?;
            tracing::info!(last_id = report.last_id, "Checkpoint advanced");
        }

        result.map(|_| report)
    }

    fn ingest_row(&self, row: &LegacyPulse, report: &mut IngestReport) -> Result<()> {
        let sessions = match self.store.machine_by_number(&row.machine_number)? {
            Some(machine) => self
                .store
                .list_sessions(&SessionFilter::in_progress(Some(&machine.id)))?,
            None => {
                tracing::debug!(
                    legacy_id = row.id,
                    machine_number = %row.machine_number,
                    "Pulse for unknown machine"
                );
                Vec::new()
            }
        };

        if sessions.is_empty() {
            report.rows_skipped += 1;
        }
        for session in &sessions {
            self.ingest_for_session(row, session, report)?;
        }

        report.last_id = report.last_id.max(row.id);
        Ok(())
    }

    fn ingest_for_session(
        &self,
        row: &LegacyPulse,
        session: &ProductionSession,
        report: &mut IngestReport,
    ) -> Result<()> {
        let product = match self.store.product(&session.product_code) {
            Ok(product) => product,
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id,
                    product_code = %session.product_code,
                    error = %e,
                    "Product lookup failed, using defaults"
                );
                None
            }
        };
        let ideal = product
            .as_ref()
            .and_then(|p| p.ideal_cycle_secs)
            .filter(|secs| *secs > 0)
            .unwrap_or(self.policy.default_cycle_secs);
        let cavities = product.as_ref().map_or(1, |p| p.cavities.max(1));

        let previous = self.store.latest_pulse(&session.id)?;
        let interval_secs = previous.as_ref().map(|p| {
            let ms = row
                .recorded_at
                .signed_duration_since(p.cycle_at)
                .num_milliseconds();
            (ms as f64 / 1000.0).round() as i64
        });

        if let (Some(previous), Some(interval)) = (&previous, interval_secs) {
            let limit = f64::from(ideal) * self.policy.gap_multiplier;
            if interval as f64 > limit && self.store.open_stoppage(&session.id)?.is_none() {
                let (stoppage, created) =
                    open_stoppage_once(self.store, session, previous.cycle_at, self.clock.now())?;
                if created {
                    report.stoppages_opened += 1;
                    tracing::info!(
                        session_id = %session.id,
                        machine_id = %session.machine_id,
                        stoppage_id = %stoppage.id,
                        interval_secs = interval,
                        ideal_cycle_secs = ideal,
                        "Cycle gap, stoppage opened"
                    );
                }
            }
        }

        let pulse = ProductionPulse {
            id: new_id(),
            session_id: session.id.clone(),
            external_id: format!("{}_p{}", row.id, session.plate),
            cycle_at: row.recorded_at,
            piece_count: i64::from(cavities),
            interval_secs,
        };
        if self.store.insert_pulse(&pulse)? {
            report.pulses_inserted += 1;
        } else {
            report.duplicates += 1;
            tracing::debug!(external_id = %pulse.external_id, "Pulse already ingested");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::error::Error;
    use crate::store::{FixedClock, StoppageFilter};
    use crate::types::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::cell::RefCell;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    /// Feed over an in-memory row list
    #[derive(Default)]
    struct VecFeed {
        rows: RefCell<Vec<LegacyPulse>>,
        malformed: RefCell<Vec<i64>>,
    }

    impl VecFeed {
        fn push(&self, id: i64, machine: &str, offset_secs: i64) {
            self.rows.borrow_mut().push(LegacyPulse {
                id,
                machine_number: machine.to_string(),
                recorded_at: t0() + Duration::seconds(offset_secs),
            });
        }

        fn push_malformed(&self, id: i64) {
            self.malformed.borrow_mut().push(id);
        }
    }

    impl LegacyPulseFeed for VecFeed {
        fn pulses_after(&self, last_id: i64) -> Result<LegacyBatch> {
            Ok(LegacyBatch {
                pulses: self
                    .rows
                    .borrow()
                    .iter()
                    .filter(|r| r.id > last_id)
                    .cloned()
                    .collect(),
                malformed: self
                    .malformed
                    .borrow()
                    .iter()
                    .copied()
                    .filter(|id| *id > last_id)
                    .collect(),
            })
        }
    }

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db.upsert_machine(&Machine {
            id: "m-7".to_string(),
            number: "7".to_string(),
            name: Some("Press 7".to_string()),
        })
        .unwrap();
        db.upsert_product(&ProductReference {
            code: "P-100".to_string(),
            description: None,
            ideal_cycle_secs: Some(100),
            cavities: 4,
        })
        .unwrap();
        db
    }

    fn start(db: &Database, id: &str, plate: u32) {
        db.insert_session(&ProductionSession {
            id: id.to_string(),
            machine_id: "m-7".to_string(),
            product_code: "P-100".to_string(),
            plate,
            operator_id: "op-1".to_string(),
            status: SessionStatus::InProgress,
            started_at: t0() - Duration::minutes(5),
            ended_at: None,
            scrap_count: 0,
        })
        .unwrap();
    }

    #[test]
    fn test_fans_out_one_pulse_per_plate() {
        let db = setup();
        start(&db, "s-1", 1);
        start(&db, "s-2", 2);
        let feed = VecFeed::default();
        feed.push(10, "7", 0);
        let clock = FixedClock(t0());

        let report = PulseIngestor::new(&db, &feed, &clock, IngestPolicy::default())
            .sync_once()
            .unwrap();

        assert_eq!(report.rows_read, 1);
        assert_eq!(report.pulses_inserted, 2);
        assert_eq!(report.last_id, 10);
        for (session, external) in [("s-1", "10_p1"), ("s-2", "10_p2")] {
            let pulse = db.latest_pulse(session).unwrap().unwrap();
            assert_eq!(pulse.external_id, external);
            assert_eq!(pulse.piece_count, 4);
            assert_eq!(pulse.interval_secs, None);
        }
        assert_eq!(db.last_legacy_id().unwrap(), 10);
    }

    #[test]
    fn test_interval_and_gap_stoppage() {
        let db = setup();
        start(&db, "s-1", 1);
        let feed = VecFeed::default();
        feed.push(1, "7", 0);
        feed.push(2, "7", 90);
        // 250s gap > 100s ideal
        feed.push(3, "7", 340);
        let clock = FixedClock(t0() + Duration::seconds(400));

        let report = PulseIngestor::new(&db, &feed, &clock, IngestPolicy::default())
            .sync_once()
            .unwrap();
        assert_eq!(report.pulses_inserted, 3);
        assert_eq!(report.stoppages_opened, 1);

        let latest = db.latest_pulse("s-1").unwrap().unwrap();
        assert_eq!(latest.interval_secs, Some(250));

        let open = db.open_stoppage("s-1").unwrap().unwrap();
        assert_eq!(open.started_at, t0() + Duration::seconds(90));
        assert_eq!(open.classification, StoppageClassification::Unplanned);
        assert_eq!(db.total_pieces("s-1").unwrap(), 12);
    }

    #[test]
    fn test_gap_respects_existing_open_stoppage() {
        let db = setup();
        start(&db, "s-1", 1);
        let feed = VecFeed::default();
        feed.push(1, "7", 0);
        feed.push(2, "7", 500);
        feed.push(3, "7", 1000);
        let clock = FixedClock(t0() + Duration::seconds(1000));

        let report = PulseIngestor::new(&db, &feed, &clock, IngestPolicy::default())
            .sync_once()
            .unwrap();
        assert_eq!(report.stoppages_opened, 1);

        let all = db
            .list_stoppages(&StoppageFilter {
                session_id: Some("s-1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_gap_multiplier_widens_tolerance() {
        let db = setup();
        start(&db, "s-1", 1);
        let feed = VecFeed::default();
        feed.push(1, "7", 0);
        feed.push(2, "7", 150);
        let clock = FixedClock(t0() + Duration::seconds(150));

        let policy = IngestPolicy {
            gap_multiplier: 1.6,
            ..Default::default()
        };
        let report = PulseIngestor::new(&db, &feed, &clock, policy)
            .sync_once()
            .unwrap();
        assert_eq!(report.stoppages_opened, 0);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let db = setup();
        start(&db, "s-1", 1);
        let feed = VecFeed::default();
        feed.push(1, "7", 0);
        feed.push(2, "7", 60);
        let clock = FixedClock(t0() + Duration::seconds(60));
        let ingestor = PulseIngestor::new(&db, &feed, &clock, IngestPolicy::default());

        ingestor.sync_once().unwrap();
        let second = ingestor.sync_once().unwrap();
        assert_eq!(second.rows_read, 0);

        // Rewinding the checkpoint re-reads rows but inserts nothing new
        db.set_last_legacy_id(0, clock.now()).unwrap();
        let third = ingestor.sync_once().unwrap();
        assert_eq!(third.rows_read, 2);
        assert_eq!(third.pulses_inserted, 0);
        assert_eq!(third.duplicates, 2);
        assert_eq!(db.total_pieces("s-1").unwrap(), 8);
    }

    #[test]
    fn test_rows_without_sessions_only_advance_checkpoint() {
        let db = setup();
        let feed = VecFeed::default();
        feed.push(5, "7", 0);
        feed.push(6, "99", 10);
        let clock = FixedClock(t0());

        let report = PulseIngestor::new(&db, &feed, &clock, IngestPolicy::default())
            .sync_once()
            .unwrap();
        assert_eq!(report.rows_skipped, 2);
        assert_eq!(report.pulses_inserted, 0);
        assert_eq!(db.last_legacy_id().unwrap(), 6);
    }

    #[test]
    fn test_unknown_product_defaults() {
        let db = setup();
        db.insert_session(&ProductionSession {
            id: "s-9".to_string(),
            machine_id: "m-7".to_string(),
            product_code: "UNKNOWN".to_string(),
            plate: 1,
            operator_id: "op-1".to_string(),
            status: SessionStatus::InProgress,
            started_at: t0(),
            ended_at: None,
            scrap_count: 0,
        })
        .unwrap();
        let feed = VecFeed::default();
        feed.push(1, "7", 0);
        // 200s is within the 300s default
        feed.push(2, "7", 200);
        let clock = FixedClock(t0() + Duration::seconds(200));

        let report = PulseIngestor::new(&db, &feed, &clock, IngestPolicy::default())
            .sync_once()
            .unwrap();
        assert_eq!(report.stoppages_opened, 0);
        assert_eq!(db.total_pieces("s-9").unwrap(), 2);
    }

    /// Feed that fails every read
    struct DownFeed;

    impl LegacyPulseFeed for DownFeed {
        fn pulses_after(&self, _: i64) -> Result<LegacyBatch> {
            Err(Error::StoreUnavailable("legacy store offline".to_string()))
        }
    }

    #[test]
    fn test_feed_failure_leaves_checkpoint() {
        let db = setup();
        db.set_last_legacy_id(41, t0()).unwrap();
        let clock = FixedClock(t0());

        let err = PulseIngestor::new(&db, &DownFeed, &clock, IngestPolicy::default())
            .sync_once()
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(db.last_legacy_id().unwrap(), 41);
    }

    #[test]
    fn test_malformed_tail_rows_advance_checkpoint() {
        let db = setup();
        start(&db, "s-1", 1);
        let feed = VecFeed::default();
        feed.push_malformed(1);
        feed.push(2, "7", 0);
        feed.push_malformed(3);
        feed.push_malformed(4);
        let clock = FixedClock(t0());
        let ingestor = PulseIngestor::new(&db, &feed, &clock, IngestPolicy::default());

        let report = ingestor.sync_once().unwrap();
        assert_eq!(report.rows_read, 4);
        assert_eq!(report.rows_malformed, 3);
        assert_eq!(report.pulses_inserted, 1);
        assert_eq!(report.last_id, 4);
        assert_eq!(db.last_legacy_id().unwrap(), 4);

        // Nothing is read, or warned about, again
        let again = ingestor.sync_once().unwrap();
        assert_eq!(again.rows_read, 0);
        assert_eq!(again.rows_malformed, 0);
    }

    #[test]
    fn test_batch_of_only_malformed_rows() {
        let db = setup();
        let feed = VecFeed::default();
        feed.push_malformed(8);
        feed.push_malformed(9);
        let clock = FixedClock(t0());

        let report = PulseIngestor::new(&db, &feed, &clock, IngestPolicy::default())
            .sync_once()
            .unwrap();
        assert_eq!(report.rows_read, 2);
        assert_eq!(report.pulses_inserted, 0);
        assert_eq!(db.last_legacy_id().unwrap(), 9);
    }
}
