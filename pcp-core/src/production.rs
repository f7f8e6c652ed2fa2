//! Operator actions: running sessions and classifying stoppages.

use crate::error::{Error, Result};
use crate::store::{
    Clock, ExportQueue, PulseStore, ReasonStore, SessionFilter, SessionStore, StoppageFilter,
    StoppageStore,
};
use crate::types::*;
use chrono::{DateTime, Utc};

/// Request to start a session.
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub machine_id: String,
    pub product_code: String,
    /// Defaults to plate 1
    pub plate: Option<u32>,
    pub operator_id: String,
}

/// Session lifecycle, stoppage justification and the reason catalog.
pub struct ProductionService<'a, S: ?Sized> {
    store: &'a S,
    clock: &'a dyn Clock,
}

impl<'a, S> ProductionService<'a, S>
where
    S: SessionStore + PulseStore + StoppageStore + ReasonStore + ExportQueue + ?Sized,
{
    pub fn new(store: &'a S, clock: &'a dyn Clock) -> Self {
        Self { store, clock }
    }

    /// Start a session on a machine plate.
    ///
    /// Fails with [`Error::SessionAlreadyActive`] when the plate already has a
    /// session in progress.
    pub fn start_session(&self, request: NewSession) -> Result<ProductionSession> {
        for (field, value) in [
            ("machine_id", &request.machine_id),
            ("product_code", &request.product_code),
            ("operator_id", &request.operator_id),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidInput(format!("{} is required", field)));
            }
        }
        let plate = request.plate.unwrap_or(1);
        if plate == 0 {
            return Err(Error::InvalidInput("plate must be at least 1".to_string()));
        }

        let active = self.store.list_sessions(&SessionFilter {
            plate: Some(plate),
            limit: Some(1),
            ..SessionFilter::in_progress(Some(&request.machine_id))
        })?;
        if !active.is_empty() {
            return Err(Error::SessionAlreadyActive {
                machine_id: request.machine_id,
                plate,
            });
        }

        let session = ProductionSession {
            id: new_id(),
            machine_id: request.machine_id,
            product_code: request.product_code,
            plate,
            operator_id: request.operator_id,
            status: SessionStatus::InProgress,
            started_at: self.clock.now(),
            ended_at: None,
            scrap_count: 0,
        };
        self.store.insert_session(&session)?;

        tracing::info!(
            session_id = %session.id,
            machine_id = %session.machine_id,
            plate = session.plate,
            product_code = %session.product_code,
            "Session started"
        );
        Ok(session)
    }

    /// Finish a session and queue its production total for export.
    ///
    /// The total is read before the session is closed. If queueing the export
    /// fails the session stays finished and the error is returned;
    /// [`enqueue_export`](Self::enqueue_export) queues it later.
    pub fn finish_session(
        &self,
        session_id: &str,
        scrap_count: i64,
    ) -> Result<(ProductionSession, ExportRecord)> {
        if scrap_count < 0 {
            return Err(Error::InvalidInput(
                "scrap count cannot be negative".to_string(),
            ));
        }

        let mut session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if !session.is_in_progress() {
            return Err(Error::SessionNotInProgress(session_id.to_string()));
        }

        let total_quantity = self.store.total_pieces(&session.id)?;
        let now = self.clock.now();
        session.status = SessionStatus::Finished;
        session.ended_at = Some(now);
        session.scrap_count = scrap_count;
        self.store.update_session(&session)?;

        let export = self
            .queue_export(&session, total_quantity, now)
            .map_err(|e| {
                tracing::error!(
                    session_id = %session.id,
                    error = %e,
                    "Session finished but its export was not queued"
                );
                e
            })?;

        tracing::info!(
            session_id = %session.id,
            total_quantity = export.total_quantity,
            scrap_count,
            "Session finished"
        );
        Ok((session, export))
    }

    /// Queue the export of a finished session that has none.
    ///
    /// Fails with [`Error::ExportAlreadyQueued`] when the session was already
    /// exported.
    pub fn enqueue_export(&self, session_id: &str) -> Result<ExportRecord> {
        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if session.is_in_progress() {
            return Err(Error::InvalidInput(format!(
                "session {} is still in progress",
                session_id
            )));
        }
        if self.store.export_for_session(session_id)?.is_some() {
            return Err(Error::ExportAlreadyQueued(session_id.to_string()));
        }

        let total_quantity = self.store.total_pieces(session_id)?;
        let export = self.queue_export(&session, total_quantity, self.clock.now())?;
        tracing::info!(session_id, total_quantity, "Export queued");
        Ok(export)
    }

    fn queue_export(
        &self,
        session: &ProductionSession,
        total_quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<ExportRecord> {
        let export = ExportRecord {
            id: new_id(),
            session_id: session.id.clone(),
            item_code: Some(session.product_code.clone()),
            total_quantity,
            status: ExportStatus::Pending,
            created_at: now,
        };
        self.store.enqueue_export(&export)?;
        Ok(export)
    }

    /// Record why a stoppage happened and close it.
    ///
    /// The reason must exist and be active. A stoppage that is already closed
    /// keeps its end time.
    pub fn justify_stoppage(
        &self,
        stoppage_id: &str,
        reason_code: &str,
        classification: Option<StoppageClassification>,
    ) -> Result<MachineStoppage> {
        let reason = self
            .store
            .get_reason(reason_code)?
            .filter(|r| r.active)
            .ok_or_else(|| Error::ReasonNotFound(reason_code.to_string()))?;

        let mut stoppage = self
            .store
            .get_stoppage(stoppage_id)?
            .ok_or_else(|| Error::StoppageNotFound(stoppage_id.to_string()))?;

        stoppage.reason_code = Some(reason.code);
        stoppage.classification = classification.unwrap_or_default();
        stoppage.justified = true;
        if stoppage.ended_at.is_none() {
            stoppage.ended_at = Some(self.clock.now());
        }
        self.store.update_stoppage(&stoppage)?;

        tracing::info!(
            stoppage_id = %stoppage.id,
            session_id = %stoppage.session_id,
            reason_code,
            classification = %stoppage.classification,
            "Stoppage justified"
        );
        Ok(stoppage)
    }

    // ============================================
    // Reason catalog
    // ============================================

    pub fn list_reasons(&self, active_only: bool) -> Result<Vec<StoppageReason>> {
        let mut reasons = self.store.list_reasons()?;
        if active_only {
            reasons.retain(|r| r.active);
        }
        Ok(reasons)
    }

    pub fn add_reason(&self, code: &str, description: &str) -> Result<StoppageReason> {
        let code = code.trim();
        let description = description.trim();
        if code.is_empty() || description.is_empty() {
            return Err(Error::InvalidInput(
                "reason code and description are required".to_string(),
            ));
        }
        let reason = StoppageReason {
            code: code.to_string(),
            description: description.to_string(),
            active: true,
        };
        self.store.insert_reason(&reason)?;
        Ok(reason)
    }

    pub fn rename_reason(&self, code: &str, description: &str) -> Result<StoppageReason> {
        let description = description.trim();
        if description.is_empty() {
            return Err(Error::InvalidInput("description is required".to_string()));
        }
        self.modify_reason(code, |r| r.description = description.to_string())
    }

    /// Activate or deactivate a reason. Inactive reasons stay on past stoppages
    /// but cannot be picked for new justifications.
    pub fn set_reason_active(&self, code: &str, active: bool) -> Result<StoppageReason> {
        self.modify_reason(code, |r| r.active = active)
    }

    /// Delete a reason no stoppage refers to.
    pub fn remove_reason(&self, code: &str) -> Result<()> {
        self.ensure_reason_unused(code)?;
        if !self.store.delete_reason(code)? {
            return Err(Error::ReasonNotFound(code.to_string()));
        }
        tracing::info!(code, "Reason removed");
        Ok(())
    }

    /// Change the code of a reason no stoppage refers to, keeping its
    /// description and state.
    pub fn recode_reason(&self, code: &str, new_code: &str) -> Result<StoppageReason> {
        let new_code = new_code.trim();
        if new_code.is_empty() {
            return Err(Error::InvalidInput("new reason code is required".to_string()));
        }
        let old = self
            .store
            .get_reason(code)?
            .ok_or_else(|| Error::ReasonNotFound(code.to_string()))?;
        if new_code == old.code {
            return Ok(old);
        }
        self.ensure_reason_unused(code)?;

        let reason = StoppageReason {
            code: new_code.to_string(),
            ..old
        };
        self.store.insert_reason(&reason)?;
        self.store.delete_reason(code)?;
        tracing::info!(from = code, to = new_code, "Reason recoded");
        Ok(reason)
    }

    fn ensure_reason_unused(&self, code: &str) -> Result<()> {
        let used = self.store.list_stoppages(&StoppageFilter {
            reason_code: Some(code.to_string()),
            limit: Some(1),
            ..Default::default()
        })?;
        if !used.is_empty() {
            return Err(Error::InvalidInput(format!(
                "reason {} is used by recorded stoppages",
                code
            )));
        }
        Ok(())
    }

    fn modify_reason(
        &self,
        code: &str,
        change: impl FnOnce(&mut StoppageReason),
    ) -> Result<StoppageReason> {
        let mut reason = self
            .store
            .get_reason(code)?
            .ok_or_else(|| Error::ReasonNotFound(code.to_string()))?;
        change(&mut reason);
        self.store.update_reason(&reason)?;
        Ok(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::store::{FixedClock, ProductCatalog};
    use crate::watchdog::{EvaluationMode, IdleEvaluator, IdlePolicy, Outcome};
    use chrono::{Duration, TimeZone};
    use std::cell::Cell;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap()
    }

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn request(plate: Option<u32>) -> NewSession {
        NewSession {
            machine_id: "m-1".to_string(),
            product_code: "P-100".to_string(),
            plate,
            operator_id: "op-9".to_string(),
        }
    }

    #[test]
    fn test_start_defaults_to_plate_one() {
        let db = test_db();
        let clock = FixedClock(t0());
        let service = ProductionService::new(&db, &clock);

        let session = service.start_session(request(None)).unwrap();
        assert_eq!(session.plate, 1);
        assert_eq!(session.started_at, t0());
        assert!(session.is_in_progress());
        assert_eq!(db.get_session(&session.id).unwrap().unwrap(), session);
    }

    #[test]
    fn test_start_requires_fields() {
        let db = test_db();
        let clock = FixedClock(t0());
        let service = ProductionService::new(&db, &clock);

        let mut missing = request(None);
        missing.operator_id = "  ".to_string();
        let err = service.start_session(missing).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(msg) if msg.contains("operator_id")));
    }

    #[test]
    fn test_one_session_per_plate() {
        let db = test_db();
        let clock = FixedClock(t0());
        let service = ProductionService::new(&db, &clock);

        service.start_session(request(Some(1))).unwrap();
        service.start_session(request(Some(2))).unwrap();
        let err = service.start_session(request(Some(1))).unwrap_err();
        assert!(matches!(err, Error::SessionAlreadyActive { plate: 1, .. }));
    }

    #[test]
    fn test_finish_enqueues_export() {
        let db = test_db();
        let clock = FixedClock(t0());
        let service = ProductionService::new(&db, &clock);
        let session = service.start_session(request(None)).unwrap();

        for (i, offset) in [30, 60, 90].iter().enumerate() {
            db.insert_pulse(&ProductionPulse {
                id: new_id(),
                session_id: session.id.clone(),
                external_id: format!("{}_p1", i),
                cycle_at: t0() + Duration::seconds(*offset),
                piece_count: 4,
                interval_secs: None,
            })
            .unwrap();
        }

        let (finished, export) = service.finish_session(&session.id, 2).unwrap();
        assert_eq!(finished.status, SessionStatus::Finished);
        assert_eq!(finished.ended_at, Some(t0()));
        assert_eq!(finished.scrap_count, 2);
        assert_eq!(export.total_quantity, 12);
        assert_eq!(export.item_code.as_deref(), Some("P-100"));

        let pending = db.list_exports(Some(ExportStatus::Pending)).unwrap();
        assert_eq!(pending, vec![export]);

        let err = service.finish_session(&session.id, 0).unwrap_err();
        assert!(matches!(err, Error::SessionNotInProgress(_)));

        // The plate is free again
        service.start_session(request(None)).unwrap();
    }

    #[test]
    fn test_finish_missing_session() {
        let db = test_db();
        let clock = FixedClock(t0());
        let service = ProductionService::new(&db, &clock);
        assert!(matches!(
            service.finish_session("nope", 0),
            Err(Error::SessionNotFound(_))
        ));
        assert!(matches!(
            service.finish_session("nope", -1),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_justify_closes_stoppage_and_allows_a_new_one() {
        let db = test_db();
        db.upsert_product(&ProductReference {
            code: "P-100".to_string(),
            description: None,
            ideal_cycle_secs: Some(100),
            cavities: 1,
        })
        .unwrap();

        let start_clock = FixedClock(t0());
        let session = ProductionService::new(&db, &start_clock)
            .start_session(request(None))
            .unwrap();

        let later = FixedClock(t0() + Duration::seconds(300));
        let evaluator = IdleEvaluator::new(&db, &later, IdlePolicy::default());
        let stoppage = match evaluator.evaluate(&session.id).unwrap() {
            Outcome::StoppageOpened { stoppage, .. } => stoppage,
            other => panic!("expected a stoppage, got {:?}", other),
        };

        let service = ProductionService::new(&db, &later);
        service.add_reason("20", "Mold change").unwrap();
        let justified = service
            .justify_stoppage(&stoppage.id, "20", Some(StoppageClassification::Planned))
            .unwrap();
        assert!(justified.justified);
        assert_eq!(justified.reason_code.as_deref(), Some("20"));
        assert_eq!(justified.classification, StoppageClassification::Planned);
        assert_eq!(justified.ended_at, Some(later.0));
        assert!(db.open_stoppage(&session.id).unwrap().is_none());

        let much_later = FixedClock(t0() + Duration::seconds(900));
        let evaluator = IdleEvaluator::new(&db, &much_later, IdlePolicy::default());
        let report = evaluator
            .evaluate_active(None, EvaluationMode::Apply)
            .unwrap();
        assert_eq!(report.stoppages_opened, 1);
    }

    #[test]
    fn test_justify_rejects_inactive_reason() {
        let db = test_db();
        let clock = FixedClock(t0());
        let service = ProductionService::new(&db, &clock);
        let session = service.start_session(request(None)).unwrap();
        let stoppage = MachineStoppage::detected(&session, t0(), t0());
        db.insert_stoppage(&stoppage).unwrap();

        service.add_reason("30", "No operator").unwrap();
        service.set_reason_active("30", false).unwrap();

        let err = service
            .justify_stoppage(&stoppage.id, "30", None)
            .unwrap_err();
        assert!(matches!(err, Error::ReasonNotFound(_)));
        let err = service
            .justify_stoppage(&stoppage.id, "99", None)
            .unwrap_err();
        assert!(matches!(err, Error::ReasonNotFound(_)));

        service.set_reason_active("30", true).unwrap();
        let justified = service.justify_stoppage(&stoppage.id, "30", None).unwrap();
        assert_eq!(justified.classification, StoppageClassification::Unplanned);
    }

    #[test]
    fn test_reason_catalog() {
        let db = test_db();
        let clock = FixedClock(t0());
        let service = ProductionService::new(&db, &clock);

        service.add_reason("20", "Mold change").unwrap();
        service.add_reason("10", "Maintenance").unwrap();
        assert!(matches!(
            service.add_reason("10", "Again"),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            service.add_reason(" ", "Blank"),
            Err(Error::InvalidInput(_))
        ));

        let renamed = service.rename_reason("20", "Mold swap").unwrap();
        assert_eq!(renamed.description, "Mold swap");
        service.set_reason_active("10", false).unwrap();

        let codes: Vec<String> = service
            .list_reasons(false)
            .unwrap()
            .into_iter()
            .map(|r| r.code)
            .collect();
        assert_eq!(codes, vec!["10", "20"]);
        assert_eq!(service.list_reasons(true).unwrap().len(), 1);

        assert!(matches!(
            service.rename_reason("77", "x"),
            Err(Error::ReasonNotFound(_))
        ));
    }

    #[test]
    fn test_reason_remove_and_recode() {
        let db = test_db();
        let clock = FixedClock(t0());
        let service = ProductionService::new(&db, &clock);
        service.add_reason("MC", "Mold change").unwrap();
        service.add_reason("NM", "No material").unwrap();
        service.set_reason_active("NM", false).unwrap();

        let recoded = service.recode_reason("NM", "MAT").unwrap();
        assert_eq!(recoded.description, "No material");
        assert!(!recoded.active);
        assert!(db.get_reason("NM").unwrap().is_none());
        assert!(matches!(
            service.recode_reason("MAT", "MC"),
            Err(Error::InvalidInput(_))
        ));
        assert!(db.get_reason("MAT").unwrap().is_some());

        service.remove_reason("MAT").unwrap();
        assert!(matches!(
            service.remove_reason("MAT"),
            Err(Error::ReasonNotFound(_))
        ));

        // A reason on a recorded stoppage stays put
        let session = service.start_session(request(None)).unwrap();
        let stoppage = MachineStoppage::detected(&session, t0(), t0());
        db.insert_stoppage(&stoppage).unwrap();
        service.justify_stoppage(&stoppage.id, "MC", None).unwrap();

        assert!(matches!(
            service.remove_reason("MC"),
            Err(Error::InvalidInput(msg)) if msg.contains("used")
        ));
        assert!(matches!(
            service.recode_reason("MC", "MOLD"),
            Err(Error::InvalidInput(_))
        ));
        assert!(db.get_reason("MC").unwrap().is_some());
        assert!(db.get_reason("MOLD").unwrap().is_none());
    }

    /// Database whose first export insert fails as if the store timed out.
    struct FlakyExports {
        db: Database,
        fail_next: Cell<bool>,
    }

    impl SessionStore for FlakyExports {
        fn get_session(&self, id: &str) -> Result<Option<ProductionSession>> {
            self.db.get_session(id)
        }
        fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<ProductionSession>> {
            self.db.list_sessions(filter)
        }
        fn insert_session(&self, session: &ProductionSession) -> Result<()> {
            self.db.insert_session(session)
        }
        fn update_session(&self, session: &ProductionSession) -> Result<()> {
            self.db.update_session(session)
        }
    }

    impl PulseStore for FlakyExports {
        fn latest_pulse(&self, session_id: &str) -> Result<Option<ProductionPulse>> {
            self.db.latest_pulse(session_id)
        }
        fn insert_pulse(&self, pulse: &ProductionPulse) -> Result<bool> {
            self.db.insert_pulse(pulse)
        }
        fn total_pieces(&self, session_id: &str) -> Result<i64> {
            self.db.total_pieces(session_id)
        }
    }

    impl StoppageStore for FlakyExports {
        fn open_stoppage(&self, session_id: &str) -> Result<Option<MachineStoppage>> {
            self.db.open_stoppage(session_id)
        }
        fn get_stoppage(&self, id: &str) -> Result<Option<MachineStoppage>> {
            self.db.get_stoppage(id)
        }
        fn list_stoppages(&self, filter: &StoppageFilter) -> Result<Vec<MachineStoppage>> {
            self.db.list_stoppages(filter)
        }
        fn insert_stoppage(&self, stoppage: &MachineStoppage) -> Result<()> {
            self.db.insert_stoppage(stoppage)
        }
        fn update_stoppage(&self, stoppage: &MachineStoppage) -> Result<()> {
            self.db.update_stoppage(stoppage)
        }
    }

    impl ReasonStore for FlakyExports {
        fn get_reason(&self, code: &str) -> Result<Option<StoppageReason>> {
            self.db.get_reason(code)
        }
        fn list_reasons(&self) -> Result<Vec<StoppageReason>> {
            self.db.list_reasons()
        }
        fn insert_reason(&self, reason: &StoppageReason) -> Result<()> {
            self.db.insert_reason(reason)
        }
        fn update_reason(&self, reason: &StoppageReason) -> Result<()> {
            self.db.update_reason(reason)
        }
        fn delete_reason(&self, code: &str) -> Result<bool> {
            self.db.delete_reason(code)
        }
    }

    impl ExportQueue for FlakyExports {
        fn enqueue_export(&self, record: &ExportRecord) -> Result<()> {
            if self.fail_next.replace(false) {
                return Err(Error::StoreUnavailable("timeout".to_string()));
            }
            self.db.enqueue_export(record)
        }
        fn export_for_session(&self, session_id: &str) -> Result<Option<ExportRecord>> {
            self.db.export_for_session(session_id)
        }
        fn list_exports(&self, status: Option<ExportStatus>) -> Result<Vec<ExportRecord>> {
            self.db.list_exports(status)
        }
    }

    #[test]
    fn test_failed_export_can_be_queued_again() {
        let store = FlakyExports {
            db: test_db(),
            fail_next: Cell::new(true),
        };
        let clock = FixedClock(t0());
        let service = ProductionService::new(&store, &clock);
        let session = service.start_session(request(None)).unwrap();
        store
            .insert_pulse(&ProductionPulse {
                id: new_id(),
                session_id: session.id.clone(),
                external_id: "1_p1".to_string(),
                cycle_at: t0() + Duration::seconds(30),
                piece_count: 4,
                interval_secs: None,
            })
            .unwrap();

        assert!(matches!(
            service.enqueue_export(&session.id),
            Err(Error::InvalidInput(msg)) if msg.contains("in progress")
        ));

        let err = service.finish_session(&session.id, 0).unwrap_err();
        assert!(err.is_transient());
        let stored = store.get_session(&session.id).unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Finished);
        assert!(store.export_for_session(&session.id).unwrap().is_none());

        let export = service.enqueue_export(&session.id).unwrap();
        assert_eq!(export.total_quantity, 4);
        assert_eq!(export.item_code.as_deref(), Some("P-100"));
        assert_eq!(store.list_exports(None).unwrap(), vec![export]);

        assert!(matches!(
            service.enqueue_export(&session.id),
            Err(Error::ExportAlreadyQueued(_))
        ));
        assert!(matches!(
            service.enqueue_export("nope"),
            Err(Error::SessionNotFound(_))
        ));
    }
}
