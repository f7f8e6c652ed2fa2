//! Stoppage detection for sessions in progress.

use super::idle::{assess_idle, IdleAssessment, IdlePolicy};
use crate::error::{Error, Result};
use crate::store::{
    Clock, ProductCatalog, PulseStore, SessionFilter, SessionStore, StoppageStore,
};
use crate::types::{MachineStoppage, ProductionSession};
use chrono::{DateTime, Utc};

/// What the idle rule concludes for a session, before any write.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// An unresolved stoppage already covers the session
    AlreadyStopped(MachineStoppage),
    WithinTolerance(IdleAssessment),
    Stalled(IdleAssessment),
}

/// What an evaluation did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The session is finished; finished sessions are never evaluated
    NotInProgress,
    AlreadyStopped { stoppage_id: String },
    WithinTolerance(IdleAssessment),
    StoppageOpened {
        stoppage: MachineStoppage,
        assessment: IdleAssessment,
    },
    /// Dry run: a stoppage would have been opened
    WouldOpen(IdleAssessment),
}

/// Whether evaluations write stoppages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvaluationMode {
    #[default]
    Apply,
    DryRun,
}

/// Summary of one pass over the active sessions.
#[derive(Debug, Default)]
pub struct WatchdogReport {
    pub sessions_checked: usize,
    pub stoppages_opened: usize,
    pub already_stopped: usize,
    pub within_tolerance: usize,
    pub would_open: usize,
    /// Per-session outcomes, in evaluation order
    pub outcomes: Vec<(ProductionSession, Outcome)>,
    /// Sessions whose evaluation failed (session id → error message)
    pub failures: Vec<(String, String)>,
}

impl WatchdogReport {
    fn record(&mut self, session: ProductionSession, outcome: Outcome) {
        match outcome {
            Outcome::StoppageOpened { .. } => self.stoppages_opened += 1,
            Outcome::AlreadyStopped { .. } => self.already_stopped += 1,
            Outcome::WithinTolerance(_) => self.within_tolerance += 1,
            Outcome::WouldOpen(_) => self.would_open += 1,
            Outcome::NotInProgress => {}
        }
        self.outcomes.push((session, outcome));
    }
}

/// Inserts a detected stoppage unless the session already has an open one.
///
/// Returns the stoppage that covers the session afterwards and whether it was
/// created by this call. A rejected insert (another writer got there first)
/// resolves to the stoppage that won.
pub(crate) fn open_stoppage_once<S>(
    store: &S,
    session: &ProductionSession,
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(MachineStoppage, bool)>
where
    S: StoppageStore + ?Sized,
{
    let stoppage = MachineStoppage::detected(session, started_at, now);
    match store.insert_stoppage(&stoppage) {
        Ok(()) => Ok((stoppage, true)),
        Err(Error::StoppageAlreadyOpen(session_id)) => {
            tracing::warn!(
                session_id = %session_id,
                "Stoppage insert rejected, another writer opened one first"
            );
            match store.open_stoppage(&session_id)? {
                Some(existing) => Ok((existing, false)),
                None => Err(Error::StoppageAlreadyOpen(session_id)),
            }
        }
        Err(e) => Err(e),
    }
}

/// Decides whether sessions in progress have gone idle and records
/// unplanned stoppages for the ones that have.
///
/// Holds no state between calls. Each evaluation reads the session's open
/// stoppage, last pulse and product reference, then writes at most one
/// stoppage.
pub struct IdleEvaluator<'a, S: ?Sized> {
    store: &'a S,
    clock: &'a dyn Clock,
    policy: IdlePolicy,
}

impl<'a, S> IdleEvaluator<'a, S>
where
    S: SessionStore + PulseStore + StoppageStore + ProductCatalog + ?Sized,
{
    pub fn new(store: &'a S, clock: &'a dyn Clock, policy: IdlePolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &IdlePolicy {
        &self.policy
    }

    /// Ideal cycle time for the product, falling back to the policy default
    /// when the catalog has no entry or cannot be read.
    fn ideal_cycle_secs(&self, session: &ProductionSession) -> u32 {
        let default = self.policy.default_cycle_secs;
        match self.store.ideal_cycle_secs(&session.product_code, default) {
            Ok(secs) => secs,
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id,
                    product_code = %session.product_code,
                    error = %e,
                    default,
                    "Product lookup failed, using default cycle time"
                );
                default
            }
        }
    }

    /// Applies the idle rule to a session without writing anything.
    pub fn assess(&self, session: &ProductionSession) -> Result<Decision> {
        if let Some(open) = self.store.open_stoppage(&session.id)? {
            return Ok(Decision::AlreadyStopped(open));
        }

        let reference = self
            .store
            .latest_pulse(&session.id)?
            .map(|p| p.cycle_at)
            .unwrap_or(session.started_at);
        let ideal = self.ideal_cycle_secs(session);
        let assessment = assess_idle(reference, ideal, self.clock.now(), &self.policy);

        Ok(if assessment.stalled {
            Decision::Stalled(assessment)
        } else {
            Decision::WithinTolerance(assessment)
        })
    }

    /// Evaluates a session by id and opens a stoppage if it has stalled.
    pub fn evaluate(&self, session_id: &str) -> Result<Outcome> {
        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        self.evaluate_session(&session, EvaluationMode::Apply)
    }

    /// Evaluates an already-loaded session.
    pub fn evaluate_session(
        &self,
        session: &ProductionSession,
        mode: EvaluationMode,
    ) -> Result<Outcome> {
        if !session.is_in_progress() {
            return Ok(Outcome::NotInProgress);
        }

        match self.assess(session)? {
            Decision::AlreadyStopped(open) => {
                tracing::debug!(
                    session_id = %session.id,
                    stoppage_id = %open.id,
                    "Session already has an open stoppage"
                );
                Ok(Outcome::AlreadyStopped {
                    stoppage_id: open.id,
                })
            }
            Decision::WithinTolerance(assessment) => {
                tracing::debug!(
                    session_id = %session.id,
                    idle_secs = assessment.idle_secs,
                    threshold_secs = assessment.threshold_secs,
                    "Session within idle tolerance"
                );
                Ok(Outcome::WithinTolerance(assessment))
            }
            Decision::Stalled(assessment) if mode == EvaluationMode::DryRun => {
                Ok(Outcome::WouldOpen(assessment))
            }
            Decision::Stalled(assessment) => {
                let (stoppage, created) = open_stoppage_once(
                    self.store,
                    session,
                    assessment.reference,
                    assessment.evaluated_at,
                )?;
                if !created {
                    return Ok(Outcome::AlreadyStopped {
                        stoppage_id: stoppage.id,
                    });
                }

                tracing::info!(
                    session_id = %session.id,
                    machine_id = %session.machine_id,
                    stoppage_id = %stoppage.id,
                    idle_secs = assessment.idle_secs,
                    threshold_secs = assessment.threshold_secs,
                    "Idle session, stoppage opened"
                );
                Ok(Outcome::StoppageOpened {
                    stoppage,
                    assessment,
                })
            }
        }
    }

    /// Evaluates every session in progress, optionally for one machine.
    ///
    /// Listing the sessions must succeed; after that a failure for one
    /// session is logged and recorded, and the pass continues.
    pub fn evaluate_active(
        &self,
        machine_id: Option<&str>,
        mode: EvaluationMode,
    ) -> Result<WatchdogReport> {
        let sessions = self
            .store
            .list_sessions(&SessionFilter::in_progress(machine_id))?;

        let mut report = WatchdogReport::default();
        for session in sessions {
            report.sessions_checked += 1;
            match self.evaluate_session(&session, mode) {
                Ok(outcome) => report.record(session, outcome),
                Err(e) => {
                    tracing::error!(
                        session_id = %session.id,
                        error = %e,
                        "Idle evaluation failed"
                    );
                    report.failures.push((session.id.clone(), e.to_string()));
                }
            }
        }

        tracing::info!(
            sessions_checked = report.sessions_checked,
            stoppages_opened = report.stoppages_opened,
            failures = report.failures.len(),
            "Watchdog pass complete"
        );

        Ok(report)
    }
}
