//! Idle-session watchdog
//!
//! Decides whether a production session has stopped producing and records an
//! unplanned stoppage for it.
//!
//! ## Rule
//!
//! ```text
//! reference  = last pulse timestamp, or session start when there is none
//! idle       = round(now - reference) seconds
//! threshold  = ideal cycle time (default 300s) × 1.6
//! stalled    = idle > threshold
//! ```
//!
//! A stalled session with no open stoppage gets one starting at `reference`.
//! The rule itself is [`assess_idle`]; [`IdleEvaluator`] gathers its inputs
//! from the stores and performs the write.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pcp_core::store::SystemClock;
//! use pcp_core::watchdog::{EvaluationMode, IdleEvaluator, IdlePolicy};
//! use pcp_core::Database;
//!
//! let db = Database::open_in_memory().unwrap();
//! db.migrate().unwrap();
//! let clock = SystemClock;
//! let evaluator = IdleEvaluator::new(&db, &clock, IdlePolicy::default());
//! let report = evaluator.evaluate_active(None, EvaluationMode::Apply).unwrap();
//! println!("{} stoppage(s) opened", report.stoppages_opened);
//! ```

mod evaluator;
mod idle;

pub use evaluator::{Decision, EvaluationMode, IdleEvaluator, Outcome, WatchdogReport};
pub(crate) use evaluator::open_stoppage_once;
pub use idle::{assess_idle, IdleAssessment, IdlePolicy};
