//! # pcp-core
//!
//! Core library for pcp - production control for a multi-plate press line.
//!
//! This library provides:
//! - Domain types for sessions, pulses, stoppages and catalogs
//! - Store traits with a local SQLite backend and a hosted REST backend
//! - The idle-session watchdog that opens unplanned stoppages
//! - Pulse ingestion from the line controller
//! - Configuration management
//! - Logging infrastructure
//!
//! ## Example
//!
//! ```rust,no_run
//! use pcp_core::store::{open_store, SystemClock};
//! use pcp_core::watchdog::{EvaluationMode, IdleEvaluator};
//! use pcp_core::Config;
//!
//! let config = Config::load().expect("failed to load config");
//! let store = open_store(&config.store).expect("failed to open store");
//! let clock = SystemClock;
//!
//! let evaluator = IdleEvaluator::new(store.as_ref(), &clock, config.watchdog.policy());
//! let report = evaluator
//!     .evaluate_active(None, EvaluationMode::Apply)
//!     .expect("watchdog pass failed");
//! println!("{} stoppage(s) opened", report.stoppages_opened);
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use store::{open_store, Store};
pub use types::*;

// Public modules
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod production;
pub mod rest;
pub mod store;
pub mod types;
pub mod watchdog;
