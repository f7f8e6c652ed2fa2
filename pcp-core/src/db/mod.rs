//! Database layer for pcp
//!
//! This module provides the local storage backend using SQLite with:
//! - Schema migrations
//! - Repository implementations of the store traits
//! - Store-enforced uniqueness for open stoppages and active plates

pub mod repo;
pub mod schema;

pub use repo::Database;
