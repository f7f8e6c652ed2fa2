//! Core domain types for pcp
//!
//! These types model production on a multi-plate press line.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Machine** | A press, identified on the line controller by its number |
//! | **Plate** | One mold position of a press; each plate runs its own session |
//! | **Session** | One operator's timed run of a machine plate producing one product |
//! | **Pulse** | One completed production cycle reported by the line controller |
//! | **Stoppage** | An interval during which a session was idle or stopped |
//! | **Reason** | Catalog entry an operator picks when justifying a stoppage |
//! | **Export** | A finished session queued for the ERP import |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Generates a fresh record identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================
// Machine
// ============================================

/// A press on the line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Unique identifier
    pub id: String,
    /// Number the line controller reports pulses under
    pub number: String,
    /// Human-friendly name (optional)
    pub name: Option<String>,
}

// ============================================
// Session
// ============================================

/// Lifecycle of a production session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Finished,
}

impl SessionStatus {
    /// Returns the identifier used in database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Finished => "finished",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(SessionStatus::InProgress),
            "finished" => Ok(SessionStatus::Finished),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One operator's run of a machine plate for a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionSession {
    pub id: String,
    pub machine_id: String,
    pub product_code: String,
    /// Mold/plate position on the press
    pub plate: u32,
    pub operator_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Pieces scrapped, recorded when the session is finished
    #[serde(default)]
    pub scrap_count: i64,
}

impl ProductionSession {
    pub fn is_in_progress(&self) -> bool {
        self.status == SessionStatus::InProgress
    }
}

// ============================================
// Pulse
// ============================================

/// A completed production cycle. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionPulse {
    pub id: String,
    pub session_id: String,
    /// Correlation id from the line controller (unique)
    pub external_id: String,
    pub cycle_at: DateTime<Utc>,
    pub piece_count: i64,
    /// Seconds since the previous pulse of the same session
    pub interval_secs: Option<i64>,
}

// ============================================
// Stoppage
// ============================================

/// Whether a stoppage was part of the production plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppageClassification {
    Planned,
    #[default]
    Unplanned,
}

impl StoppageClassification {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoppageClassification::Planned => "planned",
            StoppageClassification::Unplanned => "unplanned",
        }
    }
}

impl std::str::FromStr for StoppageClassification {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(StoppageClassification::Planned),
            "unplanned" => Ok(StoppageClassification::Unplanned),
            _ => Err(format!("unknown stoppage classification: {}", s)),
        }
    }
}

impl std::fmt::Display for StoppageClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An idle or stopped interval of a session.
///
/// `ended_at == None` means the stoppage is still open, waiting for an
/// operator to classify it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStoppage {
    pub id: String,
    pub session_id: String,
    pub machine_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub justified: bool,
    pub reason_code: Option<String>,
    pub classification: StoppageClassification,
    pub created_at: DateTime<Utc>,
}

impl MachineStoppage {
    /// A new unjustified, unplanned stoppage detected for `session`.
    pub fn detected(
        session: &ProductionSession,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            session_id: session.id.clone(),
            machine_id: session.machine_id.clone(),
            started_at,
            ended_at: None,
            justified: false,
            reason_code: None,
            classification: StoppageClassification::Unplanned,
            created_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Length of the stoppage, up to `now` while it is still open.
    pub fn duration_secs(&self, now: DateTime<Utc>) -> i64 {
        let end = self.ended_at.unwrap_or(now);
        end.signed_duration_since(self.started_at).num_seconds().max(0)
    }
}

// ============================================
// Catalogs
// ============================================

/// Product entry from the external item catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductReference {
    pub code: String,
    pub description: Option<String>,
    /// Expected duration of one cycle
    pub ideal_cycle_secs: Option<u32>,
    /// Pieces produced per cycle
    pub cavities: u32,
}

/// Catalog entry used to justify a stoppage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoppageReason {
    pub code: String,
    pub description: String,
    pub active: bool,
}

// ============================================
// Export queue
// ============================================

/// Import state of an export record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    Pending,
    Imported,
    Failed,
}

impl ExportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportStatus::Pending => "pending",
            ExportStatus::Imported => "imported",
            ExportStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for ExportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExportStatus::Pending),
            "imported" => Ok(ExportStatus::Imported),
            "failed" => Ok(ExportStatus::Failed),
            _ => Err(format!("unknown export status: {}", s)),
        }
    }
}

/// A finished session's production total, queued for the ERP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub id: String,
    pub session_id: String,
    pub item_code: Option<String>,
    pub total_quantity: i64,
    pub status: ExportStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn session() -> ProductionSession {
        ProductionSession {
            id: "s-1".to_string(),
            machine_id: "m-1".to_string(),
            product_code: "P-100".to_string(),
            plate: 1,
            operator_id: "op-9".to_string(),
            status: SessionStatus::InProgress,
            started_at: Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap(),
            ended_at: None,
            scrap_count: 0,
        }
    }

    #[test]
    fn test_status_round_trips_through_storage_names() {
        for status in [SessionStatus::InProgress, SessionStatus::Finished] {
            assert_eq!(status.as_str().parse::<SessionStatus>(), Ok(status));
        }
        assert!("em_andamento".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_detected_stoppage_is_open_and_unplanned() {
        let s = session();
        let start = s.started_at + chrono::Duration::seconds(50);
        let now = start + chrono::Duration::seconds(250);
        let stoppage = MachineStoppage::detected(&s, start, now);

        assert!(stoppage.is_open());
        assert!(!stoppage.justified);
        assert_eq!(stoppage.classification, StoppageClassification::Unplanned);
        assert_eq!(stoppage.machine_id, "m-1");
        assert_eq!(stoppage.duration_secs(now), 250);
    }

    #[test]
    fn test_classification_serializes_snake_case() {
        let json = serde_json::to_string(&StoppageClassification::Planned).unwrap();
        assert_eq!(json, "\"planned\"");
    }
}
