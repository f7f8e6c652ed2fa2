//! The idle rule: how long since the last activity, and is that too long.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Thresholds the idle rule runs with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IdlePolicy {
    /// Cycle time assumed when the product has no reference
    pub default_cycle_secs: u32,
    /// Multiple of the ideal cycle time tolerated before a session counts as stalled
    pub idle_multiplier: f64,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self {
            default_cycle_secs: 300,
            idle_multiplier: 1.6,
        }
    }
}

impl IdlePolicy {
    /// Idle seconds tolerated for a product with the given cycle time.
    pub fn threshold_secs(&self, ideal_cycle_secs: u32) -> f64 {
        f64::from(ideal_cycle_secs) * self.idle_multiplier
    }
}

/// Result of applying the idle rule to one session at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IdleAssessment {
    /// Last activity the idle time is measured from
    pub reference: DateTime<Utc>,
    /// The instant the rule was evaluated at
    pub evaluated_at: DateTime<Utc>,
    /// Whole seconds since `reference`, rounded
    pub idle_secs: i64,
    pub ideal_cycle_secs: u32,
    pub threshold_secs: f64,
    /// `idle_secs > threshold_secs`
    pub stalled: bool,
}

/// Applies the idle rule.
///
/// `last_activity` is the most recent pulse, or the session start when the
/// session has none. Idle time equal to the threshold is still tolerated.
pub fn assess_idle(
    last_activity: DateTime<Utc>,
    ideal_cycle_secs: u32,
    now: DateTime<Utc>,
    policy: &IdlePolicy,
) -> IdleAssessment {
    let elapsed_ms = now.signed_duration_since(last_activity).num_milliseconds();
    let idle_secs = (elapsed_ms as f64 / 1000.0).round() as i64;
    let threshold_secs = policy.threshold_secs(ideal_cycle_secs);

    IdleAssessment {
        reference: last_activity,
        evaluated_at: now,
        idle_secs,
        ideal_cycle_secs,
        threshold_secs,
        stalled: idle_secs as f64 > threshold_secs,
    }
}
