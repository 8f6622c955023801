//! Active/idle derivation for sessions
//!
//! [`compute_activity`] is a pure function of its inputs and performs no
//! I/O. Everything time-dependent is passed in, including `now`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_IDLE_TIMEOUT_MS;
use crate::types::SessionStatus;

/// Inputs to the activity computation.
#[derive(Debug, Clone, Copy)]
pub struct ActivityInput {
    pub status: SessionStatus,
    pub last_output_at: Option<DateTime<Utc>>,
    pub last_input_at: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
    pub idle_timeout_ms: u64,
}

impl ActivityInput {
    pub fn new(status: SessionStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            last_output_at: None,
            last_input_at: None,
            last_modified: None,
            started_at: None,
            now,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
        }
    }
}

/// Computed activity status, attached to session entries in `list`/`get`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStatus {
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl ActivityStatus {
    pub fn inactive() -> Self {
        Self {
            is_active: false,
            last_activity_at: None,
        }
    }
}

/// Derive active/idle status.
///
/// A session that is not running is never active. Otherwise the most recent
/// of the four timestamps decides: active iff it falls within the idle
/// window ending at `now`.
pub fn compute_activity(input: ActivityInput) -> ActivityStatus {
    if input.status != SessionStatus::Running {
        return ActivityStatus::inactive();
    }

    let last = [
        input.last_output_at,
        input.last_input_at,
        input.last_modified,
        input.started_at,
    ]
    .into_iter()
    .flatten()
    .max();

    let Some(last) = last else {
        return ActivityStatus::inactive();
    };

    let elapsed_ms = input
        .now
        .signed_duration_since(last)
        .num_milliseconds()
        .max(0) as u64;

    ActivityStatus {
        is_active: elapsed_ms <= input.idle_timeout_ms,
        last_activity_at: Some(last),
    }
}
