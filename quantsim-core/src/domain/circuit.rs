//! Circuit breaker state as persisted per ticker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a ticker's circuit.
///
/// The cooldown end lives inside `Open`, so "cooldown set iff open" holds by
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, requests are allowed.
    Closed,
    /// Tripped, requests are refused until `cooldown_end`.
    Open { cooldown_end: DateTime<Utc> },
    /// Cooldown elapsed, a probe request is allowed.
    HalfOpen,
}

impl CircuitState {
    /// Storage tag for the state column.
    pub fn tag(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open { .. } => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    pub fn cooldown_end(&self) -> Option<DateTime<Utc>> {
        match self {
            CircuitState::Open { cooldown_end } => Some(*cooldown_end),
            CircuitState::Closed | CircuitState::HalfOpen => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open { .. })
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Open { cooldown_end } => {
                write!(f, "OPEN (until {})", cooldown_end.to_rfc3339())
            }
            other => f.write_str(other.tag()),
        }
    }
}

/// Full breaker row for one ticker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

impl CircuitRecord {
    /// Fresh row: closed, no failures.
    pub fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
        }
    }
}

impl Default for CircuitRecord {
    fn default() -> Self {
        Self::closed()
    }
}
