//! Per-ticker circuit breaker over persisted state.
//!
//! After repeated upstream failures for a ticker the circuit opens and refuses
//! fetches for a cooldown period (default 1 hour). Once the cooldown has
//! elapsed the next check moves the circuit to half-open and lets a probe
//! through; a success closes it again.
//!
//! The breaker never sleeps and holds no state of its own: every decision is a
//! read-modify-write of the ticker's row in `Storage`.

use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::domain::{CircuitRecord, CircuitState};
use crate::storage::{Storage, StorageError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BreakerError {
    /// Calls are currently forbidden. Not a fault: retry after `cooldown_end`.
    #[error("circuit open for '{ticker}' until {cooldown_end}")]
    Open {
        ticker: String,
        cooldown_end: DateTime<Utc>,
    },

    #[error("breaker storage: {0}")]
    Storage(#[from] StorageError),
}

pub struct CircuitBreaker {
    storage: Arc<dyn Storage>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(storage: Arc<dyn Storage>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            config,
            clock,
        }
    }

    /// Ensure a row exists for the ticker. No-op when one is already present.
    pub fn initialize(&self, ticker: &str) -> Result<(), BreakerError> {
        self.load_or_init(ticker).map(|_| ())
    }

    /// Current row, created closed if the ticker is unseen.
    pub fn state(&self, ticker: &str) -> Result<CircuitRecord, BreakerError> {
        self.load_or_init(ticker)
    }

    /// Check whether a call may be made now.
    pub fn check_state(&self, ticker: &str) -> Result<CircuitState, BreakerError> {
        self.check_state_at(ticker, self.clock.now())
    }

    /// Check whether a call may be made at `now`.
    ///
    /// Returns the state the call proceeds under (`Closed` or `HalfOpen`), or
    /// `BreakerError::Open` while the cooldown is running. An expired cooldown
    /// moves the circuit to `HalfOpen` as a side effect.
    pub fn check_state_at(
        &self,
        ticker: &str,
        now: DateTime<Utc>,
    ) -> Result<CircuitState, BreakerError> {
        let record = self.load_or_init(ticker)?;
        match record.state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                debug!(ticker, state = record.state.tag(), "circuit permits call");
                Ok(record.state)
            }
            CircuitState::Open { cooldown_end } if now < cooldown_end => {
                warn!(ticker, %cooldown_end, "circuit open, call refused");
                Err(BreakerError::Open {
                    ticker: ticker.to_string(),
                    cooldown_end,
                })
            }
            CircuitState::Open { .. } => {
                let half_open = CircuitRecord {
                    state: CircuitState::HalfOpen,
                    failure_count: 0,
                    last_failure_time: None,
                };
                self.storage.set_circuit_state(ticker, &half_open)?;
                info!(ticker, "cooldown elapsed, circuit half-open");
                Ok(CircuitState::HalfOpen)
            }
        }
    }

    /// Record a failed upstream call at `now`.
    ///
    /// A failure more than the failure window after the previous one starts a
    /// new sequence at 1. Reaching the threshold from `Closed` or `HalfOpen`
    /// opens the circuit until `now + cooldown`.
    pub fn record_failure(
        &self,
        ticker: &str,
        now: DateTime<Utc>,
    ) -> Result<CircuitRecord, BreakerError> {
        let record = self.load_or_init(ticker)?;

        let failure_count = match record.last_failure_time {
            Some(last) if now - last <= self.config.failure_window() => {
                record.failure_count.saturating_add(1)
            }
            _ => 1,
        };

        let state = match record.state {
            CircuitState::Open { cooldown_end } => CircuitState::Open { cooldown_end },
            CircuitState::Closed | CircuitState::HalfOpen
                if failure_count >= self.config.failure_threshold =>
            {
                let cooldown_end = now
                    .checked_add_signed(self.config.cooldown())
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                warn!(ticker, failure_count, %cooldown_end, "failure threshold reached, circuit open");
                CircuitState::Open { cooldown_end }
            }
            CircuitState::Closed => CircuitState::Closed,
            CircuitState::HalfOpen => CircuitState::HalfOpen,
        };

        let updated = CircuitRecord {
            state,
            failure_count,
            last_failure_time: Some(now),
        };
        self.storage.set_circuit_state(ticker, &updated)?;
        debug!(ticker, failure_count, state = state.tag(), "failure recorded");
        Ok(updated)
    }

    /// Record a successful upstream call: the circuit closes and the failure
    /// sequence is cleared.
    pub fn record_success(&self, ticker: &str) -> Result<CircuitRecord, BreakerError> {
        let record = self.load_or_init(ticker)?;
        match record.state {
            CircuitState::HalfOpen | CircuitState::Open { .. } => {
                info!(ticker, from = record.state.tag(), "circuit closed");
            }
            CircuitState::Closed => {}
        }
        let closed = CircuitRecord::closed();
        if record != closed {
            self.storage.set_circuit_state(ticker, &closed)?;
        }
        Ok(closed)
    }

    fn load_or_init(&self, ticker: &str) -> Result<CircuitRecord, BreakerError> {
        match self.storage.get_circuit_state(ticker) {
            Ok(record) => Ok(record),
            Err(StorageError::NotFound { .. }) => {
                let fresh = CircuitRecord::closed();
                self.storage.set_circuit_state(ticker, &fresh)?;
                debug!(ticker, "circuit row created");
                Ok(fresh)
            }
            Err(e) => Err(e.into()),
        }
    }
}
