//! Storage trait and structured error types.
//!
//! The `Storage` trait is the narrow CRUD surface the ingestion core consumes.
//! Breaker, validator and controller receive it as `Arc<dyn Storage>`; nothing
//! reaches a connection through a global.

pub mod schema;
pub mod sqlite;

pub use sqlite::SqliteStorage;

use crate::domain::{ApiCallRecord, CircuitRecord, IssueType, PriceBar, ValidationIssue};
use thiserror::Error;

/// Structured error types for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no circuit breaker state for ticker '{ticker}'")]
    NotFound { ticker: String },

    #[error("corrupt row for '{ticker}': {reason}")]
    Corrupt { ticker: String, reason: String },

    #[error("row for '{found}' offered under ticker '{expected}'")]
    TickerMismatch { expected: String, found: String },

    #[error("database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// CRUD interface over persisted price rows, breaker state, validation issues
/// and API call metrics.
pub trait Storage: Send + Sync {
    /// Breaker row for a ticker. `StorageError::NotFound` if the ticker is unseen.
    fn get_circuit_state(&self, ticker: &str) -> Result<CircuitRecord, StorageError>;

    /// Overwrite (or create) the breaker row for a ticker.
    fn set_circuit_state(&self, ticker: &str, record: &CircuitRecord) -> Result<(), StorageError>;

    /// Insert bars keyed by `(ticker, timestamp)`, ignoring rows that already exist.
    ///
    /// Every bar must carry `ticker`; a foreign bar fails the whole batch with
    /// `StorageError::TickerMismatch` and nothing is written.
    ///
    /// Returns the number of rows newly inserted.
    fn upsert_daily_bars(&self, ticker: &str, bars: &[PriceBar]) -> Result<usize, StorageError>;

    /// Bars with `start_ts <= timestamp <= end_ts`, ascending. Empty is not an error.
    fn get_historical_bars(
        &self,
        ticker: &str,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<Vec<PriceBar>, StorageError>;

    /// Remove every unresolved validation issue for a ticker.
    fn delete_unresolved_issues(&self, ticker: &str) -> Result<usize, StorageError>;

    fn insert_validation_issue(
        &self,
        ticker: &str,
        date: i64,
        issue_type: IssueType,
        description: &str,
    ) -> Result<(), StorageError>;

    /// Delete a ticker's unresolved issues and insert `issues` in one
    /// transaction. Either the whole new snapshot lands or the old one stays.
    ///
    /// Returns the number of unresolved rows removed.
    fn replace_unresolved_issues(
        &self,
        ticker: &str,
        issues: &[ValidationIssue],
    ) -> Result<usize, StorageError>;

    /// All validation issues for a ticker, ordered by date then insertion.
    fn validation_issues(&self, ticker: &str) -> Result<Vec<ValidationIssue>, StorageError>;

    /// Persist one upstream attempt.
    fn record_api_call(&self, record: &ApiCallRecord) -> Result<(), StorageError>;
}
