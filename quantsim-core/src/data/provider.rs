//! Data provider trait and structured fetch errors.
//!
//! The `DataProvider` trait abstracts over upstream sources so the controller
//! can be driven by the Alpha Vantage fetcher in production and by a canned
//! provider in tests.

use super::transport::TransportError;
use crate::domain::{ApiCallRecord, PriceBar};
use chrono::NaiveDate;
use thiserror::Error;

/// Why a single upstream attempt failed.
#[derive(Debug, Clone, Error)]
pub enum AttemptFailure {
    #[error("{0}")]
    Transport(#[from] TransportError),

    #[error("HTTP status {status}")]
    HttpStatus { status: u16 },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("unexpected response shape: {0}")]
    UnexpectedShape(String),
}

/// Structured error types for a logical fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The upstream rejected the request outright (unknown symbol, bad key).
    #[error("upstream rejected '{ticker}': {message}")]
    Upstream { ticker: String, message: String },

    /// A success payload whose entries could not be parsed.
    #[error("malformed time series for '{ticker}': {reason}")]
    Malformed { ticker: String, reason: String },

    #[error("'{ticker}' failed after {attempts} attempts, last: {last}")]
    Exhausted {
        ticker: String,
        attempts: u32,
        last: AttemptFailure,
    },

    #[error("no bars for '{ticker}' between {start} and {end}")]
    NoData {
        ticker: String,
        start: NaiveDate,
        end: NaiveDate,
    },
}

/// Result of a successful fetch for a single ticker.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub ticker: String,
    /// Ascending, restricted to the requested range, never empty.
    pub bars: Vec<PriceBar>,
    /// Upstream calls made, including the successful one.
    pub attempts: u32,
}

pub trait DataProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Fetch daily bars for a ticker over an inclusive date range.
    ///
    /// Each upstream attempt is reported to `observer`.
    fn fetch(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
        observer: &dyn AttemptObserver,
    ) -> Result<FetchResult, FetchError>;
}

/// Receives one record per upstream attempt.
pub trait AttemptObserver {
    fn on_attempt(&self, record: &ApiCallRecord);
}

/// Discards attempt records.
pub struct NoopObserver;

impl AttemptObserver for NoopObserver {
    fn on_attempt(&self, _record: &ApiCallRecord) {}
}
