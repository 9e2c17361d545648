//! Ingestion controller: breaker check → fetch → validate → persist.
//!
//! `SeriesImporter` is the validate → persist half on its own, used for
//! seeding the store from files.
//!
//! Upstream unreliability is an expected outcome (`Skipped`, `Failed`), not an
//! error. `IngestError` is reserved for contract violations and storage
//! failures.

use super::circuit_breaker::{BreakerError, CircuitBreaker};
use super::provider::{AttemptObserver, DataProvider, FetchError};
use super::validator::{DataValidator, QualityReport, ValidationError, ValidationSummary};
use crate::clock::Clock;
use crate::config::QuantsimConfig;
use crate::domain::{ApiCallRecord, PriceBar, PriceField};
use crate::storage::{Storage, StorageError};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid range: start {start} is after end {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("ticker is empty")]
    EmptyTicker,

    #[error(transparent)]
    Breaker(#[from] BreakerError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("ingest storage: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    CircuitOpen { cooldown_end: DateTime<Utc> },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::CircuitOpen { cooldown_end } => {
                write!(f, "circuit open until {}", cooldown_end.to_rfc3339())
            }
        }
    }
}

/// Summary of a completed download.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub ticker: String,
    pub bars: usize,
    /// Rows that did not already exist.
    pub inserted: usize,
    pub attempts: u32,
    pub quality: QualityReport,
    pub quality_score: f64,
}

#[derive(Debug)]
pub enum IngestOutcome {
    Completed(IngestReport),
    Skipped(SkipReason),
    Failed(FetchError),
}

impl IngestOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, IngestOutcome::Completed(_))
    }
}

/// Persists every upstream attempt as an API call metric.
///
/// A failed metric write is logged and dropped; it never fails the fetch.
pub struct StorageObserver {
    storage: Arc<dyn Storage>,
}

impl StorageObserver {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }
}

impl AttemptObserver for StorageObserver {
    fn on_attempt(&self, record: &ApiCallRecord) {
        if let Err(e) = self.storage.record_api_call(record) {
            warn!(ticker = %record.ticker, attempt = record.attempt, error = %e, "failed to record API call");
        }
    }
}

/// Validate, score and persist a series that did not come from the provider,
/// such as a benchmark index CSV. The breaker is never consulted.
pub struct SeriesImporter {
    storage: Arc<dyn Storage>,
    validator: DataValidator,
    price_fields: Vec<PriceField>,
}

impl SeriesImporter {
    pub fn new(config: &QuantsimConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            validator: DataValidator::new(storage.clone()),
            storage,
            price_fields: config.validation.price_fields.clone(),
        }
    }

    /// Validate and score without persisting bars. Issues are still recorded.
    pub fn validate(
        &self,
        ticker: &str,
        bars: &[PriceBar],
    ) -> Result<(ValidationSummary, f64), ValidationError> {
        let summary = self.validator.validate(ticker, bars, &self.price_fields)?;
        let score = summary.report.quality_score()?;
        Ok((summary, score))
    }

    /// Bars are written only when validation and scoring succeed.
    pub fn import(&self, ticker: &str, bars: &[PriceBar]) -> Result<IngestReport, IngestError> {
        if ticker.trim().is_empty() {
            return Err(IngestError::EmptyTicker);
        }
        let (summary, quality_score, inserted) = self.store(ticker, bars)?;
        info!(ticker, bars = bars.len(), inserted, quality_score, "series imported");
        Ok(IngestReport {
            ticker: ticker.to_string(),
            bars: bars.len(),
            inserted,
            attempts: 0,
            quality: summary.report,
            quality_score,
        })
    }

    fn store(
        &self,
        ticker: &str,
        bars: &[PriceBar],
    ) -> Result<(ValidationSummary, f64, usize), IngestError> {
        let (summary, score) = self.validate(ticker, bars)?;
        let inserted = self.storage.upsert_daily_bars(ticker, bars)?;
        Ok((summary, score, inserted))
    }
}

pub struct IngestionController {
    provider: Arc<dyn DataProvider>,
    breaker: CircuitBreaker,
    importer: SeriesImporter,
    observer: StorageObserver,
    clock: Arc<dyn Clock>,
}

impl IngestionController {
    pub fn new(
        config: &QuantsimConfig,
        storage: Arc<dyn Storage>,
        provider: Arc<dyn DataProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            breaker: CircuitBreaker::new(storage.clone(), config.breaker.clone(), clock.clone()),
            importer: SeriesImporter::new(config, storage.clone()),
            observer: StorageObserver::new(storage),
            provider,
            clock,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Download, validate and persist daily bars for `ticker` over
    /// `[start, end]`.
    ///
    /// Exactly one breaker outcome is recorded per call that reaches the
    /// provider.
    pub fn download(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<IngestOutcome, IngestError> {
        if ticker.trim().is_empty() {
            return Err(IngestError::EmptyTicker);
        }
        if start > end {
            return Err(IngestError::InvalidRange { start, end });
        }

        self.breaker.initialize(ticker)?;
        match self.breaker.check_state(ticker) {
            Ok(_) => {}
            Err(BreakerError::Open { cooldown_end, .. }) => {
                info!(ticker, %cooldown_end, "skipping download, circuit open");
                return Ok(IngestOutcome::Skipped(SkipReason::CircuitOpen { cooldown_end }));
            }
            Err(e) => return Err(e.into()),
        }

        let fetched = match self.provider.fetch(ticker, start, end, &self.observer) {
            Ok(fetched) => fetched,
            Err(e) => {
                error!(ticker, provider = self.provider.name(), error = %e, "fetch failed");
                self.breaker.record_failure(ticker, self.clock.now())?;
                return Ok(IngestOutcome::Failed(e));
            }
        };

        // The upstream call succeeded even if what follows does not.
        let stored = self.importer.store(ticker, &fetched.bars);
        self.breaker.record_success(ticker)?;
        let (summary, quality_score, inserted) = stored?;

        info!(
            ticker,
            bars = fetched.bars.len(),
            inserted,
            quality_score,
            "download complete"
        );

        Ok(IngestOutcome::Completed(IngestReport {
            ticker: ticker.to_string(),
            bars: fetched.bars.len(),
            inserted,
            attempts: fetched.attempts,
            quality: summary.report,
            quality_score,
        }))
    }

    /// Validate and score a series without fetching or persisting bars.
    /// Issues are still recorded.
    pub fn validate_series(
        &self,
        ticker: &str,
        bars: &[PriceBar],
    ) -> Result<(ValidationSummary, f64), ValidationError> {
        self.importer.validate(ticker, bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::data::provider::FetchResult;
    use crate::domain::{date_to_timestamp, AttemptOutcome, CircuitState};
    use crate::storage::SqliteStorage;
    use chrono::{Duration, TimeZone};
    use parking_lot::Mutex;

    /// Replays a fixed sequence of fetch results and reports one attempt each.
    struct CannedProvider {
        results: Mutex<Vec<Result<Vec<PriceBar>, FetchError>>>,
        calls: Mutex<usize>,
    }

    impl CannedProvider {
        fn new(mut results: Vec<Result<Vec<PriceBar>, FetchError>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
                calls: Mutex::new(0),
            }
        }
    }

    impl DataProvider for CannedProvider {
        fn name(&self) -> &str {
            "canned"
        }

        fn fetch(
            &self,
            ticker: &str,
            _start: NaiveDate,
            _end: NaiveDate,
            observer: &dyn AttemptObserver,
        ) -> Result<FetchResult, FetchError> {
            *self.calls.lock() += 1;
            let next = self.results.lock().pop().unwrap_or_else(|| {
                Err(FetchError::NoData {
                    ticker: ticker.into(),
                    start: NaiveDate::MIN,
                    end: NaiveDate::MIN,
                })
            });
            observer.on_attempt(&ApiCallRecord {
                ticker: ticker.into(),
                attempt: 0,
                timestamp: Utc::now(),
                status_code: Some(200),
                latency_ms: 1.0,
                outcome: if next.is_ok() {
                    AttemptOutcome::Success
                } else {
                    AttemptOutcome::HttpError
                },
                message: None,
            });
            next.map(|bars| FetchResult {
                ticker: ticker.into(),
                bars,
                attempts: 1,
            })
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn week() -> Vec<PriceBar> {
        (1..=5)
            .map(|day| PriceBar {
                ticker: "SPY".into(),
                timestamp: date_to_timestamp(d(2024, 1, day)),
                open: 100.0 + day as f64,
                high: 101.0 + day as f64,
                low: 99.0 + day as f64,
                close: 100.5 + day as f64,
                volume: 1_000,
            })
            .collect()
    }

    fn exhausted() -> FetchError {
        FetchError::Exhausted {
            ticker: "SPY".into(),
            attempts: 5,
            last: crate::data::provider::AttemptFailure::HttpStatus { status: 503 },
        }
    }

    fn controller(
        results: Vec<Result<Vec<PriceBar>, FetchError>>,
    ) -> (IngestionController, Arc<SqliteStorage>, Arc<CannedProvider>, Arc<ManualClock>) {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let provider = Arc::new(CannedProvider::new(results));
        let clock = Arc::new(ManualClock::new(t0()));
        let c = IngestionController::new(
            &QuantsimConfig::default(),
            storage.clone(),
            provider.clone(),
            clock.clone(),
        );
        (c, storage, provider, clock)
    }

    #[test]
    fn completed_download_persists_and_closes() {
        let (c, storage, _, _) = controller(vec![Ok(week())]);
        let outcome = c.download("SPY", d(2024, 1, 1), d(2024, 1, 5)).unwrap();
        let report = match outcome {
            IngestOutcome::Completed(report) => report,
            other => panic!("expected Completed, got {other:?}"),
        };
        assert_eq!(report.bars, 5);
        assert_eq!(report.inserted, 5);
        assert_eq!(report.quality.total(), 0);
        assert_eq!(report.quality_score, 1.0);

        let stored = storage
            .get_historical_bars("SPY", i64::MIN, i64::MAX)
            .unwrap();
        assert_eq!(stored, week());
        assert_eq!(storage.get_circuit_state("SPY").unwrap().state, CircuitState::Closed);
        assert_eq!(storage.api_calls("SPY").unwrap().len(), 1);
    }

    #[test]
    fn rerun_is_idempotent() {
        let (c, storage, _, _) = controller(vec![Ok(week()), Ok(week())]);
        c.download("SPY", d(2024, 1, 1), d(2024, 1, 5)).unwrap();
        let second = c.download("SPY", d(2024, 1, 1), d(2024, 1, 5)).unwrap();
        match second {
            IngestOutcome::Completed(report) => assert_eq!(report.inserted, 0),
            other => panic!("expected Completed, got {other:?}"),
        }
        assert_eq!(
            storage.get_historical_bars("SPY", i64::MIN, i64::MAX).unwrap().len(),
            5
        );
    }

    #[test]
    fn fetch_failure_is_recorded_once() {
        let (c, storage, _, _) = controller(vec![Err(exhausted())]);
        let outcome = c.download("SPY", d(2024, 1, 1), d(2024, 1, 5)).unwrap();
        assert!(matches!(outcome, IngestOutcome::Failed(FetchError::Exhausted { .. })));
        let rec = storage.get_circuit_state("SPY").unwrap();
        assert_eq!(rec.failure_count, 1);
        assert_eq!(rec.last_failure_time, Some(t0()));
    }

    #[test]
    fn open_circuit_skips_without_calling_provider() {
        let (c, _, provider, clock) =
            controller(vec![Err(exhausted()), Err(exhausted()), Err(exhausted())]);
        for _ in 0..3 {
            c.download("SPY", d(2024, 1, 1), d(2024, 1, 5)).unwrap();
            clock.advance(Duration::minutes(1));
        }
        assert_eq!(*provider.calls.lock(), 3);

        let outcome = c.download("SPY", d(2024, 1, 1), d(2024, 1, 5)).unwrap();
        match outcome {
            IngestOutcome::Skipped(SkipReason::CircuitOpen { cooldown_end }) => {
                assert_eq!(cooldown_end, t0() + Duration::minutes(2) + Duration::hours(1));
            }
            other => panic!("expected Skipped, got {other:?}"),
        }
        assert_eq!(*provider.calls.lock(), 3);
    }

    #[test]
    fn half_open_probe_success_closes() {
        let (c, storage, _, clock) = controller(vec![
            Err(exhausted()),
            Err(exhausted()),
            Err(exhausted()),
            Ok(week()),
        ]);
        for _ in 0..3 {
            c.download("SPY", d(2024, 1, 1), d(2024, 1, 5)).unwrap();
        }
        clock.advance(Duration::hours(2));
        let outcome = c.download("SPY", d(2024, 1, 1), d(2024, 1, 5)).unwrap();
        assert!(outcome.is_completed());
        assert_eq!(storage.get_circuit_state("SPY").unwrap(), crate::domain::CircuitRecord::closed());
    }

    #[test]
    fn inverted_range_is_rejected_before_any_side_effect() {
        let (c, storage, provider, _) = controller(vec![Ok(week())]);
        let err = c.download("SPY", d(2024, 2, 1), d(2024, 1, 1)).unwrap_err();
        assert!(matches!(err, IngestError::InvalidRange { .. }));
        assert_eq!(*provider.calls.lock(), 0);
        assert!(matches!(
            storage.get_circuit_state("SPY"),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn validation_failure_after_fetch_still_records_success() {
        let mut bad = week();
        bad.swap(0, 1);
        let (c, storage, _, _) = controller(vec![Err(exhausted()), Ok(bad)]);
        c.download("SPY", d(2024, 1, 1), d(2024, 1, 5)).unwrap();
        assert_eq!(storage.get_circuit_state("SPY").unwrap().failure_count, 1);

        let err = c.download("SPY", d(2024, 1, 1), d(2024, 1, 5)).unwrap_err();
        assert!(matches!(err, IngestError::Validation(ValidationError::Precondition(_))));
        assert_eq!(storage.get_circuit_state("SPY").unwrap(), crate::domain::CircuitRecord::closed());
        assert!(storage
            .get_historical_bars("SPY", i64::MIN, i64::MAX)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn importer_persists_validated_series_without_breaker_row() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let importer = SeriesImporter::new(&QuantsimConfig::default(), storage.clone());
        let mut bars = week();
        bars.remove(2);

        let report = importer.import("SPY", &bars).unwrap();
        assert_eq!(report.inserted, 4);
        assert_eq!(report.attempts, 0);
        assert_eq!(report.quality.gap_count, 1);
        assert_eq!(report.quality_score, 0.95);
        assert_eq!(
            storage.get_historical_bars("SPY", i64::MIN, i64::MAX).unwrap(),
            bars
        );
        assert!(matches!(
            storage.get_circuit_state("SPY"),
            Err(StorageError::NotFound { .. })
        ));

        assert!(matches!(importer.import(" ", &bars), Err(IngestError::EmptyTicker)));
    }

    #[test]
    fn importer_stores_nothing_when_score_is_negative() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let importer = SeriesImporter::new(&QuantsimConfig::default(), storage.clone());
        // First and last business day of ~5 weeks: 23 interior gaps
        let bars: Vec<PriceBar> = [d(2024, 1, 1), d(2024, 2, 2)]
            .into_iter()
            .map(|day| PriceBar {
                ticker: "SPY".into(),
                timestamp: date_to_timestamp(day),
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1,
            })
            .collect();

        let err = importer.import("SPY", &bars).unwrap_err();
        assert!(matches!(
            err,
            IngestError::Validation(ValidationError::NegativeQualityScore { .. })
        ));
        assert!(storage
            .get_historical_bars("SPY", i64::MIN, i64::MAX)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn validate_series_does_not_persist_bars() {
        let (c, storage, provider, _) = controller(vec![]);
        let mut bars = week();
        bars.remove(2);
        let (summary, score) = c.validate_series("SPY", &bars).unwrap();
        assert_eq!(summary.report.gap_count, 1);
        assert!((score - 0.95).abs() < 1e-12);
        assert_eq!(*provider.calls.lock(), 0);
        assert_eq!(storage.validation_issues("SPY").unwrap().len(), 1);
        assert!(storage
            .get_historical_bars("SPY", i64::MIN, i64::MAX)
            .unwrap()
            .is_empty());
    }
}
