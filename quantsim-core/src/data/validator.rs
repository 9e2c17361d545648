//! Data-quality audits over a daily price series.
//!
//! Three independent checks, none of which modify the series:
//! - gaps: business days (Mon–Fri) missing between the first and last bar
//! - outliers: percentage returns strictly outside mean ± 5σ of the series
//! - staleness: runs of ≥5 identical closes where every bar traded zero volume
//!
//! Each validation pass swaps the ticker's unresolved issues for the ones it
//! found in a single storage transaction, so the issue log always reflects
//! the latest complete run only.

use crate::domain::{
    date_to_timestamp, timestamp_to_date, IssueType, PriceBar, PriceField, ValidationIssue,
};
use crate::storage::{Storage, StorageError};
use chrono::{Datelike, NaiveDate, Weekday};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Outlier threshold in standard deviations.
pub const OUTLIER_SIGMAS: f64 = 5.0;
/// Minimum length of an identical-close, zero-volume run.
pub const STALE_RUN_MIN: usize = 5;

// Penalties in hundredths of a point, so a score of exactly zero stays zero.
const GAP_PENALTY: usize = 5;
const OUTLIER_PENALTY: usize = 10;
const STALE_PENALTY: usize = 2;
const FULL_SCORE: usize = 100;

/// The input cannot be audited at all.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PreconditionError {
    #[error("empty series for '{ticker}'")]
    EmptySeries { ticker: String },

    #[error("timestamps not strictly ascending at row {index} ({previous} then {current})")]
    NotAscending {
        index: usize,
        previous: i64,
        current: i64,
    },

    #[error("no price fields requested for the outlier audit")]
    NoPriceFields,

    #[error("row {index} belongs to '{found}', expected '{expected}'")]
    TickerMismatch {
        index: usize,
        expected: String,
        found: String,
    },

    #[error("timestamp {timestamp} at row {index} is out of range")]
    BadTimestamp { index: usize, timestamp: i64 },

    #[error("cannot read {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("missing required column '{column}'")]
    MissingColumn { column: String },

    #[error("column '{column}': {reason}")]
    BadColumn { column: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("validation precondition: {0}")]
    Precondition(#[from] PreconditionError),

    #[error("quality score {score:.2} is below zero")]
    NegativeQualityScore { score: f64 },

    #[error("validation storage: {0}")]
    Storage(#[from] StorageError),
}

/// Issue counts from one validation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QualityReport {
    pub gap_count: usize,
    pub outlier_count: usize,
    pub stale_count: usize,
}

impl QualityReport {
    /// `1 - 0.05·gaps - 0.10·outliers - 0.02·stale`.
    ///
    /// A negative score is an error, never clamped to zero.
    pub fn quality_score(&self) -> Result<f64, ValidationError> {
        let penalty = self.penalty_hundredths();
        match penalty.and_then(|p| FULL_SCORE.checked_sub(p)) {
            Some(hundredths) => Ok(hundredths as f64 / 100.0),
            None => {
                let penalty = penalty.map_or(f64::INFINITY, |p| p as f64);
                Err(ValidationError::NegativeQualityScore {
                    score: (FULL_SCORE as f64 - penalty) / 100.0,
                })
            }
        }
    }

    /// Total penalty in hundredths; `None` on overflow.
    fn penalty_hundredths(&self) -> Option<usize> {
        let gaps = self.gap_count.checked_mul(GAP_PENALTY)?;
        let outliers = self.outlier_count.checked_mul(OUTLIER_PENALTY)?;
        let stale = self.stale_count.checked_mul(STALE_PENALTY)?;
        gaps.checked_add(outliers)?.checked_add(stale)
    }

    pub fn total(&self) -> usize {
        self.gap_count + self.outlier_count + self.stale_count
    }
}

/// Result of one `validate` call.
#[derive(Debug, Clone)]
pub struct ValidationSummary {
    pub ticker: String,
    pub bars: usize,
    pub report: QualityReport,
    /// Issues in the order they were recorded: gaps, outliers, stale.
    pub issues: Vec<ValidationIssue>,
}

/// Population statistics of a return series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReturnStats {
    pub mean: f64,
    pub std_dev: f64,
    pub count: usize,
}

impl ReturnStats {
    /// `None` for fewer than two returns.
    pub fn from_returns(returns: &[f64]) -> Option<Self> {
        if returns.len() < 2 {
            return None;
        }
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            mean,
            std_dev: var.sqrt(),
            count: returns.len(),
        })
    }

    pub fn upper_bound(&self) -> f64 {
        self.mean + OUTLIER_SIGMAS * self.std_dev
    }

    pub fn lower_bound(&self) -> f64 {
        self.mean - OUTLIER_SIGMAS * self.std_dev
    }

    /// Strictly outside the band; a value on a bound is not an outlier.
    pub fn is_outlier(&self, value: f64) -> bool {
        value > self.upper_bound() || value < self.lower_bound()
    }
}

pub struct DataValidator {
    storage: Arc<dyn Storage>,
}

impl DataValidator {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Audit `bars` for `ticker`, replacing its unresolved issues with the ones
    /// found by this pass.
    pub fn validate(
        &self,
        ticker: &str,
        bars: &[PriceBar],
        fields: &[PriceField],
    ) -> Result<ValidationSummary, ValidationError> {
        check_preconditions(ticker, bars, fields)?;

        let mut issues = Vec::new();
        let mut report = QualityReport::default();

        for day in find_missing_days(bars) {
            issues.push(ValidationIssue::new(
                ticker,
                date_to_timestamp(day),
                IssueType::MissingDay,
                "Missing OHLCV data for this trading day",
            ));
            report.gap_count += 1;
        }

        for &field in fields {
            let Some(stats) = return_stats(bars, field) else {
                debug!(ticker, field = %field, "too few returns for outlier audit");
                continue;
            };
            for (index, ret) in find_outliers(bars, field, &stats) {
                issues.push(ValidationIssue::new(
                    ticker,
                    bars[index].timestamp,
                    IssueType::Outlier5Sd,
                    format!(
                        "{field} return {:.4}% outside [{:.4}%, {:.4}%] (5 sd)",
                        ret * 100.0,
                        stats.lower_bound() * 100.0,
                        stats.upper_bound() * 100.0
                    ),
                ));
                report.outlier_count += 1;
            }
        }

        for run in find_stale_runs(bars) {
            let len = run.len();
            for index in run {
                issues.push(ValidationIssue::new(
                    ticker,
                    bars[index].timestamp,
                    IssueType::StalePrice,
                    format!(
                        "Stale close {} with zero volume for {len} consecutive bars",
                        bars[index].close
                    ),
                ));
                report.stale_count += 1;
            }
        }

        let cleared = self.storage.replace_unresolved_issues(ticker, &issues)?;
        debug!(ticker, cleared, recorded = issues.len(), "unresolved issues replaced");

        info!(
            ticker,
            bars = bars.len(),
            gaps = report.gap_count,
            outliers = report.outlier_count,
            stale = report.stale_count,
            "validation complete"
        );

        Ok(ValidationSummary {
            ticker: ticker.to_string(),
            bars: bars.len(),
            report,
            issues,
        })
    }
}

fn check_preconditions(
    ticker: &str,
    bars: &[PriceBar],
    fields: &[PriceField],
) -> Result<(), PreconditionError> {
    if bars.is_empty() {
        return Err(PreconditionError::EmptySeries {
            ticker: ticker.to_string(),
        });
    }
    if fields.is_empty() {
        return Err(PreconditionError::NoPriceFields);
    }
    for (index, bar) in bars.iter().enumerate() {
        if bar.ticker != ticker {
            return Err(PreconditionError::TickerMismatch {
                index,
                expected: ticker.to_string(),
                found: bar.ticker.clone(),
            });
        }
        if bar.date().is_none() {
            return Err(PreconditionError::BadTimestamp {
                index,
                timestamp: bar.timestamp,
            });
        }
    }
    for (index, pair) in bars.windows(2).enumerate() {
        if pair[1].timestamp <= pair[0].timestamp {
            return Err(PreconditionError::NotAscending {
                index: index + 1,
                previous: pair[0].timestamp,
                current: pair[1].timestamp,
            });
        }
    }
    Ok(())
}

fn is_business_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Business days between the first and last bar with no bar, ascending.
///
/// Exchange holidays are not known, so they show up as gaps.
pub fn find_missing_days(bars: &[PriceBar]) -> Vec<NaiveDate> {
    let present: BTreeSet<NaiveDate> = bars.iter().filter_map(PriceBar::date).collect();
    let (Some(&first), Some(&last)) = (present.first(), present.last()) else {
        return Vec::new();
    };
    first
        .iter_days()
        .take_while(|d| *d <= last)
        .filter(|d| is_business_day(*d) && !present.contains(d))
        .collect()
}

/// `(index, return)` for every finite percentage return of `field`, where the
/// index is the bar the return ends on.
pub fn pct_returns(bars: &[PriceBar], field: PriceField) -> Vec<(usize, f64)> {
    bars.windows(2)
        .enumerate()
        .filter_map(|(i, pair)| {
            let ret = pair[1].price(field) / pair[0].price(field) - 1.0;
            ret.is_finite().then_some((i + 1, ret))
        })
        .collect()
}

pub fn return_stats(bars: &[PriceBar], field: PriceField) -> Option<ReturnStats> {
    let returns: Vec<f64> = pct_returns(bars, field).into_iter().map(|(_, r)| r).collect();
    ReturnStats::from_returns(&returns)
}

pub fn find_outliers(
    bars: &[PriceBar],
    field: PriceField,
    stats: &ReturnStats,
) -> Vec<(usize, f64)> {
    pct_returns(bars, field)
        .into_iter()
        .filter(|(_, r)| stats.is_outlier(*r))
        .collect()
}

/// Index ranges of identical-close runs of at least `STALE_RUN_MIN` bars in
/// which every bar has zero volume.
pub fn find_stale_runs(bars: &[PriceBar]) -> Vec<std::ops::Range<usize>> {
    let mut runs = Vec::new();
    let mut start = 0;
    for i in 1..=bars.len() {
        let boundary = i == bars.len() || bars[i].close != bars[i - 1].close;
        if !boundary {
            continue;
        }
        let run = start..i;
        if run.len() >= STALE_RUN_MIN && bars[run.clone()].iter().all(|b| b.volume == 0) {
            runs.push(run);
        }
        start = i;
    }
    runs
}

/// Date of an issue row, for display.
pub fn issue_date(issue: &ValidationIssue) -> Option<NaiveDate> {
    timestamp_to_date(issue.date)
}
