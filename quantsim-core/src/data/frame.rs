//! CSV ↔ DataFrame ↔ price series conversion for the offline path.
//!
//! Expected columns: `timestamp` (or `date`), `open`, `high`, `low`, `close`,
//! `volume`. Timestamps may be unix seconds, `YYYY-MM-DD`, `DD-Mon-YYYY`, or
//! RFC 3339.

use super::validator::{PreconditionError, ValidationError};
use crate::domain::{date_to_timestamp, normalize_to_day, PriceBar};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use std::path::Path;
use tracing::debug;

const TIMESTAMP_COLUMNS: [&str; 2] = ["timestamp", "date"];
const PRICE_COLUMNS: [&str; 4] = ["open", "high", "low", "close"];
const VOLUME_COLUMN: &str = "volume";

/// Read a CSV file with a header row into a DataFrame.
pub fn read_csv(path: &Path) -> Result<DataFrame, ValidationError> {
    let unreadable = |e: PolarsError| PreconditionError::Unreadable {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))
        .map_err(unreadable)?
        .finish()
        .map_err(unreadable)?;
    debug!(path = %path.display(), rows = df.height(), "csv loaded");
    Ok(df)
}

/// Check that every required column is present.
pub fn check_columns(df: &DataFrame) -> Result<&'static str, PreconditionError> {
    let schema = df.schema();
    let ts_column = TIMESTAMP_COLUMNS
        .into_iter()
        .find(|c| schema.contains(c))
        .ok_or_else(|| PreconditionError::MissingColumn {
            column: "timestamp".into(),
        })?;
    for column in PRICE_COLUMNS.iter().chain([&VOLUME_COLUMN]) {
        if !schema.contains(column) {
            return Err(PreconditionError::MissingColumn {
                column: column.to_string(),
            });
        }
    }
    Ok(ts_column)
}

/// Convert a DataFrame into bars for `ticker`, sorted by timestamp.
///
/// Timestamps are normalized to midnight UTC. Null or unparseable cells are
/// precondition errors naming the column.
pub fn frame_to_bars(df: &DataFrame, ticker: &str) -> Result<Vec<PriceBar>, ValidationError> {
    let ts_column = check_columns(df)?;

    let timestamps = timestamp_column(df, ts_column)?;
    let [open, high, low, close] = PRICE_COLUMNS.map(|c| float_column(df, c));
    let (open, high, low, close) = (open?, high?, low?, close?);
    let volume = float_column(df, VOLUME_COLUMN)?;

    let mut bars: Vec<PriceBar> = (0..df.height())
        .map(|i| PriceBar {
            ticker: ticker.to_string(),
            timestamp: timestamps[i],
            open: open[i],
            high: high[i],
            low: low[i],
            close: close[i],
            volume: volume[i].round() as i64,
        })
        .collect();
    bars.sort_by_key(|b| b.timestamp);
    Ok(bars)
}

/// Load a CSV file straight into bars.
pub fn load_csv_bars(path: &Path, ticker: &str) -> Result<Vec<PriceBar>, ValidationError> {
    let df = read_csv(path)?;
    frame_to_bars(&df, ticker)
}

/// Bars as a DataFrame with a `date` column, for display and export.
pub fn bars_to_frame(bars: &[PriceBar]) -> PolarsResult<DataFrame> {
    let dates: Vec<Option<String>> = bars
        .iter()
        .map(|b| b.date().map(|d| d.format("%Y-%m-%d").to_string()))
        .collect();
    let col = |name: &str, values: Vec<f64>| Column::new(name.into(), values);
    DataFrame::new(vec![
        Column::new("date".into(), dates),
        col("open", bars.iter().map(|b| b.open).collect()),
        col("high", bars.iter().map(|b| b.high).collect()),
        col("low", bars.iter().map(|b| b.low).collect()),
        col("close", bars.iter().map(|b| b.close).collect()),
        Column::new(
            "volume".into(),
            bars.iter().map(|b| b.volume).collect::<Vec<i64>>(),
        ),
    ])
}

fn bad_column(column: &str, reason: impl ToString) -> PreconditionError {
    PreconditionError::BadColumn {
        column: column.to_string(),
        reason: reason.to_string(),
    }
}

fn float_column(df: &DataFrame, name: &str) -> Result<Vec<f64>, PreconditionError> {
    let series = df
        .column(name)
        .map_err(|_| PreconditionError::MissingColumn {
            column: name.to_string(),
        })?
        .as_materialized_series()
        .cast(&DataType::Float64)
        .map_err(|e| bad_column(name, e))?;
    let values = series.f64().map_err(|e| bad_column(name, e))?;
    values
        .into_iter()
        .enumerate()
        .map(|(row, v)| v.ok_or_else(|| bad_column(name, format!("null or non-numeric at row {row}"))))
        .collect()
}

fn timestamp_column(df: &DataFrame, name: &str) -> Result<Vec<i64>, PreconditionError> {
    let series = df
        .column(name)
        .map_err(|_| PreconditionError::MissingColumn {
            column: name.to_string(),
        })?
        .as_materialized_series()
        .cast(&DataType::String)
        .map_err(|e| bad_column(name, e))?;
    let values = series.str().map_err(|e| bad_column(name, e))?;
    values
        .into_iter()
        .enumerate()
        .map(|(row, v)| {
            v.and_then(parse_timestamp)
                .ok_or_else(|| bad_column(name, format!("unparseable timestamp at row {row}")))
        })
        .collect()
}

/// Unix seconds, a calendar date (`2024-01-02` or exchange-style
/// `02-Jan-2024`), or an RFC 3339 / naive datetime, normalized to midnight UTC.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return Some(normalize_to_day(secs));
    }
    for format in ["%Y-%m-%d", "%d-%b-%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date_to_timestamp(date));
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(normalize_to_day(dt.timestamp()));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|dt| normalize_to_day(dt.and_utc().timestamp()))
}
