//! PriceBar: one daily OHLCV observation as persisted.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const SECS_PER_DAY: i64 = 86_400;

/// OHLCV bar for a single ticker on a single trading day.
///
/// `(ticker, timestamp)` is the natural key. `timestamp` is unix seconds at
/// midnight UTC of the trading date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub ticker: String,
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl PriceBar {
    /// Trading date of this bar (UTC).
    pub fn date(&self) -> Option<NaiveDate> {
        timestamp_to_date(self.timestamp)
    }

    /// Price for the requested field.
    pub fn price(&self, field: PriceField) -> f64 {
        match field {
            PriceField::Open => self.open,
            PriceField::High => self.high,
            PriceField::Low => self.low,
            PriceField::Close => self.close,
        }
    }
}

/// Unix seconds at midnight UTC for a date.
pub fn date_to_timestamp(date: NaiveDate) -> i64 {
    date.and_time(chrono::NaiveTime::MIN).and_utc().timestamp()
}

/// Calendar date (UTC) containing a unix-seconds timestamp.
pub fn timestamp_to_date(ts: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp(ts, 0).map(|dt| dt.date_naive())
}

/// Truncate a unix-seconds timestamp to midnight UTC.
pub fn normalize_to_day(ts: i64) -> i64 {
    ts.div_euclid(SECS_PER_DAY) * SECS_PER_DAY
}

/// Price column selectable for the outlier audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceField {
    Open,
    High,
    Low,
    Close,
}

impl PriceField {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceField::Open => "open",
            PriceField::High => "high",
            PriceField::Low => "low",
            PriceField::Close => "close",
        }
    }
}

impl fmt::Display for PriceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriceField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(PriceField::Open),
            "high" => Ok(PriceField::High),
            "low" => Ok(PriceField::Low),
            "close" => Ok(PriceField::Close),
            other => Err(format!("unknown price field '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bar() -> PriceBar {
        PriceBar {
            ticker: "SPY".into(),
            timestamp: date_to_timestamp(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
            open: 100.0,
            high: 105.0,
            low: 98.0,
            close: 103.0,
            volume: 50_000,
        }
    }

    #[test]
    fn timestamp_is_midnight_utc() {
        let bar = sample_bar();
        assert_eq!(bar.timestamp, 1_704_153_600);
        assert_eq!(bar.date(), NaiveDate::from_ymd_opt(2024, 1, 2));
    }

    #[test]
    fn normalize_truncates_intraday_seconds() {
        assert_eq!(normalize_to_day(1_704_153_600 + 3_600 * 15), 1_704_153_600);
        assert_eq!(normalize_to_day(1_704_153_600), 1_704_153_600);
    }

    #[test]
    fn price_field_selects_column() {
        let bar = sample_bar();
        assert_eq!(bar.price(PriceField::Open), 100.0);
        assert_eq!(bar.price(PriceField::Close), 103.0);
        assert_eq!("HIGH".parse::<PriceField>().unwrap(), PriceField::High);
        assert!("vwap".parse::<PriceField>().is_err());
    }
}
