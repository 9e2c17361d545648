//! Validation issues and per-attempt API call records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Data-quality defect class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueType {
    MissingDay,
    Outlier5Sd,
    StalePrice,
}

impl IssueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::MissingDay => "MISSING_DAY",
            IssueType::Outlier5Sd => "OUTLIER_5SD",
            IssueType::StalePrice => "STALE_PRICE",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MISSING_DAY" => Ok(IssueType::MissingDay),
            "OUTLIER_5SD" => Ok(IssueType::Outlier5Sd),
            "STALE_PRICE" => Ok(IssueType::StalePrice),
            other => Err(format!("unknown issue type '{other}'")),
        }
    }
}

/// A flagged data-quality defect for one ticker on one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub ticker: String,
    /// Unix seconds (midnight UTC for daily bars).
    pub date: i64,
    pub issue_type: IssueType,
    pub description: String,
    pub resolved: bool,
}

impl ValidationIssue {
    pub fn new(ticker: &str, date: i64, issue_type: IssueType, description: impl Into<String>) -> Self {
        Self {
            ticker: ticker.to_string(),
            date,
            issue_type,
            description: description.into(),
            resolved: false,
        }
    }
}

/// How a single upstream attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Success,
    RateLimited,
    UpstreamError,
    HttpError,
    UnexpectedShape,
    Transport,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "SUCCESS",
            AttemptOutcome::RateLimited => "RATE_LIMITED",
            AttemptOutcome::UpstreamError => "UPSTREAM_ERROR",
            AttemptOutcome::HttpError => "HTTP_ERROR",
            AttemptOutcome::UnexpectedShape => "UNEXPECTED_SHAPE",
            AttemptOutcome::Transport => "TRANSPORT",
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(AttemptOutcome::Success),
            "RATE_LIMITED" => Ok(AttemptOutcome::RateLimited),
            "UPSTREAM_ERROR" => Ok(AttemptOutcome::UpstreamError),
            "HTTP_ERROR" => Ok(AttemptOutcome::HttpError),
            "UNEXPECTED_SHAPE" => Ok(AttemptOutcome::UnexpectedShape),
            "TRANSPORT" => Ok(AttemptOutcome::Transport),
            other => Err(format!("unknown attempt outcome '{other}'")),
        }
    }
}

/// One row of API call metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCallRecord {
    pub ticker: String,
    /// 0-based attempt index within one logical fetch.
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub latency_ms: f64,
    pub outcome: AttemptOutcome,
    pub message: Option<String>,
}
