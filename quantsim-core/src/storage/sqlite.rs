//! SQLite-backed `Storage`.

use super::schema::{FILE_PRAGMAS_SQL, SCHEMA_SQL};
use super::{Storage, StorageError};
use crate::domain::{
    ApiCallRecord, AttemptOutcome, CircuitRecord, CircuitState, IssueType, PriceBar,
    ValidationIssue,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, info};

/// Storage over a single SQLite connection.
///
/// The connection sits behind a mutex so the store can be shared as
/// `Arc<dyn Storage>`. Each method is one statement or one transaction.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) a database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(FILE_PRAGMAS_SQL)?;
        conn.execute_batch(SCHEMA_SQL)?;
        info!(path = %path.display(), "database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database, used by tests and the offline `validate` path.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// API call metrics for a ticker, oldest first.
    pub fn api_calls(&self, ticker: &str) -> Result<Vec<ApiCallRecord>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT attempt, timestamp, status_code, latency_ms, outcome, message
             FROM api_call_metrics WHERE ticker = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![ticker], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<u16>>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (attempt, ts, status_code, latency_ms, outcome, message) = row?;
            let outcome = outcome
                .parse::<AttemptOutcome>()
                .map_err(|reason| corrupt(ticker, reason))?;
            out.push(ApiCallRecord {
                ticker: ticker.to_string(),
                attempt,
                timestamp: from_unix(ticker, ts)?,
                status_code,
                latency_ms,
                outcome,
                message,
            });
        }
        Ok(out)
    }
}

fn corrupt(ticker: &str, reason: impl Into<String>) -> StorageError {
    StorageError::Corrupt {
        ticker: ticker.to_string(),
        reason: reason.into(),
    }
}

fn mismatch(expected: &str, found: &str) -> StorageError {
    StorageError::TickerMismatch {
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

fn from_unix(ticker: &str, secs: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| corrupt(ticker, format!("timestamp out of range: {secs}")))
}

/// Rebuild a breaker record from its persisted columns.
fn decode_circuit(
    ticker: &str,
    state: &str,
    failure_count: u32,
    last_fail_time: Option<i64>,
    cooldown_end_time: Option<i64>,
) -> Result<CircuitRecord, StorageError> {
    let state = match (state, cooldown_end_time) {
        ("CLOSED", _) => CircuitState::Closed,
        ("HALF_OPEN", _) => CircuitState::HalfOpen,
        ("OPEN", Some(end)) => CircuitState::Open {
            cooldown_end: from_unix(ticker, end)?,
        },
        ("OPEN", None) => return Err(corrupt(ticker, "OPEN state without cooldown end")),
        (other, _) => return Err(corrupt(ticker, format!("unknown circuit state '{other}'"))),
    };
    let last_failure_time = last_fail_time.map(|t| from_unix(ticker, t)).transpose()?;
    Ok(CircuitRecord {
        state,
        failure_count,
        last_failure_time,
    })
}

impl Storage for SqliteStorage {
    fn get_circuit_state(&self, ticker: &str) -> Result<CircuitRecord, StorageError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT state, failure_count, last_fail_time, cooldown_end_time
                 FROM circuit_breaker_states WHERE ticker = ?1",
                params![ticker],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((state, count, last_fail, cooldown_end)) => {
                decode_circuit(ticker, &state, count, last_fail, cooldown_end)
            }
            None => Err(StorageError::NotFound {
                ticker: ticker.to_string(),
            }),
        }
    }

    fn set_circuit_state(&self, ticker: &str, record: &CircuitRecord) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO circuit_breaker_states
                 (ticker, state, failure_count, last_fail_time, cooldown_end_time)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(ticker) DO UPDATE SET
                 state = excluded.state,
                 failure_count = excluded.failure_count,
                 last_fail_time = excluded.last_fail_time,
                 cooldown_end_time = excluded.cooldown_end_time",
            params![
                ticker,
                record.state.tag(),
                record.failure_count,
                record.last_failure_time.map(|t| t.timestamp()),
                record.state.cooldown_end().map(|t| t.timestamp()),
            ],
        )?;
        Ok(())
    }

    fn upsert_daily_bars(&self, ticker: &str, bars: &[PriceBar]) -> Result<usize, StorageError> {
        if let Some(foreign) = bars.iter().find(|b| b.ticker != ticker) {
            return Err(mismatch(ticker, &foreign.ticker));
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO price_data
                     (ticker, timestamp, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for bar in bars {
                inserted += stmt.execute(params![
                    ticker,
                    bar.timestamp,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                ])?;
            }
        }
        tx.commit()?;
        debug!(ticker, offered = bars.len(), inserted, "price rows upserted");
        Ok(inserted)
    }

    fn get_historical_bars(
        &self,
        ticker: &str,
        start_ts: i64,
        end_ts: i64,
    ) -> Result<Vec<PriceBar>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp, open, high, low, close, volume FROM price_data
             WHERE ticker = ?1 AND timestamp BETWEEN ?2 AND ?3
             ORDER BY timestamp",
        )?;
        let rows = stmt.query_map(params![ticker, start_ts, end_ts], |row| {
            Ok(PriceBar {
                ticker: ticker.to_string(),
                timestamp: row.get(0)?,
                open: row.get(1)?,
                high: row.get(2)?,
                low: row.get(3)?,
                close: row.get(4)?,
                volume: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn delete_unresolved_issues(&self, ticker: &str) -> Result<usize, StorageError> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM validation_log WHERE ticker = ?1 AND resolved = 0",
            params![ticker],
        )?;
        Ok(deleted)
    }

    fn insert_validation_issue(
        &self,
        ticker: &str,
        date: i64,
        issue_type: IssueType,
        description: &str,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO validation_log (ticker, date, issue_type, description)
             VALUES (?1, ?2, ?3, ?4)",
            params![ticker, date, issue_type.as_str(), description],
        )?;
        Ok(())
    }

    fn replace_unresolved_issues(
        &self,
        ticker: &str,
        issues: &[ValidationIssue],
    ) -> Result<usize, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let deleted = tx.execute(
            "DELETE FROM validation_log WHERE ticker = ?1 AND resolved = 0",
            params![ticker],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO validation_log (ticker, date, issue_type, description)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for issue in issues {
                // Dropping `tx` on this early return rolls the delete back.
                if issue.ticker != ticker {
                    return Err(mismatch(ticker, &issue.ticker));
                }
                stmt.execute(params![
                    ticker,
                    issue.date,
                    issue.issue_type.as_str(),
                    issue.description,
                ])?;
            }
        }
        tx.commit()?;
        debug!(ticker, deleted, inserted = issues.len(), "issue log replaced");
        Ok(deleted)
    }

    fn validation_issues(&self, ticker: &str) -> Result<Vec<ValidationIssue>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT date, issue_type, description, resolved FROM validation_log
             WHERE ticker = ?1 ORDER BY date, id",
        )?;
        let rows = stmt.query_map(params![ticker], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, bool>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (date, issue_type, description, resolved) = row?;
            let issue_type = issue_type
                .parse::<IssueType>()
                .map_err(|reason| corrupt(ticker, reason))?;
            out.push(ValidationIssue {
                ticker: ticker.to_string(),
                date,
                issue_type,
                description: description.unwrap_or_default(),
                resolved,
            });
        }
        Ok(out)
    }

    fn record_api_call(&self, record: &ApiCallRecord) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO api_call_metrics
                 (ticker, attempt, timestamp, status_code, latency_ms, outcome, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.ticker,
                record.attempt,
                record.timestamp.timestamp(),
                record.status_code,
                record.latency_ms,
                record.outcome.as_str(),
                record.message,
            ],
        )?;
        Ok(())
    }
}
