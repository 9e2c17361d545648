//! SQLite schema for price rows, breaker state, validation issues and API call metrics.
//!
//! Every statement is idempotent so opening an existing database is a no-op.

/// Pragmas applied to file-backed databases only (WAL is meaningless in memory).
pub const FILE_PRAGMAS_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
"#;

pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS price_data (
    ticker TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume INTEGER NOT NULL,
    PRIMARY KEY (ticker, timestamp)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS circuit_breaker_states (
    ticker TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    failure_count INTEGER NOT NULL DEFAULT 0,
    last_fail_time INTEGER,
    cooldown_end_time INTEGER
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS validation_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL,
    date INTEGER NOT NULL,
    issue_type TEXT NOT NULL,
    description TEXT,
    resolved INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_validation_log_ticker_resolved
    ON validation_log(ticker, resolved);

CREATE TABLE IF NOT EXISTS api_call_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    timestamp INTEGER NOT NULL,
    status_code INTEGER,
    latency_ms REAL NOT NULL,
    outcome TEXT NOT NULL,
    message TEXT
);

CREATE INDEX IF NOT EXISTS idx_api_call_metrics_ticker_ts
    ON api_call_metrics(ticker, timestamp DESC);
"#;
