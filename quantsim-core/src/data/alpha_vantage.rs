//! Alpha Vantage `TIME_SERIES_DAILY` provider.
//!
//! One logical fetch is a bounded retry loop. Each attempt is classified as
//! data, an outright rejection, or a retryable failure (transport, non-2xx,
//! rate-limit note, unknown body). Retryable failures back off
//! `base_delay * 2^attempt` before the next attempt, including after the last
//! one.

use super::provider::{AttemptFailure, AttemptObserver, DataProvider, FetchError, FetchResult};
use super::transport::{HttpResponse, HttpTransport, Sleeper, TransportError};
use crate::clock::Clock;
use crate::config::{ConfigError, OutputSize, QuantsimConfig, RetryConfig, MAX_ATTEMPTS};
use crate::domain::{date_to_timestamp, ApiCallRecord, AttemptOutcome, PriceBar};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const SERIES_KEY: &str = "Time Series (Daily)";
const ERROR_KEY: &str = "Error Message";
const RATE_LIMIT_KEYS: [&str; 2] = ["Note", "Information"];

/// One day of the provider's payload. Every value arrives as a string.
#[derive(Debug, Deserialize)]
struct DailyEntry {
    #[serde(rename = "1. open")]
    open: String,
    #[serde(rename = "2. high")]
    high: String,
    #[serde(rename = "3. low")]
    low: String,
    #[serde(rename = "4. close")]
    close: String,
    #[serde(rename = "5. volume")]
    volume: String,
}

/// What a single attempt produced.
enum Classified {
    Series(Value),
    Rejected(String),
    Retry(AttemptFailure),
}

pub struct AlphaVantageFetcher {
    base_url: String,
    api_key: String,
    symbol_suffix: String,
    output_size: OutputSize,
    retry: RetryConfig,
    transport: Arc<dyn HttpTransport>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
}

impl AlphaVantageFetcher {
    pub fn new(
        config: &QuantsimConfig,
        transport: Arc<dyn HttpTransport>,
        sleeper: Arc<dyn Sleeper>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let api_key = config
            .api
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "no API key: set {} or api.api_key",
                    crate::config::API_KEY_ENV
                ))
            })?;
        Ok(Self {
            base_url: config.api.base_url.trim_end_matches('/').to_string(),
            api_key,
            symbol_suffix: config.api.symbol_suffix.clone().unwrap_or_default(),
            output_size: config.api.output_size,
            retry: config.retry.clone(),
            transport,
            sleeper,
            clock,
        })
    }

    fn query_url(&self) -> String {
        format!("{}/query", self.base_url)
    }

    fn query_params(&self, ticker: &str) -> Vec<(&'static str, String)> {
        vec![
            ("function", "TIME_SERIES_DAILY".to_string()),
            ("symbol", format!("{ticker}{}", self.symbol_suffix)),
            ("outputsize", self.output_size.as_str().to_string()),
            ("apikey", self.api_key.clone()),
        ]
    }

    fn classify(result: Result<HttpResponse, TransportError>) -> Classified {
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => return Classified::Retry(AttemptFailure::Transport(e)),
        };
        if !resp.is_success() {
            return Classified::Retry(AttemptFailure::HttpStatus {
                status: resp.status,
            });
        }

        let mut body: Map<String, Value> = match serde_json::from_str(&resp.body) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                return Classified::Retry(AttemptFailure::UnexpectedShape(
                    "body is not a JSON object".into(),
                ))
            }
            Err(e) => {
                return Classified::Retry(AttemptFailure::UnexpectedShape(format!(
                    "body is not JSON: {e}"
                )))
            }
        };

        if let Some(msg) = body.get(ERROR_KEY) {
            return Classified::Rejected(text_of(msg));
        }
        if let Some(note) = RATE_LIMIT_KEYS.iter().find_map(|k| body.get(*k)) {
            return Classified::Retry(AttemptFailure::RateLimited(text_of(note)));
        }
        match body.remove(SERIES_KEY) {
            Some(series) => Classified::Series(series),
            None => {
                let keys: Vec<&str> = body.keys().map(String::as_str).collect();
                Classified::Retry(AttemptFailure::UnexpectedShape(format!(
                    "no '{SERIES_KEY}' key (keys: {keys:?})"
                )))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        observer: &dyn AttemptObserver,
        ticker: &str,
        attempt: u32,
        status_code: Option<u16>,
        started: Instant,
        outcome: AttemptOutcome,
        message: Option<String>,
    ) {
        observer.on_attempt(&ApiCallRecord {
            ticker: ticker.to_string(),
            attempt,
            timestamp: self.clock.now(),
            status_code,
            latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            outcome,
            message,
        });
    }
}

impl DataProvider for AlphaVantageFetcher {
    fn name(&self) -> &str {
        "Alpha Vantage"
    }

    fn fetch(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
        observer: &dyn AttemptObserver,
    ) -> Result<FetchResult, FetchError> {
        let url = self.query_url();
        let query = self.query_params(ticker);
        let mut last_failure = None;
        // Unvalidated configs still get the hard cap
        let max_attempts = self.retry.max_attempts.min(MAX_ATTEMPTS);

        info!(ticker, %start, %end, "fetching daily series");

        for attempt in 0..max_attempts {
            let started = Instant::now();
            let result = self.transport.get(&url, &query);
            let status_code = result.as_ref().ok().map(|r| r.status);

            match Self::classify(result) {
                Classified::Series(series) => {
                    let parsed = parse_series(ticker, series, start, end);
                    let (outcome, message) = match &parsed {
                        Ok(_) => (AttemptOutcome::Success, None),
                        Err(e @ FetchError::NoData { .. }) => {
                            (AttemptOutcome::Success, Some(e.to_string()))
                        }
                        Err(e) => (AttemptOutcome::UnexpectedShape, Some(e.to_string())),
                    };
                    self.record(observer, ticker, attempt, status_code, started, outcome, message);
                    let bars = parsed?;
                    debug!(ticker, attempt, bars = bars.len(), "fetch succeeded");
                    return Ok(FetchResult {
                        ticker: ticker.to_string(),
                        bars,
                        attempts: attempt + 1,
                    });
                }
                Classified::Rejected(message) => {
                    self.record(
                        observer,
                        ticker,
                        attempt,
                        status_code,
                        started,
                        AttemptOutcome::UpstreamError,
                        Some(message.clone()),
                    );
                    warn!(ticker, attempt, %message, "upstream rejected request");
                    return Err(FetchError::Upstream {
                        ticker: ticker.to_string(),
                        message,
                    });
                }
                Classified::Retry(failure) => {
                    let outcome = match &failure {
                        AttemptFailure::Transport(_) => AttemptOutcome::Transport,
                        AttemptFailure::HttpStatus { .. } => AttemptOutcome::HttpError,
                        AttemptFailure::RateLimited(_) => AttemptOutcome::RateLimited,
                        AttemptFailure::UnexpectedShape(_) => AttemptOutcome::UnexpectedShape,
                    };
                    self.record(
                        observer,
                        ticker,
                        attempt,
                        status_code,
                        started,
                        outcome,
                        Some(failure.to_string()),
                    );
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        ticker,
                        attempt,
                        error = %failure,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, backing off"
                    );
                    self.sleeper.sleep(delay);
                    last_failure = Some(failure);
                }
            }
        }

        Err(FetchError::Exhausted {
            ticker: ticker.to_string(),
            attempts: max_attempts,
            last: last_failure
                .unwrap_or_else(|| AttemptFailure::UnexpectedShape("no attempt was made".into())),
        })
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Normalize the series object into ascending bars within `[start, end]`.
fn parse_series(
    ticker: &str,
    series: Value,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<PriceBar>, FetchError> {
    let malformed = |reason: String| FetchError::Malformed {
        ticker: ticker.to_string(),
        reason,
    };

    let entries: BTreeMap<String, DailyEntry> =
        serde_json::from_value(series).map_err(|e| malformed(e.to_string()))?;

    let mut bars = Vec::with_capacity(entries.len());
    for (day, entry) in entries {
        let date = NaiveDate::parse_from_str(&day, "%Y-%m-%d")
            .map_err(|e| malformed(format!("date '{day}': {e}")))?;
        let price = |name: &str, raw: &str| {
            raw.trim()
                .parse::<f64>()
                .map_err(|e| malformed(format!("{day} {name} '{raw}': {e}")))
        };
        bars.push(PriceBar {
            ticker: ticker.to_string(),
            timestamp: date_to_timestamp(date),
            open: price("open", &entry.open)?,
            high: price("high", &entry.high)?,
            low: price("low", &entry.low)?,
            close: price("close", &entry.close)?,
            volume: entry
                .volume
                .trim()
                .parse::<i64>()
                .map_err(|e| malformed(format!("{day} volume '{}': {e}", entry.volume)))?,
        });
    }

    bars.sort_by_key(|b| b.timestamp);
    let (lo, hi) = (date_to_timestamp(start), date_to_timestamp(end));
    bars.retain(|b| b.timestamp >= lo && b.timestamp <= hi);

    if bars.is_empty() {
        return Err(FetchError::NoData {
            ticker: ticker.to_string(),
            start,
            end,
        });
    }
    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use parking_lot::Mutex;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        calls: Mutex<Vec<Vec<(String, String)>>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<HttpResponse, TransportError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    impl HttpTransport for ScriptedTransport {
        fn get(&self, _url: &str, query: &[(&str, String)]) -> Result<HttpResponse, TransportError> {
            self.calls
                .lock()
                .push(query.iter().map(|(k, v)| (k.to_string(), v.clone())).collect());
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Other("script exhausted".into())))
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.slept.lock().push(duration);
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        records: RefCell<Vec<ApiCallRecord>>,
    }

    impl AttemptObserver for RecordingObserver {
        fn on_attempt(&self, record: &ApiCallRecord) {
            self.records.borrow_mut().push(record.clone());
        }
    }

    fn ok(body: &str) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse {
            status: 200,
            body: body.to_string(),
        })
    }

    fn series_body() -> String {
        r#"{
            "Meta Data": {"2. Symbol": "IBM"},
            "Time Series (Daily)": {
                "2024-01-04": {"1. open": "101.0", "2. high": "103.0", "3. low": "100.5", "4. close": "102.0", "5. volume": "1200"},
                "2024-01-02": {"1. open": "99.0", "2. high": "101.0", "3. low": "98.0", "4. close": "100.0", "5. volume": "1000"},
                "2024-01-03": {"1. open": "100.0", "2. high": "102.0", "3. low": "99.5", "4. close": "101.0", "5. volume": "1100"},
                "2023-12-29": {"1. open": "98.0", "2. high": "99.0", "3. low": "97.0", "4. close": "98.5", "5. volume": "900"}
            }
        }"#
        .to_string()
    }

    fn fetcher(
        transport: Arc<ScriptedTransport>,
        sleeper: Arc<RecordingSleeper>,
    ) -> AlphaVantageFetcher {
        let mut config = QuantsimConfig::default();
        config.api.api_key = Some("test-key".into());
        AlphaVantageFetcher::new(&config, transport, sleeper, Arc::new(SystemClock)).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn parses_sorts_and_filters_range() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(&series_body())]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let f = fetcher(transport.clone(), sleeper.clone());
        let observer = RecordingObserver::default();

        let result = f
            .fetch("IBM", d(2024, 1, 1), d(2024, 1, 3), &observer)
            .unwrap();
        assert_eq!(result.attempts, 1);
        assert_eq!(result.bars.len(), 2);
        assert_eq!(result.bars[0].timestamp, date_to_timestamp(d(2024, 1, 2)));
        assert_eq!(result.bars[1].close, 101.0);
        assert_eq!(result.bars[1].volume, 1100);
        assert!(sleeper.slept.lock().is_empty());

        let records = observer.records.borrow();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AttemptOutcome::Success);
        assert_eq!(records[0].status_code, Some(200));
    }

    #[test]
    fn sends_expected_query() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(&series_body())]));
        let mut config = QuantsimConfig::default();
        config.api.api_key = Some("k".into());
        config.api.symbol_suffix = Some(".BSE".into());
        config.api.output_size = OutputSize::Compact;
        let f = AlphaVantageFetcher::new(
            &config,
            transport.clone(),
            Arc::new(RecordingSleeper::default()),
            Arc::new(SystemClock),
        )
        .unwrap();
        f.fetch("RELIANCE", d(2024, 1, 1), d(2024, 1, 5), &crate::data::provider::NoopObserver)
            .unwrap();

        let calls = transport.calls.lock();
        let q: BTreeMap<_, _> = calls[0].iter().cloned().collect();
        assert_eq!(q["function"], "TIME_SERIES_DAILY");
        assert_eq!(q["symbol"], "RELIANCE.BSE");
        assert_eq!(q["outputsize"], "compact");
        assert_eq!(q["apikey"], "k");
    }

    #[test]
    fn exhausts_after_five_attempts_with_doubling_backoff() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Timeout("t".into())),
            Ok(HttpResponse {
                status: 503,
                body: String::new(),
            }),
            ok(r#"{"Note": "Thank you for using Alpha Vantage! 5 calls per minute."}"#),
            ok("not json"),
            ok(r#"{"Information": "rate limit"}"#),
            ok(&series_body()),
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let f = fetcher(transport.clone(), sleeper.clone());
        let observer = RecordingObserver::default();

        let err = f
            .fetch("IBM", d(2024, 1, 1), d(2024, 1, 5), &observer)
            .unwrap_err();
        match err {
            FetchError::Exhausted {
                attempts, last, ..
            } => {
                assert_eq!(attempts, 5);
                assert!(matches!(last, AttemptFailure::RateLimited(_)));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }

        assert_eq!(transport.call_count(), 5);
        let slept: Vec<u64> = sleeper.slept.lock().iter().map(|d| d.as_secs()).collect();
        assert_eq!(slept, vec![1, 2, 4, 8, 16]);
        assert_eq!(slept.iter().sum::<u64>(), 31);

        let outcomes: Vec<AttemptOutcome> =
            observer.records.borrow().iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                AttemptOutcome::Transport,
                AttemptOutcome::HttpError,
                AttemptOutcome::RateLimited,
                AttemptOutcome::UnexpectedShape,
                AttemptOutcome::RateLimited,
            ]
        );
    }

    #[test]
    fn rate_limit_then_success() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ok(r#"{"Note": "slow down"}"#),
            ok(r#"{"Note": "slow down"}"#),
            ok(&series_body()),
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let f = fetcher(transport.clone(), sleeper.clone());

        let result = f
            .fetch("IBM", d(2024, 1, 1), d(2024, 1, 5), &crate::data::provider::NoopObserver)
            .unwrap();
        assert_eq!(result.attempts, 3);
        assert_eq!(result.bars.len(), 3);
        let slept: Vec<u64> = sleeper.slept.lock().iter().map(|d| d.as_secs()).collect();
        assert_eq!(slept, vec![1, 2]);
    }

    #[test]
    fn error_message_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ok(r#"{"Error Message": "Invalid API call."}"#),
            ok(&series_body()),
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let f = fetcher(transport.clone(), sleeper.clone());

        let err = f
            .fetch("NOPE", d(2024, 1, 1), d(2024, 1, 5), &crate::data::provider::NoopObserver)
            .unwrap_err();
        assert!(
            matches!(err, FetchError::Upstream { ref message, .. } if message == "Invalid API call.")
        );
        assert_eq!(transport.call_count(), 1);
        assert!(sleeper.slept.lock().is_empty());
    }

    #[test]
    fn unparseable_entry_is_malformed() {
        let body = r#"{"Time Series (Daily)": {
            "2024-01-02": {"1. open": "abc", "2. high": "1", "3. low": "1", "4. close": "1", "5. volume": "1"}
        }}"#;
        let transport = Arc::new(ScriptedTransport::new(vec![ok(body)]));
        let f = fetcher(transport.clone(), Arc::new(RecordingSleeper::default()));
        let observer = RecordingObserver::default();

        let err = f
            .fetch("IBM", d(2024, 1, 1), d(2024, 1, 5), &observer)
            .unwrap_err();
        assert!(matches!(err, FetchError::Malformed { .. }));
        assert_eq!(transport.call_count(), 1);
        assert_eq!(observer.records.borrow()[0].outcome, AttemptOutcome::UnexpectedShape);
    }

    #[test]
    fn empty_range_is_no_data() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(&series_body())]));
        let f = fetcher(transport, Arc::new(RecordingSleeper::default()));
        let err = f
            .fetch("IBM", d(2020, 1, 1), d(2020, 12, 31), &crate::data::provider::NoopObserver)
            .unwrap_err();
        assert!(matches!(err, FetchError::NoData { .. }));
    }

    #[test]
    fn oversized_retry_budget_is_capped_at_five_calls() {
        let mut config = QuantsimConfig::default();
        config.api.api_key = Some("test-key".into());
        config.retry.max_attempts = 12;
        let transport = Arc::new(ScriptedTransport::new(
            (0..12).map(|_| ok(r#"{"Note": "slow down"}"#)).collect(),
        ));
        let sleeper = Arc::new(RecordingSleeper::default());
        let f = AlphaVantageFetcher::new(
            &config,
            transport.clone(),
            sleeper.clone(),
            Arc::new(SystemClock),
        )
        .unwrap();

        let err = f
            .fetch("IBM", d(2024, 1, 1), d(2024, 1, 5), &crate::data::provider::NoopObserver)
            .unwrap_err();
        assert!(matches!(err, FetchError::Exhausted { attempts: 5, .. }));
        assert_eq!(transport.call_count(), 5);
        assert_eq!(sleeper.slept.lock().len(), 5);
    }

    #[test]
    fn missing_api_key_is_a_config_error() {
        let config = QuantsimConfig::default();
        let result = AlphaVantageFetcher::new(
            &config,
            Arc::new(ScriptedTransport::new(vec![])),
            Arc::new(RecordingSleeper::default()),
            Arc::new(SystemClock),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}
