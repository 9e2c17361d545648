//! Domain types for QuantSim ingestion

pub mod bar;
pub mod circuit;
pub mod issue;

pub use bar::{date_to_timestamp, normalize_to_day, timestamp_to_date, PriceBar, PriceField};
pub use circuit::{CircuitRecord, CircuitState};
pub use issue::{ApiCallRecord, AttemptOutcome, IssueType, ValidationIssue};
