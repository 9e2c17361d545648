//! QuantSim Core: resilient daily OHLCV ingestion.
//!
//! This crate contains the ingestion core:
//! - Domain types (price bars, circuit state, validation issues, API call records)
//! - Per-ticker circuit breaker over persisted state
//! - Alpha Vantage fetcher with bounded retry and exponential backoff
//! - Data-quality validator (gaps, 5σ outliers, stale runs) and quality score
//! - Ingestion controller sequencing breaker, fetch, validation and storage
//! - Series importer for seeding the store from CSV files
//! - SQLite storage behind the `Storage` trait

pub mod clock;
pub mod config;
pub mod data;
pub mod domain;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::QuantsimConfig;
