//! Data acquisition, validation and the ingestion pipeline.

pub mod alpha_vantage;
pub mod circuit_breaker;
pub mod frame;
pub mod ingest;
pub mod provider;
pub mod transport;
pub mod validator;

pub use alpha_vantage::AlphaVantageFetcher;
pub use circuit_breaker::{BreakerError, CircuitBreaker};
pub use frame::{bars_to_frame, load_csv_bars};
pub use ingest::{
    IngestError, IngestOutcome, IngestReport, IngestionController, SeriesImporter, SkipReason,
    StorageObserver,
};
pub use provider::{
    AttemptFailure, AttemptObserver, DataProvider, FetchError, FetchResult, NoopObserver,
};
pub use transport::{HttpResponse, HttpTransport, ReqwestTransport, Sleeper, ThreadSleeper, TransportError};
pub use validator::{
    DataValidator, PreconditionError, QualityReport, ReturnStats, ValidationError,
    ValidationSummary,
};
