//! Fair pollution benchmarking for satellite-monitored cities.
//!
//! The regional scanner turns one satellite pass per gas into per-city
//! readings and feeds two stores: a per-city cache document and an
//! append-only violation log. The scoring engine blends both into a capped,
//! bias-resistant composite per city, and the ranking layer turns those into
//! rankings, regional aggregates, gas leaderboards and head-to-heads.
//!
//! Everything is wired through constructors. Build a [`Config`], connect the
//! stores and the fetcher, hand them to [`RegionalScanner`],
//! [`StalenessTracker`] and [`BenchmarkAnalytics`].

pub mod circuit_breaker;
pub mod config;
pub mod dedup;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod models;
pub mod ranking;
pub mod scanner;
pub mod scoring;
pub mod staleness;
pub mod store;

pub use config::{Config, ScoringConfig, ScoringMode};
pub use error::{BenchmarkError, FetchError, StoreError};
pub use models::{CacheRecord, Category, CityScore, Confidence, Gas, RankedCityScore, ViolationRecord};
pub use ranking::BenchmarkAnalytics;
pub use scanner::{RegionalScanner, ScanResult, ScanStatus};
pub use scoring::{FairComposite, ScoreStrategy, ThresholdWeighted, ViolationFrequency};
pub use staleness::StalenessTracker;
