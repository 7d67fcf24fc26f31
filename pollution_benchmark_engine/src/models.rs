// =============================================================================
// models.rs - THE VOCABULARY OF DIRTY AIR
// =============================================================================
//
// Every entity the engine touches gets a real struct here. The cache documents
// written by the scanner are read directly by other collaborators (the
// dashboard, the notification worker), so serde field names on CacheRecord and
// everything under it are a wire contract. Rename a Rust field freely; never
// rename what serde writes.
//
// Readings are immutable once built. A new scan supersedes a reading, it
// never merges into one.
// =============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BenchmarkError;

/// The pollutants tracked by the TROPOMI instrument that we care about.
///
/// Serialized with the upper-case chemical code because that is what every
/// cache document and violation record in the wild already uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Gas {
    #[serde(rename = "NO2")]
    No2,
    #[serde(rename = "SO2")]
    So2,
    #[serde(rename = "CO")]
    Co,
    #[serde(rename = "HCHO")]
    Hcho,
    #[serde(rename = "CH4")]
    Ch4,
}

impl Gas {
    pub const ALL: [Gas; 5] = [Gas::No2, Gas::So2, Gas::Co, Gas::Hcho, Gas::Ch4];

    pub fn code(&self) -> &'static str {
        match self {
            Gas::No2 => "NO2",
            Gas::So2 => "SO2",
            Gas::Co => "CO",
            Gas::Hcho => "HCHO",
            Gas::Ch4 => "CH4",
        }
    }
}

impl fmt::Display for Gas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Gas {
    type Err = BenchmarkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Gas::ALL
            .into_iter()
            .find(|g| g.code().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| BenchmarkError::UnknownGas(wanted.to_string()))
    }
}

/// Axis-aligned geographic box in degrees: west/south/east/north.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl BoundingBox {
    pub const fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self { west, south, east, north }
    }

    /// Smallest box covering both `self` and `other`.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            west: self.west.min(other.west),
            south: self.south.min(other.south),
            east: self.east.max(other.east),
            north: self.north.max(other.north),
        }
    }
}

/// A monitored city. Reference data: loaded once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct City {
    pub name: String,
    pub region: String,
    /// (lat, lon)
    pub center: (f64, f64),
    pub bbox: BoundingBox,
    pub radius_km: f64,
}

/// Static description of one monitored gas and the threshold we judge it by.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GasSpec {
    pub gas: Gas,
    pub name: String,
    /// Unit the satellite reports in (and the unit thresholds are expressed in).
    pub unit: String,
    pub display_unit: String,
    pub conversion_factor: f64,
    /// Readings at or above this are violations. Zero disables violations.
    pub column_threshold: f64,
    pub critical_threshold: f64,
}

/// How bad a violation is, judged purely on exceedance percentage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Moderate,
    Critical,
}

impl Severity {
    /// Critical once the reading is at least double the threshold.
    pub fn from_exceedance(percentage_over: f64) -> Self {
        if percentage_over >= 100.0 {
            Severity::Critical
        } else {
            Severity::Moderate
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Moderate => write!(f, "moderate"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// One city's observation of one gas from one scan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GasReading {
    /// The max over the city box. Stored as `value` because the violation
    /// rule is evaluated against the max and consumers have always read it
    /// under that name.
    #[serde(rename = "value")]
    pub max: f64,
    pub mean: f64,
    pub min: f64,
    pub unit: String,
    pub threshold: f64,
    pub is_violation: bool,
    pub percentage_over: f64,
    /// KSA-localized acquisition time of the satellite pass.
    pub timestamp: String,
    pub days_old: i64,
}

impl GasReading {
    /// `max / threshold * 100`, or `None` when the gas has no usable threshold.
    pub fn threshold_percentage(&self) -> Option<f64> {
        (self.threshold > 0.0).then(|| self.max / self.threshold * 100.0)
    }
}

/// The per-scan violation summary kept inside a cache document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanViolation {
    pub gas: Gas,
    pub value: f64,
    pub threshold: f64,
    pub percentage_over: f64,
    pub severity: Severity,
}

/// Per-city summary derived from a single scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CityMetrics {
    pub pollution_index: f64,
    pub active_violations: usize,
    pub gases_monitored: usize,
    pub data_completeness: f64,
    pub avg_threshold_percentage: f64,
}

/// Who asked for a scan. Background scans come from the scheduler, user scans
/// from somebody clicking a city on the dashboard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanOrigin {
    Background,
    User,
}

/// Running counters kept on each cache document.
///
/// Invariant after every write: `total_scans == background_scans + user_scans`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoringStats {
    pub total_scans: u64,
    pub first_scan_date: NaiveDate,
    pub background_scans: u64,
    pub user_scans: u64,
}

impl MonitoringStats {
    /// Counters after one more scan of `origin`, continuing from `previous`.
    pub fn next(previous: Option<&MonitoringStats>, origin: ScanOrigin, today: NaiveDate) -> Self {
        let (background, user, first) = match previous {
            Some(p) => (p.background_scans, p.user_scans, p.first_scan_date),
            None => (0, 0, today),
        };
        let (background, user) = match origin {
            ScanOrigin::Background => (background + 1, user),
            ScanOrigin::User => (background, user + 1),
        };
        Self {
            total_scans: background + user,
            first_scan_date: first,
            background_scans: background,
            user_scans: user,
        }
    }
}

/// One document per city in the cache store, overwritten in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheRecord {
    pub city: String,
    pub region: String,
    pub last_updated: DateTime<Utc>,
    pub latest_readings: BTreeMap<Gas, GasReading>,
    pub metrics: CityMetrics,
    #[serde(default)]
    pub violations: Vec<ScanViolation>,
    pub monitoring_stats: MonitoringStats,
}

impl CacheRecord {
    /// Age of the snapshot in fractional hours.
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.last_updated).num_seconds() as f64 / 3600.0
    }
}

/// Optional context attached to a violation when the caller knows it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ViolationContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind_direction_deg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wind_speed_ms: Option<f64>,
    /// (lat, lon) of the hottest pixel, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hotspot: Option<(f64, f64)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nearby_factories: Vec<String>,
}

/// An immutable historical fact: this city broke this threshold at this time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViolationRecord {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub city: String,
    pub gas: Gas,
    pub value: f64,
    pub threshold: f64,
    pub severity: Severity,
    pub percentage_over: f64,
    /// KSA-localized timestamp of the satellite pass. Part of the dedup key.
    pub timestamp: String,
    #[serde(default = "Utc::now")]
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ViolationContext>,
}

impl ViolationRecord {
    pub fn new(city: impl Into<String>, gas: Gas, violation: &ScanViolation, timestamp: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            city: city.into(),
            gas,
            value: violation.value,
            threshold: violation.threshold,
            severity: violation.severity,
            percentage_over: violation.percentage_over,
            timestamp: timestamp.into(),
            recorded_at: Utc::now(),
            context: None,
        }
    }

    /// The (city, gas, timestamp) triple, flattened.
    pub fn dedup_key(&self) -> String {
        dedup_key(&self.city, self.gas, &self.timestamp)
    }

    /// Plain-English sentence stored next to the record.
    pub fn narrative(&self) -> String {
        format!(
            "{} {} reading of {:.6} exceeded the threshold of {:.6} by {:.1}% ({}) at {}",
            self.city, self.gas, self.value, self.threshold, self.percentage_over, self.severity, self.timestamp
        )
    }
}

pub fn dedup_key(city: &str, gas: Gas, timestamp: &str) -> String {
    format!("{city}|{gas}|{timestamp}")
}

/// Qualitative pollution bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Cleanest,
    Clean,
    Moderate,
    Polluted,
    HeavilyPolluted,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Cleanest,
        Category::Clean,
        Category::Moderate,
        Category::Polluted,
        Category::HeavilyPolluted,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Category::Cleanest => "Cleanest",
            Category::Clean => "Clean",
            Category::Moderate => "Moderate",
            Category::Polluted => "Polluted",
            Category::HeavilyPolluted => "Heavily Polluted",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Category::Cleanest => "#10b981",
            Category::Clean => "#22c55e",
            Category::Moderate => "#f59e0b",
            Category::Polluted => "#ef4444",
            Category::HeavilyPolluted => "#dc2626",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Which kinds of data a city's score was built from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataCoverage {
    LiveOnly,
    HistoricalOnly,
    Both,
    Neither,
}

/// The outcome of scoring one city. Pure data, recomputed on demand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CityScore {
    pub city: String,
    pub region: String,
    /// The composite pollution index the ranking sorts by.
    pub pollution_index: f64,
    pub live_score: f64,
    pub historical_score: f64,
    pub category: Category,
    pub confidence: Confidence,
    pub data_quality: f64,
    /// Historical violations on record.
    pub violation_count: usize,
    pub critical_count: usize,
    /// Violations present in the latest cached scan.
    pub active_violations: usize,
    pub has_live_data: bool,
    pub has_history: bool,
}

impl CityScore {
    pub fn coverage(&self) -> DataCoverage {
        match (self.has_live_data, self.has_history) {
            (true, true) => DataCoverage::Both,
            (true, false) => DataCoverage::LiveOnly,
            (false, true) => DataCoverage::HistoricalOnly,
            (false, false) => DataCoverage::Neither,
        }
    }
}

/// A scored city with its 1-based position in a ranking (1 = cleanest).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedCityScore {
    pub rank: usize,
    #[serde(flatten)]
    pub score: CityScore,
}
