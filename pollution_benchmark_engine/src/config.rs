// =============================================================================
// config.rs - THE ONE IMMUTABLE SOURCE OF TRUTH
// =============================================================================
//
// City list, gas thresholds, scoring weights, scan tuning, store and fetcher
// endpoints. Built once at startup, wrapped in an Arc, handed to every
// component's constructor. Nothing in the engine reaches for a global.
//
// Every scalar can be overridden with a POLLUTION_BENCH_* environment
// variable. The reference tables (cities, gases) are compiled in.
//
// The scoring constants are empirical. Nobody derived 0.7/0.3 or the +30
// uncertainty penalty from first principles; they were tuned by eye against
// real scans. They live here so an operator can recalibrate without a rebuild.
// =============================================================================

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BenchmarkError;
use crate::models::{BoundingBox, City, Gas, GasSpec};

/// Which scoring formula the ranking layer applies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    /// Live threshold percentage blended with capped history. The canonical one.
    FairComposite,
    /// Live threshold percentage plus a flat bonus per active violation.
    ThresholdWeighted,
    /// Historical violation counts only. Kept for comparing against old reports.
    ViolationFrequency,
}

impl FromStr for ScoringMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fair_composite" | "fair" => Ok(ScoringMode::FairComposite),
            "threshold_weighted" => Ok(ScoringMode::ThresholdWeighted),
            "violation_frequency" => Ok(ScoringMode::ViolationFrequency),
            other => Err(format!("unknown scoring mode `{other}`")),
        }
    }
}

/// Tunable constants for the scoring strategies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoringConfig {
    pub mode: ScoringMode,
    /// Weight of the live component when live data is good enough.
    pub live_weight: f64,
    /// Weight of the historical component in the same blend.
    pub historical_weight: f64,
    /// Live data counts as usable only above this completeness.
    pub live_data_threshold: f64,
    /// Added to the historical score when history exists but live data is thin.
    pub uncertainty_penalty: f64,
    /// Hard ceiling on the historical score.
    pub historical_cap: f64,
    /// Score for a city with neither live data nor history.
    pub neutral_score: f64,
    /// Multiplier for critical violations in the historical count.
    pub critical_weight: f64,
    /// Points per weighted violation.
    pub violation_weight: f64,
    /// Points per percent of average exceedance.
    pub exceedance_weight: f64,
    /// Bonus per active violation in threshold-weighted mode.
    pub active_violation_bonus: f64,
    /// Confidence needs completeness above this...
    pub confidence_min_quality: f64,
    /// ...and at least this many historical violations.
    pub confidence_min_violations: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            mode: ScoringMode::FairComposite,
            live_weight: 0.7,
            historical_weight: 0.3,
            live_data_threshold: 0.3,
            uncertainty_penalty: 30.0,
            historical_cap: 50.0,
            neutral_score: 50.0,
            critical_weight: 1.5,
            violation_weight: 3.0,
            exceedance_weight: 0.2,
            active_violation_bonus: 10.0,
            confidence_min_quality: 0.5,
            confidence_min_violations: 3,
        }
    }
}

/// Every tunable parameter in the engine.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // REFERENCE DATA
    // =========================================================================
    pub cities: Vec<City>,
    pub gases: Vec<GasSpec>,

    // =========================================================================
    // SCORING
    // =========================================================================
    pub scoring: ScoringConfig,

    // =========================================================================
    // REGIONAL SCAN
    // =========================================================================
    /// Default trailing window for satellite queries, in days.
    pub days_back: u32,
    /// When a gas comes back empty, retry once with the window times this.
    pub empty_window_multiplier: u32,
    /// How many of the newest candidate images we validate per gas.
    pub max_candidate_images: usize,
    /// Wall-clock ceiling for one scan. Work done before it is kept.
    pub max_scan_duration: Duration,
    /// Concurrent per-city extractions against a fetched image.
    pub max_parallel_extractions: usize,
    /// Record detected violations into the violation store during scans.
    pub auto_record_violations: bool,
    /// KSA local time offset from UTC, in hours. Riyadh has no DST.
    pub timezone_offset_hours: i32,

    // =========================================================================
    // LEGACY PER-CITY SCAN (rate-limited remote, so batches + a breather)
    // =========================================================================
    pub legacy_batch_size: usize,
    pub legacy_batch_delay: Duration,

    // =========================================================================
    // SCHEDULING
    // =========================================================================
    pub scan_interval: Duration,
    pub stale_after_hours: f64,

    // =========================================================================
    // STORES
    // =========================================================================
    pub redis_url: String,
    pub cache_key_prefix: String,
    pub violation_key_prefix: String,

    // =========================================================================
    // GAS READING SERVICE
    // =========================================================================
    pub fetcher_base_url: String,
    pub fetcher_timeout: Duration,

    // =========================================================================
    // DEDUP (Bloom + LRU in front of the violation store)
    // =========================================================================
    pub bloom_expected_items: u64,
    pub bloom_false_positive_rate: f64,
    pub bloom_rotation_interval: Duration,
    pub lru_cache_size: usize,

    // =========================================================================
    // CIRCUIT BREAKER
    // =========================================================================
    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_reset_timeout: Duration,
    pub circuit_breaker_success_threshold: u32,

    // =========================================================================
    // OBSERVABILITY
    // =========================================================================
    pub metrics_port: u16,
    pub log_json: bool,
}

impl Default for Config {
    /// Compiled-in defaults, ignoring the environment. What tests use.
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    /// Load configuration from `POLLUTION_BENCH_*` environment variables,
    /// after pulling in a `.env` file if one is lying around.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to
    /// the default rather than aborting startup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| -> String {
            lookup(&format!("POLLUTION_BENCH_{key}")).unwrap_or_else(|| default.to_string())
        };
        let secs = |key: &str, default: u64| Duration::from_secs(get(key, &default.to_string()).parse().unwrap_or(default));

        let defaults = ScoringConfig::default();
        let scoring = ScoringConfig {
            mode: get("SCORING_MODE", "fair_composite").parse().unwrap_or(defaults.mode),
            live_weight: parse_or(&get("LIVE_WEIGHT", ""), defaults.live_weight),
            historical_weight: parse_or(&get("HISTORICAL_WEIGHT", ""), defaults.historical_weight),
            live_data_threshold: parse_or(&get("LIVE_DATA_THRESHOLD", ""), defaults.live_data_threshold),
            uncertainty_penalty: parse_or(&get("UNCERTAINTY_PENALTY", ""), defaults.uncertainty_penalty),
            historical_cap: parse_or(&get("HISTORICAL_CAP", ""), defaults.historical_cap),
            neutral_score: parse_or(&get("NEUTRAL_SCORE", ""), defaults.neutral_score),
            critical_weight: parse_or(&get("CRITICAL_WEIGHT", ""), defaults.critical_weight),
            violation_weight: parse_or(&get("VIOLATION_WEIGHT", ""), defaults.violation_weight),
            exceedance_weight: parse_or(&get("EXCEEDANCE_WEIGHT", ""), defaults.exceedance_weight),
            active_violation_bonus: parse_or(&get("ACTIVE_VIOLATION_BONUS", ""), defaults.active_violation_bonus),
            confidence_min_quality: parse_or(&get("CONFIDENCE_MIN_QUALITY", ""), defaults.confidence_min_quality),
            confidence_min_violations: parse_or(
                &get("CONFIDENCE_MIN_VIOLATIONS", ""),
                defaults.confidence_min_violations,
            ),
        };

        Config {
            cities: default_cities(),
            gases: default_gases(),
            scoring,

            days_back: parse_or(&get("DAYS_BACK", "7"), 7),
            empty_window_multiplier: parse_or(&get("EMPTY_WINDOW_MULTIPLIER", "3"), 3),
            max_candidate_images: parse_or(&get("MAX_CANDIDATE_IMAGES", "10"), 10),
            max_scan_duration: secs("MAX_SCAN_SECS", 30 * 60),
            max_parallel_extractions: parse_or(&get("MAX_PARALLEL_EXTRACTIONS", "8"), 8),
            auto_record_violations: parse_bool(&get("AUTO_RECORD_VIOLATIONS", "true")),
            timezone_offset_hours: parse_or(&get("TIMEZONE_OFFSET_HOURS", "3"), 3),

            legacy_batch_size: parse_or(&get("LEGACY_BATCH_SIZE", "3"), 3),
            legacy_batch_delay: secs("LEGACY_BATCH_DELAY_SECS", 10),

            scan_interval: secs("SCAN_INTERVAL_SECS", 12 * 3600),
            stale_after_hours: parse_or(&get("STALE_AFTER_HOURS", "24"), 24.0),

            redis_url: get("REDIS_URL", "redis://127.0.0.1:6379"),
            cache_key_prefix: get("CACHE_KEY_PREFIX", "city_pollution_cache"),
            violation_key_prefix: get("VIOLATION_KEY_PREFIX", "violations"),

            fetcher_base_url: get("FETCHER_BASE_URL", "http://127.0.0.1:8085"),
            fetcher_timeout: secs("FETCHER_TIMEOUT_SECS", 120),

            bloom_expected_items: parse_or(&get("BLOOM_ITEMS", "100000"), 100_000),
            bloom_false_positive_rate: parse_or(&get("BLOOM_FP_RATE", "0.01"), 0.01),
            bloom_rotation_interval: secs("BLOOM_ROTATION_SECS", 24 * 3600),
            lru_cache_size: parse_or(&get("LRU_CACHE_SIZE", "10000"), 10_000),

            circuit_breaker_failure_threshold: parse_or(&get("CB_FAILURE_THRESHOLD", "5"), 5),
            circuit_breaker_reset_timeout: secs("CB_RESET_TIMEOUT_SECS", 60),
            circuit_breaker_success_threshold: parse_or(&get("CB_SUCCESS_THRESHOLD", "2"), 2),

            metrics_port: parse_or(&get("METRICS_PORT", "9090"), 9090),
            log_json: parse_bool(&get("LOG_JSON", "false")),
        }
    }

    /// Look up a monitored city by exact name.
    pub fn city(&self, name: &str) -> Result<&City, BenchmarkError> {
        self.cities
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| BenchmarkError::UnknownCity(name.to_string()))
    }

    /// Look up a monitored gas. A gas that exists but is not configured is
    /// just as unknown as one that does not exist.
    pub fn gas_spec(&self, gas: Gas) -> Result<&GasSpec, BenchmarkError> {
        self.gases
            .iter()
            .find(|g| g.gas == gas)
            .ok_or_else(|| BenchmarkError::UnknownGas(gas.to_string()))
    }

    /// Cities grouped by region, preserving configuration order inside each.
    pub fn regions(&self) -> BTreeMap<&str, Vec<&City>> {
        let mut regions: BTreeMap<&str, Vec<&City>> = BTreeMap::new();
        for city in &self.cities {
            regions.entry(city.region.as_str()).or_default().push(city);
        }
        regions
    }

    /// The box a regional scan covers: the union of every city box.
    pub fn monitored_region(&self) -> Option<BoundingBox> {
        self.cities.iter().map(|c| c.bbox).reduce(|acc, b| acc.union(&b))
    }

    /// Offset used to localize satellite timestamps. Out-of-range hours fall
    /// back to UTC.
    pub fn local_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.timezone_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }
}

fn parse_or<T: FromStr>(raw: &str, default: T) -> T {
    raw.trim().parse().unwrap_or(default)
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

// =============================================================================
// Monitored cities: (name, region, center lat/lon, bbox w/s/e/n, radius km)
// =============================================================================
// Every major industrial city in the Kingdom. Boxes are hand-drawn around the
// industrial footprint, not the municipal boundary.
// =============================================================================
type CityRow = (&'static str, &'static str, (f64, f64), [f64; 4], f64);

const CITY_TABLE: &[CityRow] = &[
    // Western
    ("Yanbu", "Western", (24.0889, 38.0618), [38.07, 23.89, 38.46, 24.05], 25.0),
    ("Jeddah", "Western", (21.4858, 39.1925), [39.05, 21.35, 39.35, 21.65], 30.0),
    ("Makkah", "Western", (21.3891, 39.8579), [39.70, 21.25, 40.00, 21.55], 20.0),
    ("Madinah", "Western", (24.5247, 39.5692), [39.40, 24.35, 39.75, 24.70], 20.0),
    ("Rabigh", "Western", (22.7976, 39.0347), [38.85, 22.60, 39.25, 23.00], 25.0),
    // Eastern
    ("Jubail", "Eastern", (27.0173, 49.6575), [49.50, 26.90, 49.80, 27.15], 25.0),
    ("Dammam", "Eastern", (26.4207, 50.0888), [49.90, 26.25, 50.25, 26.60], 25.0),
    ("Dhahran", "Eastern", (26.2361, 50.0393), [49.85, 26.10, 50.20, 26.40], 20.0),
    ("Al-Khobar", "Eastern", (26.2794, 50.2083), [50.05, 26.15, 50.35, 26.45], 20.0),
    ("Ras Tanura", "Eastern", (26.6444, 50.0500), [49.90, 26.50, 50.20, 26.80], 20.0),
    ("Al-Ahsa", "Eastern", (25.3898, 49.5859), [49.40, 25.20, 49.80, 25.60], 25.0),
    // Central
    ("Riyadh", "Central", (24.7136, 46.6753), [46.45, 24.50, 46.95, 24.95], 35.0),
    ("Sudair", "Central", (25.5833, 45.6167), [45.40, 25.40, 45.85, 25.80], 25.0),
    ("Qassim", "Central", (26.3260, 43.9750), [43.75, 26.10, 44.20, 26.55], 25.0),
    // Southern
    ("Jazan", "Southern", (16.8892, 42.5511), [42.4511, 16.7892, 42.6511, 16.9892], 15.0),
    ("Abha", "Southern", (18.2164, 42.5053), [42.30, 18.05, 42.70, 18.40], 20.0),
    ("Najran", "Southern", (17.4933, 44.1277), [43.95, 17.30, 44.35, 17.70], 20.0),
    // Northern
    ("Tabuk", "Northern", (28.3838, 36.5550), [36.35, 28.20, 36.75, 28.60], 25.0),
    ("Hail", "Northern", (27.5114, 41.7208), [41.50, 27.30, 41.95, 27.75], 25.0),
    ("Al-Jouf", "Northern", (29.8117, 40.1000), [39.90, 29.60, 40.30, 30.05], 25.0),
    ("Arar", "Northern", (30.9753, 41.0178), [40.80, 30.80, 41.25, 31.15], 20.0),
];

pub fn default_cities() -> Vec<City> {
    CITY_TABLE
        .iter()
        .map(|&(name, region, center, [w, s, e, n], radius_km)| City {
            name: name.to_string(),
            region: region.to_string(),
            center,
            bbox: BoundingBox::new(w, s, e, n),
            radius_km,
        })
        .collect()
}

// =============================================================================
// Monitored gases. Thresholds are raw satellite units (before the display
// conversion factor), pegged to WHO 2021 guidance against Sentinel-5P ranges.
// (gas, name, unit, display unit, conversion, column threshold, critical threshold)
// =============================================================================
type GasRow = (Gas, &'static str, &'static str, &'static str, f64, f64, f64);

const GAS_TABLE: &[GasRow] = &[
    (Gas::No2, "Nitrogen Dioxide", "mol/m²", "µmol/m²", 1e6, 0.0001, 0.0002),
    (Gas::So2, "Sulfur Dioxide", "mol/m²", "µmol/m²", 1e6, 0.001, 0.005),
    (Gas::Co, "Carbon Monoxide", "mol/m²", "mmol/m²", 1e3, 0.03, 0.05),
    (Gas::Hcho, "Formaldehyde", "mol/m²", "µmol/m²", 1e6, 0.0003, 0.0006),
    (Gas::Ch4, "Methane", "ppb", "ppb", 1.0, 1900.0, 1950.0),
];

pub fn default_gases() -> Vec<GasSpec> {
    GAS_TABLE
        .iter()
        .map(|&(gas, name, unit, display_unit, conversion_factor, column_threshold, critical_threshold)| GasSpec {
            gas,
            name: name.to_string(),
            unit: unit.to_string(),
            display_unit: display_unit.to_string(),
            conversion_factor,
            column_threshold,
            critical_threshold,
        })
        .collect()
}
