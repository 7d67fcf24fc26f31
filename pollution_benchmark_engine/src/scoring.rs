// =============================================================================
// scoring.rs - FAIR SCORES FROM UNEVEN DATA
// =============================================================================
//
// Every city gets a composite score from two inputs that are never equally
// available: the latest cached scan (live) and the violation log (history).
//
//   live_score       = avg threshold percentage of the latest scan
//   historical_score = min(weighted_count * 3 + avg_exceedance * 0.2, 50)
//                      where weighted_count = moderate + 1.5 * critical
//
//   data_quality > 0.3        -> 0.7 * live + 0.3 * historical
//   history, thin live data   -> historical + 30
//   neither                   -> 50, "moderate"
//
// The cap keeps a long history from burying a clean live reading. The +30 is
// an uncertainty charge, not a pollution charge. The neutral 50 exists so a
// city nobody has measured can never top the "cleanest" list.
//
// Two older formulas survive behind the same trait for comparing against
// historical reports. Neither is the default.
//
// Everything in here is pure: same inputs, same score. No store access.
// =============================================================================

use std::collections::BTreeSet;

use crate::config::{ScoringConfig, ScoringMode};
use crate::models::{CacheRecord, Category, City, CityScore, Confidence, Severity, ViolationRecord};

pub trait ScoreStrategy: Send + Sync {
    fn mode(&self) -> ScoringMode;

    /// Score one city from its cache document (if any) and its violation history.
    fn score(&self, city: &City, cache: Option<&CacheRecord>, violations: &[ViolationRecord]) -> CityScore;

    /// Category for a composite produced by this strategy.
    fn categorize(&self, composite: f64) -> Category;
}

/// The configured strategy.
pub fn strategy_for(config: &ScoringConfig) -> Box<dyn ScoreStrategy> {
    match config.mode {
        ScoringMode::FairComposite => Box::new(FairComposite::new(config.clone())),
        ScoringMode::ThresholdWeighted => Box::new(ThresholdWeighted::new(config.clone())),
        ScoringMode::ViolationFrequency => Box::new(ViolationFrequency::new(config.clone())),
    }
}

/// Live part of a score: (avg threshold %, data quality, active violations).
fn live_inputs(cache: Option<&CacheRecord>) -> (f64, f64, usize) {
    match cache {
        Some(doc) => (
            doc.metrics.avg_threshold_percentage,
            doc.metrics.data_completeness,
            doc.metrics.active_violations,
        ),
        None => (0.0, 0.0, 0),
    }
}

fn critical_count(violations: &[ViolationRecord]) -> usize {
    violations.iter().filter(|v| v.severity == Severity::Critical).count()
}

/// Mean exceedance over violations that actually exceeded. Zero when none did.
fn average_exceedance(violations: &[ViolationRecord]) -> f64 {
    let positive: Vec<f64> = violations
        .iter()
        .map(|v| v.percentage_over)
        .filter(|p| *p > 0.0)
        .collect();
    if positive.is_empty() {
        0.0
    } else {
        positive.iter().sum::<f64>() / positive.len() as f64
    }
}

/// Capped historical score. Zero for an empty history.
pub fn historical_score(violations: &[ViolationRecord], config: &ScoringConfig) -> f64 {
    if violations.is_empty() {
        return 0.0;
    }
    let critical = critical_count(violations) as f64;
    let moderate = violations.len() as f64 - critical;
    let weighted = moderate + config.critical_weight * critical;
    let raw = weighted * config.violation_weight + average_exceedance(violations) * config.exceedance_weight;
    raw.min(config.historical_cap)
}

pub fn confidence(data_quality: f64, violation_count: usize, config: &ScoringConfig) -> Confidence {
    let good_live = data_quality > config.confidence_min_quality;
    let enough_history = violation_count >= config.confidence_min_violations;
    match (good_live, enough_history) {
        (true, true) => Confidence::High,
        (true, false) | (false, true) => Confidence::Medium,
        (false, false) => Confidence::Low,
    }
}

/// Bands shared by the fair and threshold-weighted strategies.
pub fn fair_category(composite: f64) -> Category {
    if composite < 30.0 {
        Category::Cleanest
    } else if composite < 60.0 {
        Category::Clean
    } else if composite < 90.0 {
        Category::Moderate
    } else if composite < 120.0 {
        Category::Polluted
    } else {
        Category::HeavilyPolluted
    }
}

fn city_score(
    city: &City,
    cache: Option<&CacheRecord>,
    violations: &[ViolationRecord],
    composite: f64,
    historical: f64,
    category: Category,
    config: &ScoringConfig,
) -> CityScore {
    let (live_score, data_quality, active_violations) = live_inputs(cache);
    CityScore {
        city: city.name.clone(),
        region: city.region.clone(),
        pollution_index: composite,
        live_score,
        historical_score: historical,
        category,
        confidence: confidence(data_quality, violations.len(), config),
        data_quality,
        violation_count: violations.len(),
        critical_count: critical_count(violations),
        active_violations,
        has_live_data: data_quality > 0.0,
        has_history: !violations.is_empty(),
    }
}

// =============================================================================
// FAIR COMPOSITE (canonical)
// =============================================================================

pub struct FairComposite {
    config: ScoringConfig,
}

impl FairComposite {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }
}

impl ScoreStrategy for FairComposite {
    fn mode(&self) -> ScoringMode {
        ScoringMode::FairComposite
    }

    fn score(&self, city: &City, cache: Option<&CacheRecord>, violations: &[ViolationRecord]) -> CityScore {
        let cfg = &self.config;
        let (live_score, data_quality, _) = live_inputs(cache);
        let historical = historical_score(violations, cfg);

        let (composite, category) = if data_quality > cfg.live_data_threshold {
            let composite = cfg.live_weight * live_score + cfg.historical_weight * historical;
            (composite, self.categorize(composite))
        } else if !violations.is_empty() {
            let composite = historical + cfg.uncertainty_penalty;
            (composite, self.categorize(composite))
        } else {
            // Unmeasured is not the same as clean.
            (cfg.neutral_score, Category::Moderate)
        };

        city_score(city, cache, violations, composite, historical, category, cfg)
    }

    fn categorize(&self, composite: f64) -> Category {
        fair_category(composite)
    }
}

// =============================================================================
// THRESHOLD WEIGHTED (legacy)
// =============================================================================

/// Live average threshold percentage plus a flat bonus per active violation.
/// History is reported but does not move the score.
pub struct ThresholdWeighted {
    config: ScoringConfig,
}

impl ThresholdWeighted {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }
}

impl ScoreStrategy for ThresholdWeighted {
    fn mode(&self) -> ScoringMode {
        ScoringMode::ThresholdWeighted
    }

    fn score(&self, city: &City, cache: Option<&CacheRecord>, violations: &[ViolationRecord]) -> CityScore {
        let cfg = &self.config;
        let (live_score, data_quality, active) = live_inputs(cache);
        let historical = historical_score(violations, cfg);

        let (composite, category) = if data_quality > 0.0 {
            let composite = live_score + active as f64 * cfg.active_violation_bonus;
            (composite, self.categorize(composite))
        } else {
            (cfg.neutral_score, Category::Moderate)
        };

        city_score(city, cache, violations, composite, historical, category, cfg)
    }

    fn categorize(&self, composite: f64) -> Category {
        fair_category(composite)
    }
}

// =============================================================================
// VIOLATION FREQUENCY (legacy)
// =============================================================================

/// History only:
/// `(moderate + 2 * critical) * (1 + 0.1 * (distinct_gases - 1)) * (1 + avg_exceedance / 200)`.
///
/// A city with no recorded violations scores 0 here, measured or not. That
/// is exactly the bias the fair composite removes; keep this one for
/// reproducing old reports only.
pub struct ViolationFrequency {
    config: ScoringConfig,
}

impl ViolationFrequency {
    const CRITICAL_WEIGHT: f64 = 2.0;
    const GAS_DIVERSITY_STEP: f64 = 0.1;
    const EXCEEDANCE_FACTOR: f64 = 0.5;

    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn frequency_score(violations: &[ViolationRecord]) -> f64 {
        if violations.is_empty() {
            return 0.0;
        }
        let critical = critical_count(violations) as f64;
        let moderate = violations.len() as f64 - critical;
        let gases: BTreeSet<_> = violations.iter().map(|v| v.gas).collect();

        let base = moderate + Self::CRITICAL_WEIGHT * critical;
        let diversity = 1.0 + Self::GAS_DIVERSITY_STEP * (gases.len() as f64 - 1.0);
        let severity = 1.0 + average_exceedance(violations) / 100.0 * Self::EXCEEDANCE_FACTOR;
        base * diversity * severity
    }
}

impl ScoreStrategy for ViolationFrequency {
    fn mode(&self) -> ScoringMode {
        ScoringMode::ViolationFrequency
    }

    fn score(&self, city: &City, cache: Option<&CacheRecord>, violations: &[ViolationRecord]) -> CityScore {
        let composite = Self::frequency_score(violations);
        city_score(city, cache, violations, composite, composite, self.categorize(composite), &self.config)
    }

    fn categorize(&self, composite: f64) -> Category {
        if composite < 5.0 {
            Category::Cleanest
        } else if composite < 15.0 {
            Category::Clean
        } else if composite < 30.0 {
            Category::Moderate
        } else if composite < 50.0 {
            Category::Polluted
        } else {
            Category::HeavilyPolluted
        }
    }
}
