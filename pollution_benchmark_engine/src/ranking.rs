// =============================================================================
// ranking.rs - EVERY CITY, SCORED, SORTED, COMPARED
// =============================================================================
//
// Each public operation loads one snapshot of both stores, then runs pure
// functions over it. A store that cannot be read degrades the snapshot (no
// cache documents, or no history) instead of failing the request, so a city
// always shows up; at worst it shows up neutral.
//
// Scoring is done in parallel with rayon. The sort is stable, so cities with
// equal scores keep configuration order.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{BenchmarkError, StoreError};
use crate::metrics::MetricsCollector;
use crate::models::{
    CacheRecord, Category, CityScore, DataCoverage, Gas, RankedCityScore, Severity, ViolationRecord,
};
use crate::scoring::{strategy_for, ScoreStrategy};
use crate::store::{group_by_city, CacheStore, ViolationStore};

/// Both stores, read once.
#[derive(Debug, Default, Clone)]
pub struct BenchmarkSnapshot {
    pub caches: HashMap<String, CacheRecord>,
    pub violations: HashMap<String, Vec<ViolationRecord>>,
    /// Cities whose cache document exists but could not be decoded.
    pub unreadable_caches: Vec<String>,
    pub cache_degraded: bool,
    pub history_degraded: bool,
}

impl BenchmarkSnapshot {
    pub async fn load(config: &Config, cache: &dyn CacheStore, violations: &dyn ViolationStore) -> Self {
        let mut snapshot = Self::default();

        for city in &config.cities {
            match cache.get(&city.name).await {
                Ok(Some(doc)) => {
                    snapshot.caches.insert(city.name.clone(), doc);
                }
                Ok(None) => {}
                Err(e @ StoreError::Serialization { .. }) => {
                    warn!(city = %city.name, error = %e, "Cache document unreadable, scoring city without live data");
                    snapshot.unreadable_caches.push(city.name.clone());
                }
                Err(e) => {
                    warn!(error = %e, "Cache store unavailable, scoring without live data");
                    snapshot.caches.clear();
                    snapshot.cache_degraded = true;
                    break;
                }
            }
        }

        match violations.get_all(None).await {
            Ok(all) => snapshot.violations = group_by_city(all),
            Err(e) => {
                warn!(error = %e, "Violation store unavailable, scoring without history");
                snapshot.history_degraded = true;
            }
        }

        debug!(
            cached_cities = snapshot.caches.len(),
            cities_with_history = snapshot.violations.len(),
            "Benchmark snapshot loaded"
        );
        snapshot
    }

    pub fn violations_for(&self, city: &str) -> &[ViolationRecord] {
        self.violations.get(city).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RegionalStats {
    pub region: String,
    pub cities: Vec<String>,
    pub city_count: usize,
    pub average_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    pub total_violations: usize,
    pub critical_violations: usize,
    pub cities_with_violations: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GasLeaderboardEntry {
    /// `None` for cities without a usable reading of this gas.
    pub rank: Option<usize>,
    pub city: String,
    pub region: String,
    pub value: Option<f64>,
    pub threshold_percent: Option<f64>,
    pub is_violation: bool,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GasComparison {
    pub gas: Gas,
    pub city_a_percent: Option<f64>,
    pub city_b_percent: Option<f64>,
    /// City name, "equal", or "unknown" when either side has no reading.
    pub cleaner: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CityComparison {
    pub city_a: RankedCityScore,
    pub city_b: RankedCityScore,
    pub gases: Vec<GasComparison>,
    /// City name or "equal".
    pub overall_cleaner: String,
    pub difference_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CoverageCounts {
    pub live_only: usize,
    pub historical_only: usize,
    pub both: usize,
    pub neither: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DateRange {
    pub oldest: NaiveDate,
    pub newest: NaiveDate,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SummaryStatistics {
    pub total_cities: usize,
    pub cities_with_data: usize,
    pub cleanest: Option<RankedCityScore>,
    pub most_polluted: Option<RankedCityScore>,
    pub average_score: f64,
    pub category_distribution: BTreeMap<Category, usize>,
    pub coverage: CoverageCounts,
    pub total_violations: usize,
    pub total_critical: usize,
    pub cities_with_violations: usize,
    pub violation_date_range: Option<DateRange>,
    /// Cities scored without live data because their document is unreadable.
    pub unreadable_caches: Vec<String>,
    pub cache_degraded: bool,
    pub history_degraded: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CategoryInfo {
    pub category: Category,
    pub label: &'static str,
    pub color: &'static str,
}

/// Display label and colour for every category, cleanest first.
pub fn category_info() -> Vec<CategoryInfo> {
    Category::ALL
        .iter()
        .map(|c| CategoryInfo { category: *c, label: c.label(), color: c.color() })
        .collect()
}

/// `|a - b| / max(a, b) * 100`. With a zero denominator: 0 when equal, else 100.
pub fn difference_percent(a: f64, b: f64) -> f64 {
    let denominator = a.max(b);
    if denominator == 0.0 {
        if a == b { 0.0 } else { 100.0 }
    } else {
        (a - b).abs() / denominator * 100.0
    }
}

pub struct BenchmarkAnalytics {
    config: Arc<Config>,
    strategy: Box<dyn ScoreStrategy>,
    cache: Arc<dyn CacheStore>,
    violations: Arc<dyn ViolationStore>,
    metrics: Arc<MetricsCollector>,
}

impl BenchmarkAnalytics {
    pub fn new(
        config: Arc<Config>,
        cache: Arc<dyn CacheStore>,
        violations: Arc<dyn ViolationStore>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let strategy = strategy_for(&config.scoring);
        Self { config, strategy, cache, violations, metrics }
    }

    pub async fn snapshot(&self) -> BenchmarkSnapshot {
        BenchmarkSnapshot::load(&self.config, self.cache.as_ref(), self.violations.as_ref()).await
    }

    // =========================================================================
    // STORE-BACKED OPERATIONS
    // =========================================================================

    pub async fn rank_cities(&self) -> Vec<RankedCityScore> {
        self.rank_snapshot(&self.snapshot().await)
    }

    pub async fn regional_statistics(&self) -> BTreeMap<String, RegionalStats> {
        self.regional_statistics_from(&self.snapshot().await)
    }

    pub async fn gas_leaderboard(&self, gas: Gas) -> Result<Vec<GasLeaderboardEntry>, BenchmarkError> {
        self.config.gas_spec(gas)?;
        Ok(self.gas_leaderboard_from(&self.snapshot().await, gas))
    }

    pub async fn compare_cities(&self, city_a: &str, city_b: &str) -> Result<CityComparison, BenchmarkError> {
        self.config.city(city_a)?;
        self.config.city(city_b)?;
        self.compare_cities_from(&self.snapshot().await, city_a, city_b)
    }

    pub async fn summary_statistics(&self) -> SummaryStatistics {
        self.summary_statistics_from(&self.snapshot().await)
    }

    // =========================================================================
    // PURE OPERATIONS OVER A SNAPSHOT
    // =========================================================================

    /// Every configured city, cleanest first, ranks from 1.
    pub fn rank_snapshot(&self, snapshot: &BenchmarkSnapshot) -> Vec<RankedCityScore> {
        let strategy = self.strategy.as_ref();
        let mut scores: Vec<CityScore> = self
            .config
            .cities
            .par_iter()
            .map(|city| strategy.score(city, snapshot.caches.get(&city.name), snapshot.violations_for(&city.name)))
            .collect();

        // Stable: ties keep configuration order.
        scores.sort_by(|a, b| a.pollution_index.total_cmp(&b.pollution_index));
        self.metrics.increment_rankings();

        scores
            .into_iter()
            .enumerate()
            .map(|(i, score)| RankedCityScore { rank: i + 1, score })
            .collect()
    }

    pub fn regional_statistics_from(&self, snapshot: &BenchmarkSnapshot) -> BTreeMap<String, RegionalStats> {
        let ranking = self.rank_snapshot(snapshot);
        let mut grouped: BTreeMap<&str, Vec<&RankedCityScore>> = BTreeMap::new();
        for entry in &ranking {
            grouped.entry(entry.score.region.as_str()).or_default().push(entry);
        }

        grouped
            .into_iter()
            .map(|(region, members)| {
                let scores: Vec<f64> = members.iter().map(|m| m.score.pollution_index).collect();
                let stats = RegionalStats {
                    region: region.to_string(),
                    cities: members.iter().map(|m| m.score.city.clone()).collect(),
                    city_count: members.len(),
                    average_score: scores.iter().sum::<f64>() / scores.len() as f64,
                    min_score: scores.iter().copied().fold(f64::INFINITY, f64::min),
                    max_score: scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    total_violations: members.iter().map(|m| m.score.violation_count).sum(),
                    critical_violations: members.iter().map(|m| m.score.critical_count).sum(),
                    cities_with_violations: members.iter().filter(|m| m.score.violation_count > 0).count(),
                };
                (region.to_string(), stats)
            })
            .collect()
    }

    /// Cities by single-gas threshold percentage. Cities without a usable
    /// reading come last, ordered by composite score, with no rank.
    pub fn gas_leaderboard_from(&self, snapshot: &BenchmarkSnapshot, gas: Gas) -> Vec<GasLeaderboardEntry> {
        let ranking = self.rank_snapshot(snapshot);
        let (mut ranked, unranked): (Vec<_>, Vec<_>) = ranking
            .iter()
            .map(|entry| {
                let reading = snapshot
                    .caches
                    .get(&entry.score.city)
                    .and_then(|doc| doc.latest_readings.get(&gas));
                GasLeaderboardEntry {
                    rank: None,
                    city: entry.score.city.clone(),
                    region: entry.score.region.clone(),
                    value: reading.map(|r| r.max),
                    threshold_percent: reading.and_then(|r| r.threshold_percentage()),
                    is_violation: reading.is_some_and(|r| r.is_violation),
                    timestamp: reading.map(|r| r.timestamp.clone()),
                }
            })
            .partition(|e| e.threshold_percent.is_some());

        ranked.sort_by(|a, b| {
            let pa = a.threshold_percent.unwrap_or(f64::INFINITY);
            let pb = b.threshold_percent.unwrap_or(f64::INFINITY);
            pa.total_cmp(&pb)
        });
        for (i, entry) in ranked.iter_mut().enumerate() {
            entry.rank = Some(i + 1);
        }
        ranked.extend(unranked);
        ranked
    }

    pub fn compare_cities_from(
        &self,
        snapshot: &BenchmarkSnapshot,
        city_a: &str,
        city_b: &str,
    ) -> Result<CityComparison, BenchmarkError> {
        let ranking = self.rank_snapshot(snapshot);
        let find = |name: &str| {
            ranking
                .iter()
                .find(|r| r.score.city == name)
                .cloned()
                .ok_or_else(|| BenchmarkError::UnknownCity(name.to_string()))
        };
        let a = find(city_a)?;
        let b = find(city_b)?;

        let percent = |city: &str, gas: Gas| {
            snapshot
                .caches
                .get(city)
                .and_then(|doc| doc.latest_readings.get(&gas))
                .and_then(|r| r.threshold_percentage())
        };

        let gases = self
            .config
            .gases
            .iter()
            .map(|spec| {
                let pa = percent(city_a, spec.gas);
                let pb = percent(city_b, spec.gas);
                let cleaner = match (pa, pb) {
                    (Some(x), Some(y)) if x < y => city_a.to_string(),
                    (Some(x), Some(y)) if y < x => city_b.to_string(),
                    (Some(_), Some(_)) => "equal".to_string(),
                    _ => "unknown".to_string(),
                };
                GasComparison { gas: spec.gas, city_a_percent: pa, city_b_percent: pb, cleaner }
            })
            .collect();

        let (sa, sb) = (a.score.pollution_index, b.score.pollution_index);
        let overall_cleaner = if sa < sb {
            city_a.to_string()
        } else if sb < sa {
            city_b.to_string()
        } else {
            "equal".to_string()
        };

        Ok(CityComparison {
            difference_percent: difference_percent(sa, sb),
            city_a: a,
            city_b: b,
            gases,
            overall_cleaner,
        })
    }

    pub fn summary_statistics_from(&self, snapshot: &BenchmarkSnapshot) -> SummaryStatistics {
        let ranking = self.rank_snapshot(snapshot);

        let mut category_distribution: BTreeMap<Category, usize> = Category::ALL.iter().map(|c| (*c, 0)).collect();
        let mut coverage = CoverageCounts::default();
        for entry in &ranking {
            *category_distribution.entry(entry.score.category).or_default() += 1;
            match entry.score.coverage() {
                DataCoverage::LiveOnly => coverage.live_only += 1,
                DataCoverage::HistoricalOnly => coverage.historical_only += 1,
                DataCoverage::Both => coverage.both += 1,
                DataCoverage::Neither => coverage.neither += 1,
            }
        }

        let history: Vec<&ViolationRecord> = self
            .config
            .cities
            .iter()
            .flat_map(|c| snapshot.violations_for(&c.name))
            .collect();
        let dates: Vec<NaiveDate> = history
            .iter()
            .filter_map(|v| v.timestamp.get(..10))
            .filter_map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .collect();
        let violation_date_range = match (dates.iter().min(), dates.iter().max()) {
            (Some(oldest), Some(newest)) => Some(DateRange { oldest: *oldest, newest: *newest }),
            _ => None,
        };

        let average_score = if ranking.is_empty() {
            0.0
        } else {
            ranking.iter().map(|r| r.score.pollution_index).sum::<f64>() / ranking.len() as f64
        };

        SummaryStatistics {
            total_cities: ranking.len(),
            cities_with_data: ranking.len() - coverage.neither,
            cleanest: ranking.first().cloned(),
            most_polluted: ranking.last().cloned(),
            average_score,
            category_distribution,
            coverage,
            total_violations: history.len(),
            total_critical: history.iter().filter(|v| v.severity == Severity::Critical).count(),
            cities_with_violations: ranking.iter().filter(|r| r.score.violation_count > 0).count(),
            violation_date_range,
            unreadable_caches: snapshot.unreadable_caches.clone(),
            cache_degraded: snapshot.cache_degraded,
            history_degraded: snapshot.history_degraded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GasReading, City};
    use crate::scoring::tests::{cache, violation};
    use crate::store::{MemoryCacheStore, MemoryViolationStore};

    struct Fixture {
        config: Arc<Config>,
        cache: Arc<MemoryCacheStore>,
        violations: Arc<MemoryViolationStore>,
        analytics: BenchmarkAnalytics,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(Config::default());
        let cache = Arc::new(MemoryCacheStore::new());
        let violations = Arc::new(MemoryViolationStore::new());
        let analytics = BenchmarkAnalytics::new(
            config.clone(),
            cache.clone(),
            violations.clone(),
            Arc::new(MetricsCollector::new()),
        );
        Fixture { config, cache, violations, analytics }
    }

    fn city(f: &Fixture, name: &str) -> City {
        f.config.city(name).unwrap().clone()
    }

    fn reading(max: f64, threshold: f64) -> GasReading {
        GasReading {
            max,
            mean: max,
            min: max,
            unit: "mol/m²".into(),
            threshold,
            is_violation: threshold > 0.0 && max >= threshold,
            percentage_over: 0.0,
            timestamp: "2024-03-01 13:20:00".into(),
            days_old: 0,
        }
    }

    async fn put_cache(f: &Fixture, name: &str, avg: f64, completeness: f64) {
        let doc = cache(&city(f, name), avg, completeness);
        f.cache.put(name, &doc).await.unwrap();
    }

    #[tokio::test]
    async fn test_every_city_is_ranked_even_without_data() {
        let f = fixture();
        put_cache(&f, "Riyadh", 10.0, 1.0).await;

        let ranking = f.analytics.rank_cities().await;

        assert_eq!(ranking.len(), f.config.cities.len());
        assert_eq!(ranking[0].score.city, "Riyadh");
        assert_eq!(ranking[0].rank, 1);
        assert!(ranking[1..].iter().all(|r| r.score.pollution_index == 50.0));
        let ranks: Vec<usize> = ranking.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, (1..=f.config.cities.len()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_ranking_is_idempotent() {
        let f = fixture();
        put_cache(&f, "Jubail", 95.0, 0.8).await;
        put_cache(&f, "Abha", 12.0, 0.6).await;
        f.violations
            .insert(&violation("Yanbu", Gas::So2, 120.0, "2024-03-01 13:00:00"), "")
            .await
            .unwrap();

        let first = f.analytics.rank_cities().await;
        let second = f.analytics.rank_cities().await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_equal_scores_keep_configuration_order() {
        let f = fixture();
        // Riyadh is configured after Jeddah.
        put_cache(&f, "Riyadh", 20.0, 1.0).await;
        put_cache(&f, "Jeddah", 20.0, 1.0).await;

        let ranking = f.analytics.rank_cities().await;
        assert_eq!(ranking[0].score.city, "Jeddah");
        assert_eq!(ranking[1].score.city, "Riyadh");
        assert_eq!((ranking[0].rank, ranking[1].rank), (1, 2));
    }

    #[tokio::test]
    async fn test_one_corrupt_document_only_affects_its_city() {
        let f = fixture();
        put_cache(&f, "Jeddah", 5.0, 1.0).await;
        f.cache.put_raw("Riyadh", "{not json");

        let ranking = f.analytics.rank_cities().await;
        assert_eq!(ranking.len(), f.config.cities.len());
        assert_eq!(ranking[0].score.city, "Jeddah");
        assert!((ranking[0].score.pollution_index - 3.5).abs() < 1e-9);
        let riyadh = ranking.iter().find(|r| r.score.city == "Riyadh").unwrap();
        assert_eq!(riyadh.score.pollution_index, 50.0);

        let summary = f.analytics.summary_statistics().await;
        assert!(!summary.cache_degraded);
        assert_eq!(summary.unreadable_caches, vec!["Riyadh".to_string()]);
        assert_eq!(summary.coverage.live_only, 1);
    }

    #[tokio::test]
    async fn test_unreachable_stores_degrade_to_neutral() {
        let f = fixture();
        put_cache(&f, "Riyadh", 10.0, 1.0).await;
        f.cache.set_available(false);
        f.violations.set_available(false);

        let summary = f.analytics.summary_statistics().await;
        assert!(summary.cache_degraded && summary.history_degraded);
        assert_eq!(summary.total_cities, f.config.cities.len());
        assert_eq!(summary.coverage.neither, f.config.cities.len());
        assert_eq!(summary.category_distribution[&Category::Moderate], f.config.cities.len());
    }

    #[tokio::test]
    async fn test_history_only_city_is_scored_from_history() {
        let f = fixture();
        f.violations
            .insert(&violation("Rabigh", Gas::No2, 50.0, "2024-03-01 13:00:00"), "")
            .await
            .unwrap();

        let ranking = f.analytics.rank_cities().await;
        let rabigh = ranking.iter().find(|r| r.score.city == "Rabigh").unwrap();
        // 1 * 3 + 50 * 0.2 = 13, plus the 30 uncertainty charge.
        assert!((rabigh.score.pollution_index - 43.0).abs() < 1e-9);
        assert_eq!(rabigh.score.coverage(), DataCoverage::HistoricalOnly);
    }

    #[tokio::test]
    async fn test_regional_statistics() {
        let f = fixture();
        put_cache(&f, "Jubail", 100.0, 1.0).await;
        put_cache(&f, "Dammam", 0.0, 1.0).await;
        f.violations
            .insert(&violation("Jubail", Gas::So2, 150.0, "2024-03-01 13:00:00"), "")
            .await
            .unwrap();

        let regions = f.analytics.regional_statistics().await;
        assert_eq!(regions.len(), 5);

        let eastern = &regions["Eastern"];
        assert_eq!(eastern.city_count, 6);
        assert_eq!(eastern.min_score, 0.0);
        assert_eq!(eastern.total_violations, 1);
        assert_eq!(eastern.critical_violations, 1);
        assert_eq!(eastern.cities_with_violations, 1);
        assert!(eastern.max_score > 70.0);
        let sum: usize = regions.values().map(|r| r.city_count).sum();
        assert_eq!(sum, f.config.cities.len());
    }

    #[tokio::test]
    async fn test_gas_leaderboard_puts_missing_readings_last() {
        let f = fixture();
        let mut a = cache(&city(&f, "Tabuk"), 10.0, 1.0);
        a.latest_readings.insert(Gas::No2, reading(0.00018, 0.0001));
        f.cache.put("Tabuk", &a).await.unwrap();
        let mut b = cache(&city(&f, "Hail"), 10.0, 1.0);
        b.latest_readings.insert(Gas::No2, reading(0.00005, 0.0001));
        f.cache.put("Hail", &b).await.unwrap();
        // Arar has a document but no NO2 reading.
        put_cache(&f, "Arar", 0.0, 1.0).await;

        let board = f.analytics.gas_leaderboard(Gas::No2).await.unwrap();

        assert_eq!(board.len(), f.config.cities.len());
        assert_eq!(board[0].city, "Hail");
        assert_eq!(board[0].rank, Some(1));
        assert_eq!(board[1].city, "Tabuk");
        assert_eq!(board[1].rank, Some(2));
        assert!(board[1].is_violation);
        assert!((board[1].threshold_percent.unwrap() - 180.0).abs() < 1e-9);
        assert!(board[2..].iter().all(|e| e.rank.is_none()));
        // Among the unranked, composite order still applies: Arar (0) first.
        assert_eq!(board[2].city, "Arar");
    }

    #[tokio::test]
    async fn test_gas_leaderboard_rejects_unconfigured_gas() {
        let mut config = Config::default();
        config.gases.retain(|g| g.gas != Gas::Ch4);
        let analytics = BenchmarkAnalytics::new(
            Arc::new(config),
            Arc::new(MemoryCacheStore::new()),
            Arc::new(MemoryViolationStore::new()),
            Arc::new(MetricsCollector::new()),
        );
        assert!(matches!(analytics.gas_leaderboard(Gas::Ch4).await, Err(BenchmarkError::UnknownGas(_))));
    }

    #[tokio::test]
    async fn test_compare_cities_is_symmetric() {
        let f = fixture();
        let mut a = cache(&city(&f, "Jeddah"), 60.0, 1.0);
        a.latest_readings.insert(Gas::No2, reading(0.00008, 0.0001));
        a.latest_readings.insert(Gas::So2, reading(0.0005, 0.001));
        f.cache.put("Jeddah", &a).await.unwrap();
        let mut b = cache(&city(&f, "Makkah"), 40.0, 1.0);
        b.latest_readings.insert(Gas::No2, reading(0.00004, 0.0001));
        b.latest_readings.insert(Gas::So2, reading(0.0005, 0.001));
        f.cache.put("Makkah", &b).await.unwrap();

        let ab = f.analytics.compare_cities("Jeddah", "Makkah").await.unwrap();
        let ba = f.analytics.compare_cities("Makkah", "Jeddah").await.unwrap();

        assert_eq!(ab.overall_cleaner, "Makkah");
        assert_eq!(ba.overall_cleaner, "Makkah");
        // 42 vs 28.
        assert!((ab.difference_percent - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(ab.difference_percent, ba.difference_percent);

        let no2 = ab.gases.iter().find(|g| g.gas == Gas::No2).unwrap();
        assert_eq!(no2.cleaner, "Makkah");
        let so2 = ab.gases.iter().find(|g| g.gas == Gas::So2).unwrap();
        assert_eq!(so2.cleaner, "equal");
        let co = ab.gases.iter().find(|g| g.gas == Gas::Co).unwrap();
        assert_eq!(co.cleaner, "unknown");
    }

    #[tokio::test]
    async fn test_compare_equal_scores() {
        let f = fixture();
        put_cache(&f, "Najran", 30.0, 1.0).await;
        put_cache(&f, "Jazan", 30.0, 1.0).await;

        let cmp = f.analytics.compare_cities("Najran", "Jazan").await.unwrap();
        assert_eq!(cmp.overall_cleaner, "equal");
        assert_eq!(cmp.difference_percent, 0.0);
    }

    #[tokio::test]
    async fn test_compare_unknown_city() {
        let f = fixture();
        assert!(matches!(
            f.analytics.compare_cities("Riyadh", "Gotham").await,
            Err(BenchmarkError::UnknownCity(name)) if name == "Gotham"
        ));
    }

    #[test]
    fn test_difference_percent_guards_zero() {
        assert_eq!(difference_percent(30.0, 30.0), 0.0);
        assert_eq!(difference_percent(0.0, 0.0), 0.0);
        assert_eq!(difference_percent(0.0, 10.0), 100.0);
        assert!((difference_percent(50.0, 40.0) - 20.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_summary_statistics() {
        let f = fixture();
        put_cache(&f, "Riyadh", 10.0, 1.0).await;
        put_cache(&f, "Jubail", 150.0, 1.0).await;
        f.violations
            .insert(&violation("Jubail", Gas::So2, 150.0, "2024-02-11 13:00:00"), "")
            .await
            .unwrap();
        f.violations
            .insert(&violation("Jubail", Gas::No2, 20.0, "2024-03-05 12:40:00"), "")
            .await
            .unwrap();
        f.violations
            .insert(&violation("Yanbu", Gas::So2, 40.0, "2024-02-20 13:10:00"), "")
            .await
            .unwrap();

        let summary = f.analytics.summary_statistics().await;

        assert_eq!(summary.total_cities, f.config.cities.len());
        assert_eq!(summary.cities_with_data, 3);
        assert_eq!(summary.cleanest.as_ref().unwrap().score.city, "Riyadh");
        assert_eq!(summary.most_polluted.as_ref().unwrap().score.city, "Jubail");
        assert_eq!(summary.coverage.live_only, 1);
        assert_eq!(summary.coverage.both, 1);
        assert_eq!(summary.coverage.historical_only, 1);
        assert_eq!(summary.total_violations, 3);
        assert_eq!(summary.total_critical, 1);
        assert_eq!(summary.cities_with_violations, 2);
        let range = summary.violation_date_range.unwrap();
        assert_eq!(range.oldest, NaiveDate::from_ymd_opt(2024, 2, 11).unwrap());
        assert_eq!(range.newest, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        let counted: usize = summary.category_distribution.values().sum();
        assert_eq!(counted, f.config.cities.len());
    }

    #[test]
    fn test_category_info_is_cleanest_first() {
        let info = category_info();
        assert_eq!(info.len(), 5);
        assert_eq!(info[0].label, "Cleanest");
        assert_eq!(info[4].color, "#dc2626");
    }
}
