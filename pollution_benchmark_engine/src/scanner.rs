// =============================================================================
// scanner.rs - ONE SATELLITE PASS PER GAS, DEMULTIPLEXED INTO EVERY CITY
// =============================================================================
//
// The regional scan asks the gas reading service for exactly one image per
// gas covering the whole monitored area, then reduces that one image over
// every city box. Five remote listings per scan instead of five per city.
//
//   1. FETCH    all gases concurrently. Empty window? Retry once, wider.
//               Pick the newest candidate with valid pixels over the region.
//   2. EXTRACT  mean/max/min per (city, gas), bounded concurrency. Negative
//               values are clamped. Null reductions drop that gas for that
//               city only.
//   3. JUDGE    violation = max >= threshold (threshold > 0). Severity by
//               exceedance. Pollution index = average threshold percentage.
//   4. PERSIST  record new violations (local dedup, then store `exists`, then
//               insert) and overwrite the cache document of every city with
//               at least one reading.
//
// Nothing in here is fatal. A gas that cannot be fetched is unavailable for
// this scan, a city that cannot be extracted is listed as failed, a store
// write that fails is logged and counted. The only whole-scan outcome other
// than success is "no satellite data", and that leaves the cache untouched.
//
// The whole scan runs under a wall-clock ceiling. Work still in flight when
// it passes is dropped; work already finished is kept and persisted.
//
// The legacy per-city path (single-city user scans, batched background scans)
// lists images per (gas, city). The remote enforces a rate limit on that path,
// hence small batches with a breather in between.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use futures::stream::{self, FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ScoringMode};
use crate::dedup::DedupEngine;
use crate::error::{BenchmarkError, StoreError};
use crate::fetcher::{GasReadingFetcher, ImageHandle, RegionStats};
use crate::metrics::MetricsCollector;
use crate::models::{
    dedup_key, BoundingBox, CacheRecord, City, CityMetrics, Gas, GasReading, GasSpec, MonitoringStats,
    ScanOrigin, ScanViolation, Severity, ViolationRecord,
};
use crate::store::{CacheStore, ViolationStore};

/// Format of every KSA-localized timestamp we write.
pub const KSA_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// Every gas fetched and every city extracted.
    Success,
    /// Some gases unavailable or some cities failed.
    Partial,
    /// The wall-clock ceiling cut the scan short. Finished work was kept.
    DeadlineExceeded,
    /// Not a single gas could be fetched. The cache was not touched.
    NoSatelliteData,
}

/// One city's results from one scan.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CityScan {
    pub city: String,
    pub region: String,
    pub readings: BTreeMap<Gas, GasReading>,
    pub metrics: CityMetrics,
    pub violations: Vec<ScanViolation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub status: ScanStatus,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub days_back: u32,
    pub gases_available: Vec<Gas>,
    pub gases_unavailable: Vec<Gas>,
    /// Successfully scanned cities, in configuration order.
    pub cities: Vec<CityScan>,
    pub failed_cities: Vec<String>,
    pub violations_detected: usize,
    pub violations_recorded: usize,
    /// Detected violations that could not be checked or stored.
    pub violation_failures: usize,
    pub cache_writes: usize,
}

impl ScanResult {
    fn new(started_at: DateTime<Utc>, days_back: u32) -> Self {
        Self {
            status: ScanStatus::Success,
            message: String::new(),
            started_at,
            duration_secs: 0.0,
            days_back,
            gases_available: Vec::new(),
            gases_unavailable: Vec::new(),
            cities: Vec::new(),
            failed_cities: Vec::new(),
            violations_detected: 0,
            violations_recorded: 0,
            violation_failures: 0,
            cache_writes: 0,
        }
    }

    pub fn city(&self, name: &str) -> Option<&CityScan> {
        self.cities.iter().find(|c| c.city == name)
    }
}

/// What happened to one detected violation on its way to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Recorded,
    AlreadyStored,
    Failed,
}

/// What `persist_city` managed to write for one city.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PersistOutcome {
    recorded: usize,
    failed: usize,
    cache_written: bool,
}

impl ScanResult {
    fn absorb(&mut self, scan: CityScan, outcome: PersistOutcome) {
        self.violations_detected += scan.violations.len();
        self.violations_recorded += outcome.recorded;
        self.violation_failures += outcome.failed;
        self.cache_writes += usize::from(outcome.cache_written);
        self.cities.push(scan);
    }

    /// Every scanned city cached and every detected violation accounted for.
    fn fully_persisted(&self) -> bool {
        self.cache_writes == self.cities.len() && self.violation_failures == 0
    }
}

pub struct RegionalScanner {
    config: Arc<Config>,
    fetcher: Arc<dyn GasReadingFetcher>,
    cache: Arc<dyn CacheStore>,
    violations: Arc<dyn ViolationStore>,
    dedup: Arc<DedupEngine>,
    metrics: Arc<MetricsCollector>,
}

impl RegionalScanner {
    pub fn new(
        config: Arc<Config>,
        fetcher: Arc<dyn GasReadingFetcher>,
        cache: Arc<dyn CacheStore>,
        violations: Arc<dyn ViolationStore>,
        dedup: Arc<DedupEngine>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self { config, fetcher, cache, violations, dedup, metrics }
    }

    // =========================================================================
    // REGIONAL SCAN
    // =========================================================================

    /// Scan every configured city from one image per gas.
    pub async fn scan_all_cities(&self, days_back: u32, auto_record_violations: bool) -> ScanResult {
        let started_at = Utc::now();
        let deadline = Instant::now() + self.config.max_scan_duration;
        let mut result = ScanResult::new(started_at, days_back);
        self.metrics.scan_started();

        info!(
            cities = self.config.cities.len(),
            gases = self.config.gases.len(),
            days_back = days_back,
            "Regional scan starting"
        );

        let Some(region) = self.config.monitored_region() else {
            warn!("No cities configured, nothing to scan");
            return self.finish(result, started_at);
        };

        // ---- 1. FETCH ------------------------------------------------------
        let mut pending: FuturesUnordered<_> = self
            .config
            .gases
            .iter()
            .map(|spec| async move { (spec.gas, self.select_regional_image(spec.gas, &region, days_back).await) })
            .collect();

        let mut images: BTreeMap<Gas, ImageHandle> = BTreeMap::new();
        let mut timed_out = false;
        loop {
            match timeout_at(deadline, pending.next()).await {
                Ok(Some((gas, Some(image)))) => {
                    images.insert(gas, image);
                }
                Ok(Some((gas, None))) => result.gases_unavailable.push(gas),
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }
        drop(pending);

        for spec in &self.config.gases {
            if !images.contains_key(&spec.gas) && !result.gases_unavailable.contains(&spec.gas) {
                result.gases_unavailable.push(spec.gas);
            }
        }
        result.gases_available = images.keys().copied().collect();
        result.gases_unavailable.sort();
        self.metrics.add_gases_unavailable(result.gases_unavailable.len());

        if images.is_empty() && timed_out {
            warn!(
                ceiling_secs = self.config.max_scan_duration.as_secs(),
                "Scan wall-clock ceiling reached before any image was selected"
            );
            result.status = ScanStatus::DeadlineExceeded;
            result.message = "Scan deadline reached while fetching images; cached data left untouched".into();
            result.failed_cities = self.config.cities.iter().map(|c| c.name.clone()).collect();
            self.metrics.scan_past_deadline();
            return self.finish(result, started_at);
        }

        if images.is_empty() {
            result.status = ScanStatus::NoSatelliteData;
            result.message = "No satellite data available for any gas; cached data left untouched".into();
            warn!(days_back = days_back, "Regional scan found no satellite data for any gas");
            self.metrics.scan_without_data();
            return self.finish(result, started_at);
        }

        info!(
            available = ?result.gases_available,
            unavailable = ?result.gases_unavailable,
            "Regional images selected"
        );

        // ---- 2 + 3. EXTRACT AND JUDGE ---------------------------------------
        let now = Utc::now();
        let concurrency = self.config.max_parallel_extractions.max(1);
        let images = &images;
        let jobs: Vec<_> = self
            .config
            .cities
            .iter()
            .enumerate()
            .map(|(position, city)| async move { (position, city, self.extract_city(city, images, now).await) })
            .collect();
        let mut extractions = stream::iter(jobs).buffer_unordered(concurrency);

        let mut gathered: Vec<(usize, &City, CityScan)> = Vec::new();
        let mut finished = vec![false; self.config.cities.len()];
        while !timed_out {
            match timeout_at(deadline, extractions.next()).await {
                Ok(Some((position, city, scan))) => {
                    finished[position] = true;
                    if scan.metrics.data_completeness > 0.0 {
                        gathered.push((position, city, scan));
                    } else {
                        warn!(city = %city.name, "No gas could be extracted for city");
                        result.failed_cities.push(city.name.clone());
                    }
                }
                Ok(None) => break,
                Err(_) => timed_out = true,
            }
        }
        drop(extractions);

        if timed_out {
            let abandoned: Vec<&str> = self
                .config
                .cities
                .iter()
                .zip(&finished)
                .filter(|(_, done)| !**done)
                .map(|(c, _)| c.name.as_str())
                .collect();
            warn!(
                ceiling_secs = self.config.max_scan_duration.as_secs(),
                completed = gathered.len(),
                abandoned = abandoned.len(),
                "Scan wall-clock ceiling reached, keeping finished cities"
            );
            result.failed_cities.extend(abandoned.into_iter().map(str::to_string));
        }
        gathered.sort_by_key(|(position, _, _)| *position);

        // ---- 4. PERSIST -----------------------------------------------------
        for (_, city, scan) in gathered {
            let outcome = self
                .persist_city(city, &scan, ScanOrigin::Background, auto_record_violations)
                .await;
            result.absorb(scan, outcome);
        }

        result.status = if timed_out {
            self.metrics.scan_past_deadline();
            ScanStatus::DeadlineExceeded
        } else if result.gases_unavailable.is_empty()
            && result.failed_cities.is_empty()
            && result.fully_persisted()
        {
            ScanStatus::Success
        } else {
            ScanStatus::Partial
        };
        result.message = format!(
            "Scanned {} of {} cities with {} of {} gases",
            result.cities.len(),
            self.config.cities.len(),
            result.gases_available.len(),
            self.config.gases.len()
        );
        self.finish(result, started_at)
    }

    /// Newest candidate for `gas` with valid pixels over the whole region.
    async fn select_regional_image(&self, gas: Gas, region: &BoundingBox, days_back: u32) -> Option<ImageHandle> {
        self.first_valid_reduction(gas, region, days_back)
            .await
            .map(|(image, _)| image)
    }

    /// List candidates (widening the window once if empty) and walk them
    /// newest first until one reduces to non-null statistics over `bbox`.
    async fn first_valid_reduction(
        &self,
        gas: Gas,
        bbox: &BoundingBox,
        days_back: u32,
    ) -> Option<(ImageHandle, RegionStats)> {
        let mut candidates = match self.fetcher.fetch_region(gas, bbox, days_back).await {
            Ok(c) => c,
            Err(e) => {
                warn!(gas = %gas, error = %e, "Image listing failed, gas unavailable for this scan");
                return None;
            }
        };

        if candidates.is_empty() {
            let widened = days_back.saturating_mul(self.config.empty_window_multiplier.max(1));
            info!(gas = %gas, days_back = days_back, widened = widened, "No images in window, retrying wider");
            candidates = match self.fetcher.fetch_region(gas, bbox, widened).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(gas = %gas, error = %e, "Widened image listing failed");
                    return None;
                }
            };
        }

        if candidates.is_empty() {
            warn!(gas = %gas, "No images even in the widened window, gas unavailable");
            return None;
        }

        candidates.sort_by(|a, b| b.acquired_at.cmp(&a.acquired_at));
        for image in candidates.into_iter().take(self.config.max_candidate_images) {
            match self.fetcher.reduce_region(&image, bbox).await {
                Ok(Some(stats)) => {
                    debug!(gas = %gas, image = %image.id, acquired_at = %image.acquired_at, "Candidate accepted");
                    return Some((image, stats));
                }
                Ok(None) => debug!(gas = %gas, image = %image.id, "Candidate has no valid pixels, trying older"),
                Err(e) => debug!(gas = %gas, image = %image.id, error = %e, "Candidate reduction failed, trying older"),
            }
        }

        warn!(gas = %gas, "No candidate image had valid pixels, gas unavailable");
        None
    }

    /// Reduce every selected image over one city. Failures drop only the
    /// affected gas.
    async fn extract_city(&self, city: &City, images: &BTreeMap<Gas, ImageHandle>, now: DateTime<Utc>) -> CityScan {
        let mut readings = Vec::new();
        for spec in &self.config.gases {
            let Some(image) = images.get(&spec.gas) else { continue };
            match self.fetcher.reduce_region(image, &city.bbox).await {
                Ok(Some(stats)) => readings.push((spec, stats, image.acquired_at)),
                Ok(None) => debug!(city = %city.name, gas = %spec.gas, "Null reduction over city box"),
                Err(e) => warn!(city = %city.name, gas = %spec.gas, error = %e, "City extraction failed for gas"),
            }
        }
        self.build_city_scan(city, readings, now)
    }

    // =========================================================================
    // LEGACY PER-CITY PATH
    // =========================================================================

    /// Scan one city on a user's request. Unknown names are an error, a scan
    /// that finds nothing is not.
    pub async fn scan_single_city(
        &self,
        city_name: &str,
        days_back: u32,
        save_cache: bool,
    ) -> Result<CityScan, BenchmarkError> {
        let city = self.config.city(city_name)?;
        info!(city = %city.name, days_back = days_back, "Single-city scan requested");

        let scan = self.scan_city_direct(city, days_back).await;
        if scan.metrics.data_completeness > 0.0 && save_cache {
            self.persist_city(city, &scan, ScanOrigin::User, self.config.auto_record_violations)
                .await;
        } else if scan.metrics.data_completeness == 0.0 {
            warn!(city = %city.name, "Single-city scan found no data");
        }
        Ok(scan)
    }

    /// Background per-city scan of `cities`, `legacy_batch_size` at a time
    /// with `legacy_batch_delay` between batches.
    pub async fn scan_cities_batch(&self, cities: &[String], days_back: u32) -> ScanResult {
        let started_at = Utc::now();
        let deadline = Instant::now() + self.config.max_scan_duration;
        let mut result = ScanResult::new(started_at, days_back);
        self.metrics.scan_started();

        let mut targets = Vec::new();
        for name in cities {
            match self.config.city(name) {
                Ok(city) => targets.push(city),
                Err(e) => {
                    warn!(error = %e, "Skipping unknown city in batch scan");
                    result.failed_cities.push(name.clone());
                }
            }
        }

        let batch_size = self.config.legacy_batch_size.max(1);
        let batches: Vec<&[&City]> = targets.chunks(batch_size).collect();
        info!(cities = targets.len(), batches = batches.len(), batch_size = batch_size, "Batched city scan starting");

        let mut timed_out = false;
        for (i, batch) in batches.iter().enumerate() {
            let work = futures::future::join_all(batch.iter().map(|city| async move {
                (*city, self.scan_city_direct(city, days_back).await)
            }));
            let scans = match timeout_at(deadline, work).await {
                Ok(scans) => scans,
                Err(_) => {
                    timed_out = true;
                    result
                        .failed_cities
                        .extend(batches[i..].iter().flat_map(|b| b.iter().map(|c| c.name.clone())));
                    break;
                }
            };

            for (city, scan) in scans {
                if scan.metrics.data_completeness == 0.0 {
                    result.failed_cities.push(city.name.clone());
                    continue;
                }
                let outcome = self
                    .persist_city(city, &scan, ScanOrigin::Background, self.config.auto_record_violations)
                    .await;
                result.absorb(scan, outcome);
            }

            if i + 1 < batches.len() {
                if Instant::now() + self.config.legacy_batch_delay >= deadline {
                    timed_out = true;
                    result
                        .failed_cities
                        .extend(batches[i + 1..].iter().flat_map(|b| b.iter().map(|c| c.name.clone())));
                    break;
                }
                debug!(batch = i + 1, delay_secs = self.config.legacy_batch_delay.as_secs(), "Pausing between batches");
                sleep(self.config.legacy_batch_delay).await;
            }
        }

        result.status = if timed_out {
            warn!(completed = result.cities.len(), "Batched scan hit the wall-clock ceiling");
            self.metrics.scan_past_deadline();
            ScanStatus::DeadlineExceeded
        } else if result.cities.is_empty() && !targets.is_empty() {
            self.metrics.scan_without_data();
            ScanStatus::NoSatelliteData
        } else if result.failed_cities.is_empty() && result.fully_persisted() {
            ScanStatus::Success
        } else {
            ScanStatus::Partial
        };
        result.message = format!("Scanned {} of {} requested cities", result.cities.len(), cities.len());
        self.finish(result, started_at)
    }

    /// Per-(gas, city) listing and reduction over the city box itself.
    async fn scan_city_direct(&self, city: &City, days_back: u32) -> CityScan {
        let fetches = self.config.gases.iter().map(|spec| async move {
            let found = self.first_valid_reduction(spec.gas, &city.bbox, days_back).await;
            found.map(|(image, stats)| (spec, stats, image.acquired_at))
        });
        let readings: Vec<_> = futures::future::join_all(fetches).await.into_iter().flatten().collect();
        self.build_city_scan(city, readings, Utc::now())
    }

    // =========================================================================
    // SHARED
    // =========================================================================

    fn build_city_scan(
        &self,
        city: &City,
        readings: Vec<(&GasSpec, RegionStats, DateTime<Utc>)>,
        now: DateTime<Utc>,
    ) -> CityScan {
        let offset = self.config.local_offset();
        let mut by_gas = BTreeMap::new();
        let mut violations = Vec::new();
        for (spec, stats, acquired_at) in readings {
            let (reading, violation) = assess_reading(spec, stats, acquired_at, now, offset);
            if let Some(v) = violation {
                violations.push(v);
            }
            by_gas.insert(spec.gas, reading);
        }

        let metrics = city_metrics(
            &by_gas,
            self.config.gases.len(),
            self.config.scoring.mode,
            self.config.scoring.active_violation_bonus,
        );
        CityScan { city: city.name.clone(), region: city.region.clone(), readings: by_gas, metrics, violations }
    }

    /// Record the city's violations, then overwrite its cache document.
    async fn persist_city(
        &self,
        city: &City,
        scan: &CityScan,
        origin: ScanOrigin,
        auto_record_violations: bool,
    ) -> PersistOutcome {
        let mut outcome = PersistOutcome::default();
        if auto_record_violations {
            for violation in &scan.violations {
                let Some(reading) = scan.readings.get(&violation.gas) else { continue };
                match self.record_violation(&city.name, violation, &reading.timestamp).await {
                    RecordOutcome::Recorded => outcome.recorded += 1,
                    RecordOutcome::AlreadyStored => {}
                    RecordOutcome::Failed => outcome.failed += 1,
                }
            }
        }

        // Read-then-write so the counters continue from the previous document.
        // An undecodable document is replaced; an unreachable store is not
        // overwritten, or its counters would restart from zero.
        let previous = match self.cache.get(&city.name).await {
            Ok(previous) => previous,
            Err(e @ StoreError::Serialization { .. }) => {
                warn!(city = %city.name, error = %e, "Cache document unreadable, replacing it with fresh counters");
                None
            }
            Err(e) => {
                error!(city = %city.name, error = %e, "Could not read cache document, skipping write");
                self.metrics.increment_store_failures();
                return outcome;
            }
        };

        let now = Utc::now();
        let today = now.with_timezone(&self.config.local_offset()).date_naive();
        let record = CacheRecord {
            city: city.name.clone(),
            region: city.region.clone(),
            last_updated: now,
            latest_readings: scan.readings.clone(),
            metrics: scan.metrics.clone(),
            violations: scan.violations.clone(),
            monitoring_stats: MonitoringStats::next(previous.as_ref().map(|p| &p.monitoring_stats), origin, today),
        };

        match self.cache.put(&city.name, &record).await {
            Ok(()) => {
                self.metrics.increment_cache_writes();
                debug!(
                    city = %city.name,
                    total_scans = record.monitoring_stats.total_scans,
                    completeness = scan.metrics.data_completeness,
                    "Cache document updated"
                );
                outcome.cache_written = true;
                outcome
            }
            Err(e) => {
                error!(city = %city.name, error = %e, "Cache write failed");
                self.metrics.increment_store_failures();
                outcome
            }
        }
    }

    async fn record_violation(&self, city: &str, violation: &ScanViolation, timestamp: &str) -> RecordOutcome {
        let key = dedup_key(city, violation.gas, timestamp);
        if self.dedup.is_known(&key) {
            self.metrics.increment_violations_already_stored();
            return RecordOutcome::AlreadyStored;
        }

        match self.violations.exists(city, violation.gas, timestamp).await {
            Ok(true) => {
                self.dedup.remember(&key);
                self.metrics.increment_violations_already_stored();
                return RecordOutcome::AlreadyStored;
            }
            Ok(false) => {}
            Err(e) => {
                error!(city = %city, gas = %violation.gas, error = %e, "Violation existence check failed");
                self.metrics.increment_store_failures();
                return RecordOutcome::Failed;
            }
        }

        let record = ViolationRecord::new(city, violation.gas, violation, timestamp);
        let narrative = record.narrative();
        match self.violations.insert(&record, &narrative).await {
            Ok(inserted) => {
                self.dedup.remember(&key);
                if inserted {
                    self.metrics.increment_violations_recorded();
                    info!(
                        city = %city,
                        gas = %violation.gas,
                        severity = %violation.severity,
                        percentage_over = violation.percentage_over,
                        "Violation recorded"
                    );
                    RecordOutcome::Recorded
                } else {
                    self.metrics.increment_violations_already_stored();
                    RecordOutcome::AlreadyStored
                }
            }
            Err(e) => {
                error!(city = %city, gas = %violation.gas, error = %e, "Violation insert failed");
                self.metrics.increment_store_failures();
                RecordOutcome::Failed
            }
        }
    }

    fn finish(&self, mut result: ScanResult, started_at: DateTime<Utc>) -> ScanResult {
        result.duration_secs = (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0;
        self.metrics.add_cities_scanned(result.cities.len());
        self.metrics.add_city_failures(result.failed_cities.len());
        self.metrics.add_violations_detected(result.violations_detected);
        self.metrics.scan_completed(result.duration_secs);
        info!(
            status = ?result.status,
            cities = result.cities.len(),
            failed = result.failed_cities.len(),
            violations_detected = result.violations_detected,
            violations_recorded = result.violations_recorded,
            duration_secs = result.duration_secs,
            "Scan finished"
        );
        result
    }
}

/// Turn raw statistics into a reading, plus a violation when the max breaks
/// the column threshold.
pub fn assess_reading(
    spec: &GasSpec,
    stats: RegionStats,
    acquired_at: DateTime<Utc>,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> (GasReading, Option<ScanViolation>) {
    let stats = stats.clamped();
    let threshold = spec.column_threshold;
    let is_violation = threshold > 0.0 && stats.max >= threshold;
    let percentage_over = if is_violation { (stats.max - threshold) / threshold * 100.0 } else { 0.0 };

    let reading = GasReading {
        max: stats.max,
        mean: stats.mean,
        min: stats.min,
        unit: spec.unit.clone(),
        threshold,
        is_violation,
        percentage_over,
        timestamp: acquired_at.with_timezone(&offset).format(KSA_TIMESTAMP_FORMAT).to_string(),
        days_old: (now - acquired_at).num_days().max(0),
    };

    let violation = is_violation.then(|| ScanViolation {
        gas: spec.gas,
        value: stats.max,
        threshold,
        percentage_over,
        severity: Severity::from_exceedance(percentage_over),
    });
    (reading, violation)
}

/// Per-scan city summary. In fair mode the index is the bare average
/// threshold percentage; only threshold-weighted mode adds a violation bonus.
pub fn city_metrics(
    readings: &BTreeMap<Gas, GasReading>,
    configured_gases: usize,
    mode: ScoringMode,
    active_violation_bonus: f64,
) -> CityMetrics {
    let percentages: Vec<f64> = readings.values().filter_map(GasReading::threshold_percentage).collect();
    let avg_threshold_percentage = if percentages.is_empty() {
        0.0
    } else {
        percentages.iter().sum::<f64>() / percentages.len() as f64
    };
    let active_violations = readings.values().filter(|r| r.is_violation).count();

    let pollution_index = match mode {
        ScoringMode::ThresholdWeighted => avg_threshold_percentage + active_violations as f64 * active_violation_bonus,
        ScoringMode::FairComposite | ScoringMode::ViolationFrequency => avg_threshold_percentage,
    };

    CityMetrics {
        pollution_index,
        active_violations,
        gases_monitored: readings.len(),
        data_completeness: if configured_gases == 0 { 0.0 } else { readings.len() as f64 / configured_gases as f64 },
        avg_threshold_percentage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::store::{MemoryCacheStore, MemoryViolationStore};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone};
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted stand-in for the gas reading service.
    #[derive(Default)]
    struct FakeFetcher {
        cities: Vec<City>,
        images: HashMap<Gas, Vec<ImageHandle>>,
        /// Gases whose images only show up in a window of at least this many days.
        min_window: HashMap<Gas, u32>,
        /// Images with no valid pixels anywhere.
        invalid_images: HashSet<String>,
        /// Max value per gas, applied to every city unless overridden.
        values: HashMap<Gas, f64>,
        city_values: HashMap<(String, Gas), f64>,
        failing_cities: HashSet<String>,
        slow_cities: HashSet<String>,
        /// Every image listing hangs for hours.
        slow_listings: bool,
        listings: AtomicUsize,
        listing_windows: Mutex<Vec<(Gas, u32)>>,
    }

    impl FakeFetcher {
        fn city_for(&self, bbox: &BoundingBox) -> Option<&City> {
            self.cities.iter().find(|c| c.bbox == *bbox)
        }
    }

    #[async_trait]
    impl GasReadingFetcher for FakeFetcher {
        async fn fetch_region(&self, gas: Gas, _bbox: &BoundingBox, days_back: u32) -> Result<Vec<ImageHandle>, FetchError> {
            self.listings.fetch_add(1, Ordering::SeqCst);
            self.listing_windows.lock().push((gas, days_back));
            if self.slow_listings {
                tokio::time::sleep(Duration::from_secs(3 * 3600)).await;
            }
            if days_back < self.min_window.get(&gas).copied().unwrap_or(0) {
                return Ok(Vec::new());
            }
            Ok(self.images.get(&gas).cloned().unwrap_or_default())
        }

        async fn reduce_region(&self, image: &ImageHandle, bbox: &BoundingBox) -> Result<Option<RegionStats>, FetchError> {
            if self.invalid_images.contains(&image.id) {
                return Ok(None);
            }
            let Some(city) = self.city_for(bbox) else {
                // The whole monitored region.
                return Ok(Some(RegionStats { mean: 1.0, max: 1.0, min: 1.0 }));
            };
            if self.slow_cities.contains(&city.name) {
                tokio::time::sleep(Duration::from_secs(3 * 3600)).await;
            }
            if self.failing_cities.contains(&city.name) {
                return Err(FetchError::Status { status: 503, url: "fake".into() });
            }
            let max = self
                .city_values
                .get(&(city.name.clone(), image.gas))
                .or_else(|| self.values.get(&image.gas))
                .copied()
                .unwrap_or(0.0);
            Ok(Some(RegionStats { mean: max * 0.6, max, min: max * 0.2 }))
        }
    }

    fn image(id: &str, gas: Gas, hours_ago: i64) -> ImageHandle {
        ImageHandle { id: id.to_string(), gas, acquired_at: Utc::now() - ChronoDuration::hours(hours_ago) }
    }

    /// Every gas has one fresh image and reads at half its threshold.
    fn healthy_fetcher(config: &Config) -> FakeFetcher {
        let mut fetcher = FakeFetcher { cities: config.cities.clone(), ..FakeFetcher::default() };
        for spec in &config.gases {
            fetcher.images.insert(spec.gas, vec![image(&format!("{}-a", spec.gas), spec.gas, 20)]);
            fetcher.values.insert(spec.gas, spec.column_threshold * 0.5);
        }
        fetcher
    }

    struct Harness {
        scanner: RegionalScanner,
        cache: Arc<MemoryCacheStore>,
        violations: Arc<MemoryViolationStore>,
        fetcher: Arc<FakeFetcher>,
    }

    fn harness(config: Config, fetcher: FakeFetcher) -> Harness {
        let config = Arc::new(config);
        let fetcher = Arc::new(fetcher);
        let cache = Arc::new(MemoryCacheStore::new());
        let violations = Arc::new(MemoryViolationStore::new());
        let scanner = RegionalScanner::new(
            config.clone(),
            fetcher.clone(),
            cache.clone(),
            violations.clone(),
            Arc::new(DedupEngine::from_config(&config)),
            Arc::new(MetricsCollector::new()),
        );
        Harness { scanner, cache, violations, fetcher }
    }

    #[tokio::test]
    async fn test_one_listing_per_gas_feeds_every_city() {
        let config = Config::default();
        let h = harness(config.clone(), healthy_fetcher(&config));

        let result = h.scanner.scan_all_cities(7, true).await;

        assert_eq!(result.status, ScanStatus::Success);
        assert_eq!(h.fetcher.listings.load(Ordering::SeqCst), config.gases.len());
        assert_eq!(result.cities.len(), config.cities.len());
        assert_eq!(result.cache_writes, config.cities.len());
        assert_eq!(h.cache.len(), config.cities.len());

        let riyadh = result.city("Riyadh").unwrap();
        assert_eq!(riyadh.metrics.data_completeness, 1.0);
        assert!((riyadh.metrics.avg_threshold_percentage - 50.0).abs() < 1e-9);
        assert_eq!(riyadh.metrics.active_violations, 0);
    }

    #[tokio::test]
    async fn test_empty_gas_retries_wider_then_goes_unavailable() {
        let config = Config::default();
        let mut fetcher = healthy_fetcher(&config);
        // CO only appears in a 21-day window, CH4 never appears.
        fetcher.min_window.insert(Gas::Co, 21);
        fetcher.images.remove(&Gas::Ch4);
        let h = harness(config, fetcher);

        let result = h.scanner.scan_all_cities(7, false).await;

        assert_eq!(result.status, ScanStatus::Partial);
        assert_eq!(result.gases_unavailable, vec![Gas::Ch4]);
        assert!(result.gases_available.contains(&Gas::Co));
        let windows = h.fetcher.listing_windows.lock().clone();
        assert!(windows.contains(&(Gas::Co, 7)));
        assert!(windows.contains(&(Gas::Co, 21)));
        assert!(windows.contains(&(Gas::Ch4, 21)));

        let jeddah = result.city("Jeddah").unwrap();
        assert!((jeddah.metrics.data_completeness - 0.8).abs() < 1e-9);
        assert!(!jeddah.readings.contains_key(&Gas::Ch4));
    }

    #[tokio::test]
    async fn test_newest_invalid_candidate_is_skipped() {
        let config = Config::default();
        let mut fetcher = healthy_fetcher(&config);
        let newest = image("no2-cloudy", Gas::No2, 2);
        let older = image("no2-clear", Gas::No2, 26);
        let expected_ts = older
            .acquired_at
            .with_timezone(&config.local_offset())
            .format(KSA_TIMESTAMP_FORMAT)
            .to_string();
        fetcher.images.insert(Gas::No2, vec![older, newest]);
        fetcher.invalid_images.insert("no2-cloudy".into());
        let h = harness(config, fetcher);

        let result = h.scanner.scan_all_cities(7, false).await;

        let reading = &result.city("Dammam").unwrap().readings[&Gas::No2];
        assert_eq!(reading.timestamp, expected_ts);
        assert_eq!(reading.days_old, 1);
    }

    #[tokio::test]
    async fn test_violations_recorded_once_across_repeat_scans() {
        let config = Config::default();
        let mut fetcher = healthy_fetcher(&config);
        // 0.0025 vs 0.001 threshold: 150% over, critical.
        fetcher.city_values.insert(("Jubail".into(), Gas::So2), 0.0025);
        let h = harness(config, fetcher);

        let first = h.scanner.scan_all_cities(7, true).await;
        assert_eq!(first.violations_detected, 1);
        assert_eq!(first.violations_recorded, 1);

        let jubail = first.city("Jubail").unwrap();
        assert_eq!(jubail.violations[0].severity, Severity::Critical);
        assert!((jubail.violations[0].percentage_over - 150.0).abs() < 1e-9);

        let second = h.scanner.scan_all_cities(7, true).await;
        assert_eq!(second.violations_detected, 1);
        assert_eq!(second.violations_recorded, 0);
        assert_eq!(h.violations.len(), 1);

        let doc = h.cache.get("Jubail").await.unwrap().unwrap();
        assert_eq!(doc.monitoring_stats.total_scans, 2);
        assert_eq!(doc.monitoring_stats.background_scans, 2);
        assert_eq!(doc.monitoring_stats.user_scans, 0);
    }

    #[tokio::test]
    async fn test_auto_record_off_leaves_violation_store_alone() {
        let config = Config::default();
        let mut fetcher = healthy_fetcher(&config);
        fetcher.city_values.insert(("Yanbu".into(), Gas::No2), 0.00015);
        let h = harness(config, fetcher);

        let result = h.scanner.scan_all_cities(7, false).await;
        assert_eq!(result.violations_detected, 1);
        assert!(h.violations.is_empty());
    }

    #[tokio::test]
    async fn test_no_satellite_data_keeps_cache_untouched() {
        let config = Config::default();
        let fetcher = FakeFetcher { cities: config.cities.clone(), ..FakeFetcher::default() };
        let h = harness(config, fetcher);

        let existing = CacheRecord {
            city: "Riyadh".into(),
            region: "Central".into(),
            last_updated: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
            latest_readings: BTreeMap::new(),
            metrics: CityMetrics::default(),
            violations: vec![],
            monitoring_stats: MonitoringStats::next(
                None,
                ScanOrigin::User,
                NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            ),
        };
        h.cache.put("Riyadh", &existing).await.unwrap();

        let result = h.scanner.scan_all_cities(7, true).await;

        assert_eq!(result.status, ScanStatus::NoSatelliteData);
        assert!(result.cities.is_empty());
        assert_eq!(h.cache.len(), 1);
        assert_eq!(h.cache.get("Riyadh").await.unwrap().unwrap(), existing);
    }

    #[tokio::test]
    async fn test_failing_city_does_not_stop_the_others() {
        let config = Config::default();
        let mut fetcher = healthy_fetcher(&config);
        fetcher.failing_cities.insert("Abha".into());
        let h = harness(config.clone(), fetcher);

        let result = h.scanner.scan_all_cities(7, true).await;

        assert_eq!(result.status, ScanStatus::Partial);
        assert_eq!(result.failed_cities, vec!["Abha".to_string()]);
        assert_eq!(result.cities.len(), config.cities.len() - 1);
        assert!(h.cache.get("Abha").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_regional_scan_runs_on_a_spawned_task() {
        let config = Config::default();
        let h = harness(config.clone(), healthy_fetcher(&config));
        let cache = h.cache.clone();
        let scanner = Arc::new(h.scanner);

        let task = tokio::spawn(async move { scanner.scan_all_cities(7, false).await });
        let result = task.await.unwrap();

        assert_eq!(result.status, ScanStatus::Success);
        assert_eq!(cache.len(), config.cities.len());
    }

    #[tokio::test]
    async fn test_undecodable_cache_document_is_replaced() {
        let config = Config::default();
        let h = harness(config.clone(), healthy_fetcher(&config));
        // Older producers wrote null for gases they could not read.
        h.cache.put_raw(
            "Riyadh",
            r#"{"city":"Riyadh","region":"Central","last_updated":"2024-03-01T09:00:00",
                "latest_readings":{"NO2":{"value":null,"mean":null}},
                "monitoring_stats":{"total_scans":4}}"#,
        );
        assert!(h.cache.get("Riyadh").await.is_err());

        let result = h.scanner.scan_all_cities(7, true).await;

        assert_eq!(result.status, ScanStatus::Success);
        assert_eq!(result.cache_writes, config.cities.len());
        let doc = h.cache.get("Riyadh").await.unwrap().unwrap();
        assert_eq!(doc.metrics.data_completeness, 1.0);
        assert_eq!(doc.monitoring_stats.total_scans, 1);
        assert_eq!(doc.monitoring_stats.background_scans, 1);

        h.scanner.scan_all_cities(7, true).await;
        let doc = h.cache.get("Riyadh").await.unwrap().unwrap();
        assert_eq!(doc.monitoring_stats.total_scans, 2);
    }

    #[tokio::test]
    async fn test_unreachable_cache_makes_scan_partial() {
        let config = Config::default();
        let h = harness(config.clone(), healthy_fetcher(&config));
        h.cache.set_available(false);

        let result = h.scanner.scan_all_cities(7, true).await;

        assert_eq!(result.status, ScanStatus::Partial);
        assert_eq!(result.cache_writes, 0);
        assert_eq!(result.cities.len(), config.cities.len());
    }

    #[tokio::test]
    async fn test_failed_violation_insert_makes_scan_partial() {
        let config = Config::default();
        let mut fetcher = healthy_fetcher(&config);
        fetcher.city_values.insert(("Jubail".into(), Gas::So2), 0.0025);
        let h = harness(config.clone(), fetcher);
        h.violations.set_available(false);

        let result = h.scanner.scan_all_cities(7, true).await;

        assert_eq!(result.status, ScanStatus::Partial);
        assert_eq!(result.violations_detected, 1);
        assert_eq!(result.violations_recorded, 0);
        assert_eq!(result.violation_failures, 1);
        assert_eq!(result.cache_writes, config.cities.len());

        // Nothing was remembered, so the next scan gets another try.
        h.violations.set_available(true);
        let retry = h.scanner.scan_all_cities(7, true).await;
        assert_eq!(retry.status, ScanStatus::Success);
        assert_eq!(retry.violations_recorded, 1);
        assert_eq!(h.violations.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_while_fetching_images_is_reported_as_deadline() {
        let config = Config { max_scan_duration: Duration::from_secs(60), ..Config::default() };
        let mut fetcher = healthy_fetcher(&config);
        fetcher.slow_listings = true;
        let h = harness(config.clone(), fetcher);

        let result = h.scanner.scan_all_cities(7, true).await;

        assert_eq!(result.status, ScanStatus::DeadlineExceeded);
        assert!(result.gases_available.is_empty());
        assert_eq!(result.failed_cities.len(), config.cities.len());
        assert!(h.cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_keeps_finished_cities() {
        let config = Config { max_scan_duration: Duration::from_secs(60), ..Config::default() };
        let mut fetcher = healthy_fetcher(&config);
        fetcher.slow_cities.insert("Tabuk".into());
        let h = harness(config.clone(), fetcher);

        let result = h.scanner.scan_all_cities(7, false).await;

        assert_eq!(result.status, ScanStatus::DeadlineExceeded);
        assert!(result.failed_cities.contains(&"Tabuk".to_string()));
        assert_eq!(result.cities.len(), config.cities.len() - 1);
        assert!(h.cache.get("Riyadh").await.unwrap().is_some());
        assert!(h.cache.get("Tabuk").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_single_city_scan_counts_as_user_scan() {
        let config = Config::default();
        let h = harness(config.clone(), healthy_fetcher(&config));

        h.scanner.scan_all_cities(7, false).await;
        let scan = h.scanner.scan_single_city("Makkah", 7, true).await.unwrap();
        assert_eq!(scan.metrics.data_completeness, 1.0);

        let stats = h.cache.get("Makkah").await.unwrap().unwrap().monitoring_stats;
        assert_eq!(stats.background_scans, 1);
        assert_eq!(stats.user_scans, 1);
        assert_eq!(stats.total_scans, 2);

        assert!(matches!(
            h.scanner.scan_single_city("Atlantis", 7, true).await,
            Err(BenchmarkError::UnknownCity(_))
        ));
    }

    #[tokio::test]
    async fn test_single_city_scan_without_save_leaves_cache_alone() {
        let config = Config::default();
        let h = harness(config.clone(), healthy_fetcher(&config));
        h.scanner.scan_single_city("Hail", 7, false).await.unwrap();
        assert!(h.cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_scan_covers_requested_cities() {
        let config = Config::default();
        let h = harness(config.clone(), healthy_fetcher(&config));
        let wanted: Vec<String> = ["Riyadh", "Jeddah", "Dammam", "Tabuk", "Nowhere"]
            .into_iter()
            .map(String::from)
            .collect();

        let result = h.scanner.scan_cities_batch(&wanted, 7).await;

        assert_eq!(result.status, ScanStatus::Partial);
        assert_eq!(result.cities.len(), 4);
        assert_eq!(result.failed_cities, vec!["Nowhere".to_string()]);
        // Per-city path: one listing per (gas, city).
        assert_eq!(h.fetcher.listings.load(Ordering::SeqCst), 4 * config.gases.len());
    }

    #[test]
    fn test_negative_values_are_clamped_before_judging() {
        let config = Config::default();
        let spec = config.gas_spec(Gas::No2).unwrap();
        let now = Utc::now();
        let (reading, violation) = assess_reading(
            spec,
            RegionStats { mean: -0.00002, max: -0.00001, min: -0.00005 },
            now,
            now,
            config.local_offset(),
        );
        assert_eq!(reading.max, 0.0);
        assert_eq!(reading.min, 0.0);
        assert!(!reading.is_violation);
        assert!(violation.is_none());
    }

    #[test]
    fn test_exact_threshold_is_a_moderate_violation() {
        let config = Config::default();
        let spec = config.gas_spec(Gas::Co).unwrap();
        let now = Utc::now();
        let (reading, violation) = assess_reading(
            spec,
            RegionStats { mean: 0.02, max: 0.03, min: 0.01 },
            now,
            now,
            config.local_offset(),
        );
        assert!(reading.is_violation);
        let violation = violation.unwrap();
        assert_eq!(violation.percentage_over, 0.0);
        assert_eq!(violation.severity, Severity::Moderate);
    }

    #[test]
    fn test_timestamp_is_localized_to_ksa() {
        let config = Config::default();
        let spec = config.gas_spec(Gas::No2).unwrap();
        let acquired = Utc.with_ymd_and_hms(2024, 3, 1, 10, 20, 0).unwrap();
        let (reading, _) = assess_reading(
            spec,
            RegionStats { mean: 0.0, max: 0.0, min: 0.0 },
            acquired,
            acquired,
            config.local_offset(),
        );
        assert_eq!(reading.timestamp, "2024-03-01 13:20:00");
    }

    #[test]
    fn test_zero_threshold_never_violates() {
        let mut spec = Config::default().gas_spec(Gas::Ch4).unwrap().clone();
        spec.column_threshold = 0.0;
        let now = Utc::now();
        let (reading, violation) = assess_reading(
            &spec,
            RegionStats { mean: 2000.0, max: 2500.0, min: 1800.0 },
            now,
            now,
            Config::default().local_offset(),
        );
        assert!(!reading.is_violation);
        assert!(violation.is_none());
        assert_eq!(reading.threshold_percentage(), None);
    }

    #[test]
    fn test_violation_bonus_only_in_threshold_weighted_mode() {
        let config = Config::default();
        let now = Utc::now();
        let mut readings = BTreeMap::new();
        for (gas, max) in [(Gas::No2, 0.00015), (Gas::So2, 0.0005)] {
            let spec = config.gas_spec(gas).unwrap();
            let (reading, _) = assess_reading(
                spec,
                RegionStats { mean: max, max, min: max },
                now,
                now,
                config.local_offset(),
            );
            readings.insert(gas, reading);
        }

        let fair = city_metrics(&readings, 5, ScoringMode::FairComposite, 10.0);
        assert!((fair.avg_threshold_percentage - 100.0).abs() < 1e-9);
        assert_eq!(fair.pollution_index, fair.avg_threshold_percentage);
        assert_eq!(fair.active_violations, 1);
        assert!((fair.data_completeness - 0.4).abs() < 1e-9);

        let weighted = city_metrics(&readings, 5, ScoringMode::ThresholdWeighted, 10.0);
        assert!((weighted.pollution_index - 110.0).abs() < 1e-9);
    }
}
