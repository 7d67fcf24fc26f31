//! Which cities are overdue for a rescan.
//!
//! Pure reads over the cache store. The scheduler in `main` decides what to
//! do with the answer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::config::Config;
use crate::models::{CityMetrics, MonitoringStats};
use crate::store::CacheStore;

/// One city's cache freshness, as reported to operators.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStatus {
    pub has_cache: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub hours_ago: Option<f64>,
    pub metrics: Option<CityMetrics>,
    pub monitoring_stats: Option<MonitoringStats>,
    /// The store could not be read for this city.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub unreadable: bool,
}

impl CacheStatus {
    fn missing(unreadable: bool) -> Self {
        Self {
            has_cache: false,
            last_updated: None,
            hours_ago: None,
            metrics: None,
            monitoring_stats: None,
            unreadable,
        }
    }

    /// No document, an unreadable one, or one older than `max_age_hours`.
    pub fn is_stale(&self, max_age_hours: f64) -> bool {
        self.hours_ago.map_or(true, |age| age > max_age_hours)
    }
}

pub struct StalenessTracker {
    config: Arc<Config>,
    cache: Arc<dyn CacheStore>,
}

impl StalenessTracker {
    pub fn new(config: Arc<Config>, cache: Arc<dyn CacheStore>) -> Self {
        Self { config, cache }
    }

    /// Freshness of every configured city, keyed by name.
    pub async fn cache_status(&self) -> BTreeMap<String, CacheStatus> {
        self.cache_status_at(Utc::now()).await
    }

    pub async fn cache_status_at(&self, now: DateTime<Utc>) -> BTreeMap<String, CacheStatus> {
        let mut report = BTreeMap::new();
        for city in &self.config.cities {
            let status = match self.cache.get(&city.name).await {
                Ok(Some(doc)) => CacheStatus {
                    has_cache: true,
                    last_updated: Some(doc.last_updated),
                    hours_ago: Some(doc.age_hours(now)),
                    metrics: Some(doc.metrics),
                    monitoring_stats: Some(doc.monitoring_stats),
                    unreadable: false,
                },
                Ok(None) => CacheStatus::missing(false),
                Err(e) => {
                    // Unknown freshness counts as stale; a rescan is the safe answer.
                    warn!(city = %city.name, error = %e, "Cache read failed during staleness check");
                    CacheStatus::missing(true)
                }
            };
            report.insert(city.name.clone(), status);
        }
        report
    }

    /// Cities with no cache document or one older than `max_age_hours`.
    pub async fn get_stale_cities(&self, max_age_hours: f64) -> BTreeSet<String> {
        self.get_stale_cities_at(max_age_hours, Utc::now()).await
    }

    pub async fn get_stale_cities_at(&self, max_age_hours: f64, now: DateTime<Utc>) -> BTreeSet<String> {
        self.cache_status_at(now)
            .await
            .into_iter()
            .filter(|(_, status)| status.is_stale(max_age_hours))
            .map(|(city, _)| city)
            .collect()
    }
}
