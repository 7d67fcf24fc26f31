// =============================================================================
// fetcher/http.rs - TALKING TO THE GAS READING SERVICE OVER HTTP
// =============================================================================
//
// Endpoints (JSON both ways):
//   GET  {base}/v1/images?gas=NO2&west=..&south=..&east=..&north=..&days_back=7
//        -> { "images": [ { "id": "...", "acquired_at": "RFC3339" }, ... ] }
//   POST {base}/v1/reduce  { "image_id", "gas", "bbox" }
//        -> { "mean": f64|null, "max": f64|null, "min": f64|null }
//
// A reduction with any null statistic is a null reduction. Everything goes
// through one circuit breaker because the quota behind the service is shared
// by every gas and every city.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{GasReadingFetcher, ImageHandle, RegionStats};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::error::FetchError;
use crate::models::{BoundingBox, Gas};

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    images: Vec<ImageEntry>,
}

#[derive(Debug, Deserialize)]
struct ImageEntry {
    id: String,
    acquired_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ReduceRequest<'a> {
    image_id: &'a str,
    gas: Gas,
    bbox: &'a BoundingBox,
}

#[derive(Debug, Deserialize)]
struct ReduceResponse {
    mean: Option<f64>,
    max: Option<f64>,
    min: Option<f64>,
}

impl ReduceResponse {
    fn into_stats(self) -> Option<RegionStats> {
        Some(RegionStats { mean: self.mean?, max: self.max?, min: self.min? })
    }
}

pub struct HttpGasFetcher {
    client: reqwest::Client,
    base: Url,
    breaker: Arc<CircuitBreaker>,
}

impl HttpGasFetcher {
    pub fn new(config: &Config, breaker: Arc<CircuitBreaker>) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.fetcher_timeout)
            .user_agent("PollutionBenchmarkEngine/0.1 (regional-scan)")
            .build()?;

        // Url::join drops the last path segment unless the base ends in '/'.
        let mut base = config.fetcher_base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }

        Ok(Self { client, base: Url::parse(&base)?, breaker })
    }

    fn images_url(&self, gas: Gas, bbox: &BoundingBox, days_back: u32) -> Result<Url, FetchError> {
        let mut url = self.base.join("v1/images")?;
        url.query_pairs_mut()
            .append_pair("gas", gas.code())
            .append_pair("west", &bbox.west.to_string())
            .append_pair("south", &bbox.south.to_string())
            .append_pair("east", &bbox.east.to_string())
            .append_pair("north", &bbox.north.to_string())
            .append_pair("days_back", &days_back.to_string());
        Ok(url)
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
        url: &Url,
    ) -> Result<T, FetchError> {
        let response = request.header("Accept", "application/json").send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { status: status.as_u16(), url: url.to_string() });
        }
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl GasReadingFetcher for HttpGasFetcher {
    async fn fetch_region(
        &self,
        gas: Gas,
        bbox: &BoundingBox,
        days_back: u32,
    ) -> Result<Vec<ImageHandle>, FetchError> {
        let url = self.images_url(gas, bbox, days_back)?;
        let response: ImagesResponse = self
            .breaker
            .call(self.send_json(self.client.get(url.clone()), &url))
            .await?;

        debug!(gas = %gas, days_back = days_back, candidates = response.images.len(), "Image candidates listed");
        Ok(response
            .images
            .into_iter()
            .map(|entry| ImageHandle { id: entry.id, gas, acquired_at: entry.acquired_at })
            .collect())
    }

    async fn reduce_region(
        &self,
        image: &ImageHandle,
        bbox: &BoundingBox,
    ) -> Result<Option<RegionStats>, FetchError> {
        let url = self.base.join("v1/reduce")?;
        let body = ReduceRequest { image_id: &image.id, gas: image.gas, bbox };
        let response: ReduceResponse = self
            .breaker
            .call(self.send_json(self.client.post(url.clone()).json(&body), &url))
            .await?;
        Ok(response.into_stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fetcher(base: &str) -> HttpGasFetcher {
        let config = Config { fetcher_base_url: base.to_string(), ..Config::default() };
        let breaker = Arc::new(CircuitBreaker::new("gas-service", 5, Duration::from_secs(60), 2));
        HttpGasFetcher::new(&config, breaker).unwrap()
    }

    #[test]
    fn test_images_url_keeps_base_path() {
        let f = fetcher("http://gas.internal:8085/api");
        let url = f.images_url(Gas::So2, &BoundingBox::new(38.0, 21.0, 50.5, 31.2), 21).unwrap();
        assert_eq!(url.path(), "/api/v1/images");
        let query = url.query().unwrap();
        assert!(query.contains("gas=SO2"));
        assert!(query.contains("days_back=21"));
    }

    #[test]
    fn test_null_statistic_means_null_reduction() {
        let partial: ReduceResponse = serde_json::from_str(r#"{"mean":1.0,"max":null,"min":0.5}"#).unwrap();
        assert!(partial.into_stats().is_none());

        let full: ReduceResponse = serde_json::from_str(r#"{"mean":1.0,"max":2.0,"min":0.5}"#).unwrap();
        assert_eq!(full.into_stats(), Some(RegionStats { mean: 1.0, max: 2.0, min: 0.5 }));
    }

    #[test]
    fn test_bad_base_url_is_rejected() {
        let config = Config { fetcher_base_url: "not a url".into(), ..Config::default() };
        let breaker = Arc::new(CircuitBreaker::new("gas-service", 5, Duration::from_secs(60), 2));
        assert!(matches!(HttpGasFetcher::new(&config, breaker), Err(FetchError::InvalidUrl(_))));
    }
}
