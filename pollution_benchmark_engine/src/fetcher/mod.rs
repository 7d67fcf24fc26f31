// =============================================================================
// fetcher/mod.rs - THE ONLY DOOR TO THE SATELLITE
// =============================================================================
//
// Image retrieval and the geospatial reduction math live in an external gas
// reading service. We consume exactly two operations:
//
//   fetch_region  - candidate images for one gas over a box and a trailing
//                   window, newest first is NOT guaranteed
//   reduce_region - mean/max/min of one image over a box, or None when the
//                   box has no valid pixels (clouds, swath gaps, night)
//
// The regional scanner calls fetch_region once per gas for the whole
// monitored area and reduce_region once per (gas, city). The legacy per-city
// path calls fetch_region per (gas, city), which is why it needs batching.
// =============================================================================

pub mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FetchError;
use crate::models::{BoundingBox, Gas};

pub use http::HttpGasFetcher;

/// An opaque reference to one satellite image held by the gas service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageHandle {
    pub id: String,
    pub gas: Gas,
    pub acquired_at: DateTime<Utc>,
}

/// The three statistics we ask for on every reduction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RegionStats {
    pub mean: f64,
    pub max: f64,
    pub min: f64,
}

impl RegionStats {
    /// Negative column densities are retrieval noise. Clamp before anyone
    /// compares them to a threshold.
    pub fn clamped(self) -> Self {
        Self {
            mean: self.mean.max(0.0),
            max: self.max.max(0.0),
            min: self.min.max(0.0),
        }
    }
}

#[async_trait]
pub trait GasReadingFetcher: Send + Sync {
    async fn fetch_region(
        &self,
        gas: Gas,
        bbox: &BoundingBox,
        days_back: u32,
    ) -> Result<Vec<ImageHandle>, FetchError>;

    async fn reduce_region(
        &self,
        image: &ImageHandle,
        bbox: &BoundingBox,
    ) -> Result<Option<RegionStats>, FetchError>;
}
