// ═══════════════════════════════════════════════════════════════
// METRICS COLLECTOR - how many scans, how many cities, how many violations
// ═══════════════════════════════════════════════════════════════
//
// Atomic counters bumped by the scanner and the ranking layer. The binary
// serves a JSON snapshot on a tiny TCP endpoint (default :9090) so the
// dashboard can tell a healthy engine from one that stopped finding data.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot};
use crate::dedup::{DedupEngine, DedupSnapshot};

#[derive(Debug, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub scans_started: u64,
    pub scans_completed: u64,
    pub scans_without_data: u64,
    pub scans_past_deadline: u64,
    pub cities_scanned: u64,
    pub city_failures: u64,
    pub gases_unavailable: u64,
    pub violations_detected: u64,
    pub violations_recorded: u64,
    pub violations_already_stored: u64,
    pub cache_writes: u64,
    pub store_failures: u64,
    pub rankings_computed: u64,
    pub uptime_seconds: u64,
    pub last_scan_duration_secs: f64,
    pub status: String,
}

#[derive(Default)]
pub struct MetricsCollector {
    scans_started: AtomicU64,
    scans_completed: AtomicU64,
    scans_without_data: AtomicU64,
    scans_past_deadline: AtomicU64,
    cities_scanned: AtomicU64,
    city_failures: AtomicU64,
    gases_unavailable: AtomicU64,
    violations_detected: AtomicU64,
    violations_recorded: AtomicU64,
    violations_already_stored: AtomicU64,
    cache_writes: AtomicU64,
    store_failures: AtomicU64,
    rankings_computed: AtomicU64,
    last_scan_duration: portable_atomic::AtomicF64,
    start_time: Option<Instant>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self { start_time: Some(Instant::now()), ..Self::default() }
    }

    pub fn scan_started(&self) {
        self.scans_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scan_completed(&self, duration_secs: f64) {
        self.scans_completed.fetch_add(1, Ordering::Relaxed);
        self.last_scan_duration.store(duration_secs, portable_atomic::Ordering::Relaxed);
    }

    pub fn scan_without_data(&self) {
        self.scans_without_data.fetch_add(1, Ordering::Relaxed);
    }

    pub fn scan_past_deadline(&self) {
        self.scans_past_deadline.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_cities_scanned(&self, n: usize) {
        self.cities_scanned.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_city_failures(&self, n: usize) {
        self.city_failures.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_gases_unavailable(&self, n: usize) {
        self.gases_unavailable.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_violations_detected(&self, n: usize) {
        self.violations_detected.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn increment_violations_recorded(&self) {
        self.violations_recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_violations_already_stored(&self) {
        self.violations_already_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_cache_writes(&self) {
        self.cache_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_store_failures(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rankings(&self) {
        self.rankings_computed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            scans_started: self.scans_started.load(Ordering::Relaxed),
            scans_completed: self.scans_completed.load(Ordering::Relaxed),
            scans_without_data: self.scans_without_data.load(Ordering::Relaxed),
            scans_past_deadline: self.scans_past_deadline.load(Ordering::Relaxed),
            cities_scanned: self.cities_scanned.load(Ordering::Relaxed),
            city_failures: self.city_failures.load(Ordering::Relaxed),
            gases_unavailable: self.gases_unavailable.load(Ordering::Relaxed),
            violations_detected: self.violations_detected.load(Ordering::Relaxed),
            violations_recorded: self.violations_recorded.load(Ordering::Relaxed),
            violations_already_stored: self.violations_already_stored.load(Ordering::Relaxed),
            cache_writes: self.cache_writes.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            rankings_computed: self.rankings_computed.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0),
            last_scan_duration_secs: self.last_scan_duration.load(portable_atomic::Ordering::Relaxed),
            status: "operational".to_string(),
        }
    }
}

/// Everything the health endpoint reports in one document.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub engine: MetricsSnapshot,
    pub dedup: DedupSnapshot,
    pub gas_service_circuit: CircuitBreakerSnapshot,
}

/// Serve `HealthReport` as JSON to anything that connects, until shutdown.
pub async fn run_metrics_server(
    port: u16,
    metrics: Arc<MetricsCollector>,
    dedup: Arc<DedupEngine>,
    breaker: Arc<CircuitBreaker>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind metrics server");
            return;
        }
    };

    info!(addr = %addr, "Metrics server listening");

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((mut stream, _addr)) => {
                        let report = HealthReport {
                            engine: metrics.snapshot(),
                            dedup: dedup.snapshot(),
                            gas_service_circuit: breaker.snapshot(),
                        };
                        let json = serde_json::to_string_pretty(&report)
                            .unwrap_or_else(|_| "{}".to_string());

                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nAccess-Control-Allow-Origin: *\r\nContent-Length: {}\r\n\r\n{}",
                            json.len(),
                            json,
                        );

                        let _ = stream.write_all(response.as_bytes()).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Metrics server accept error");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("Metrics server shutting down");
                break;
            }
        }
    }
}
