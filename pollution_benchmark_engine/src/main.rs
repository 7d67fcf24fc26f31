// ═══════════════════════════════════════════════════════════════
// POLLUTION BENCHMARK ENGINE - composition root
// ═══════════════════════════════════════════════════════════════
//
// Connects Redis, builds the gas fetcher behind its circuit breaker, wires
// scanner / staleness tracker / analytics together, then runs two tasks until
// Ctrl-C:
//
//   scheduler  every scan interval: any stale city? -> regional scan ->
//              log the cleanest and most polluted cities
//   metrics    JSON health report on the metrics port

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pollution_benchmark_engine::circuit_breaker::CircuitBreaker;
use pollution_benchmark_engine::dedup::DedupEngine;
use pollution_benchmark_engine::fetcher::HttpGasFetcher;
use pollution_benchmark_engine::metrics::{self, MetricsCollector};
use pollution_benchmark_engine::store::redis_store::connect_with_retry;
use pollution_benchmark_engine::store::{RedisCacheStore, RedisViolationStore};
use pollution_benchmark_engine::{BenchmarkAnalytics, Config, RegionalScanner, StalenessTracker};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.with_ansi(true).init();
    }
}

fn print_banner() {
    let banner = r#"
    ╔══════════════════════════════════════════════════════════════╗
    ║                                                              ║
    ║          P O L L U T I O N   B E N C H M A R K               ║
    ║                     E N G I N E                              ║
    ║                                                              ║
    ║   Scan:     one satellite pass per gas, every city at once   ║
    ║   Score:    live blend + capped history, neutral if unknown  ║
    ║   Stores:   Redis cache documents + violation log            ║
    ║   Dedup:    Bloom filter + LRU in front of the log           ║
    ║                                                              ║
    ╚══════════════════════════════════════════════════════════════╝
    "#;
    println!("{banner}");
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::from_env());
    init_tracing(config.log_json);
    print_banner();

    info!(
        cities = config.cities.len(),
        gases = config.gases.len(),
        scoring_mode = ?config.scoring.mode,
        scan_interval_secs = config.scan_interval.as_secs(),
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_handle = tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => warn!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Signal listener error, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    // ═══════════════════════════════════════════
    // STORES
    // ═══════════════════════════════════════════
    let Some(con) = connect_with_retry(&config.redis_url, &shutdown_rx)
        .await
        .context("invalid Redis URL")?
    else {
        info!("Shut down before Redis became reachable");
        return Ok(());
    };
    let cache = Arc::new(RedisCacheStore::new(con.clone(), config.cache_key_prefix.clone()));
    let violations = Arc::new(RedisViolationStore::new(con, &config.violation_key_prefix));

    // ═══════════════════════════════════════════
    // FETCHER, DEDUP, METRICS
    // ═══════════════════════════════════════════
    let breaker = Arc::new(CircuitBreaker::new(
        "gas-service",
        config.circuit_breaker_failure_threshold,
        config.circuit_breaker_reset_timeout,
        config.circuit_breaker_success_threshold,
    ));
    let fetcher = Arc::new(HttpGasFetcher::new(&config, breaker.clone()).context("building gas fetcher")?);
    let dedup = Arc::new(DedupEngine::from_config(&config));
    let metrics_collector = Arc::new(MetricsCollector::new());

    let scanner = RegionalScanner::new(
        config.clone(),
        fetcher,
        cache.clone(),
        violations.clone(),
        dedup.clone(),
        metrics_collector.clone(),
    );
    let tracker = StalenessTracker::new(config.clone(), cache.clone());
    let analytics = BenchmarkAnalytics::new(config.clone(), cache, violations, metrics_collector.clone());

    // ═══════════════════════════════════════════
    // TASKS
    // ═══════════════════════════════════════════
    let metrics_port = config.metrics_port;
    let mut metrics_shutdown = shutdown_rx.clone();
    let metrics_handle = tokio::spawn(async move {
        metrics::run_metrics_server(metrics_port, metrics_collector, dedup, breaker, &mut metrics_shutdown).await;
    });

    let scheduler_config = config.clone();
    let mut scheduler_shutdown = shutdown_rx.clone();
    let scheduler_handle = tokio::spawn(async move {
        run_scheduler(scheduler_config, scanner, tracker, analytics, &mut scheduler_shutdown).await;
    });

    info!(
        redis_url = %config.redis_url,
        gas_service = %config.fetcher_base_url,
        metrics_port = metrics_port,
        "All systems online, Ctrl+C for graceful shutdown"
    );

    let mut main_shutdown = shutdown_rx.clone();
    let _ = main_shutdown.changed().await;

    info!("Waiting for tasks to complete (timeout: 10s)");
    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        let _ = tokio::join!(scheduler_handle, metrics_handle, signal_handle);
    })
    .await;

    info!("Pollution benchmark engine offline");
    Ok(())
}

/// Rescan whenever any city has gone stale, then sleep one interval.
async fn run_scheduler(
    config: Arc<Config>,
    scanner: RegionalScanner,
    tracker: StalenessTracker,
    analytics: BenchmarkAnalytics,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        let stale = tracker.get_stale_cities(config.stale_after_hours).await;
        if stale.is_empty() {
            info!("Every city is fresh, skipping this round");
        } else {
            info!(stale = stale.len(), cities = ?stale, "Stale cities found, running regional scan");
            tokio::select! {
                result = scanner.scan_all_cities(config.days_back, config.auto_record_violations) => {
                    info!(status = ?result.status, message = %result.message, "Scheduled scan done");
                }
                _ = shutdown.changed() => {
                    info!("Scheduler stopping mid-scan");
                    return;
                }
            }

            let ranking = analytics.rank_cities().await;
            if let (Some(cleanest), Some(dirtiest)) = (ranking.first(), ranking.last()) {
                info!(
                    cleanest = %cleanest.score.city,
                    cleanest_score = cleanest.score.pollution_index,
                    most_polluted = %dirtiest.score.city,
                    most_polluted_score = dirtiest.score.pollution_index,
                    "Ranking refreshed"
                );
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.scan_interval) => {}
            _ = shutdown.changed() => {
                info!("Scheduler stopping");
                return;
            }
        }
    }
}
