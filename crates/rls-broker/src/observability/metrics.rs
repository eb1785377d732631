//! Prometheus metrics for the broker

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::Result;
use crate::auth::Provider;
use crate::error::Error;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static START_TIME: OnceLock<Instant> = OnceLock::new();

const METRIC_UPTIME: &str = "rls_broker_uptime_seconds";
const METRIC_INFO: &str = "rls_broker_info";

// Token exchange
const METRIC_EXCHANGES: &str = "rls_broker_token_exchanges_total";

// Transactions
const METRIC_TRANSACTIONS: &str = "rls_broker_transactions_total";
const METRIC_TRANSACTION_DURATION: &str = "rls_broker_transaction_duration_seconds";

// Connection pool
const METRIC_POOL_SIZE: &str = "rls_broker_pool_connections";
const METRIC_POOL_WAIT_TIME: &str = "rls_broker_pool_wait_seconds";
const METRIC_POOL_ERRORS: &str = "rls_broker_pool_errors_total";

/// Initialize Prometheus metrics recorder.
pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Config(format!("Failed to install metrics recorder: {e}")))?;

    PROMETHEUS_HANDLE.set(handle).ok();
    START_TIME.set(Instant::now()).ok();

    register_metrics();
    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

fn register_metrics() {
    describe_gauge!(METRIC_UPTIME, "Process uptime in seconds");
    describe_gauge!(METRIC_INFO, "Build information (always 1)");

    describe_counter!(
        METRIC_EXCHANGES,
        "Token exchanges by provider and outcome tag"
    );

    describe_counter!(METRIC_TRANSACTIONS, "Secure transactions by outcome tag");
    describe_histogram!(
        METRIC_TRANSACTION_DURATION,
        "Secure transaction duration in seconds, identity resolution included"
    );

    describe_gauge!(METRIC_POOL_SIZE, "Connection pool size by state");
    describe_histogram!(
        METRIC_POOL_WAIT_TIME,
        "Time waiting for a connection from pool"
    );
    describe_counter!(METRIC_POOL_ERRORS, "Failed pool acquisitions");

    gauge!(
        METRIC_INFO,
        "version" => env!("CARGO_PKG_VERSION"),
    )
    .set(1.0);
}

/// Render metrics in Prometheus text format.
#[must_use]
pub fn render_metrics() -> String {
    if let Some(start) = START_TIME.get() {
        gauge!(METRIC_UPTIME).set(start.elapsed().as_secs_f64());
    }

    PROMETHEUS_HANDLE
        .get()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

/// Record one token exchange; `outcome` is `ok` or an error tag.
pub fn record_exchange(provider: Provider, outcome: &'static str) {
    counter!(
        METRIC_EXCHANGES,
        "provider" => provider.as_str(),
        "outcome" => outcome,
    )
    .increment(1);
}

/// Record one secure transaction; `outcome` is `committed` or an error tag.
pub fn record_transaction(outcome: &'static str, duration: Duration) {
    counter!(METRIC_TRANSACTIONS, "outcome" => outcome).increment(1);
    histogram!(METRIC_TRANSACTION_DURATION, "outcome" => outcome).record(duration.as_secs_f64());
}

/// Record time spent waiting for a connection.
pub fn record_pool_wait(duration: Duration, acquired: bool) {
    histogram!(METRIC_POOL_WAIT_TIME).record(duration.as_secs_f64());
    if !acquired {
        counter!(METRIC_POOL_ERRORS).increment(1);
    }
}

/// Update pool size gauges.
#[allow(clippy::cast_precision_loss)]
pub fn set_pool_stats(pool: &'static str, max: usize, available: usize, waiting: usize) {
    gauge!(METRIC_POOL_SIZE, "pool" => pool, "state" => "max").set(max as f64);
    gauge!(METRIC_POOL_SIZE, "pool" => pool, "state" => "available").set(available as f64);
    gauge!(METRIC_POOL_SIZE, "pool" => pool, "state" => "in_use")
        .set(max.saturating_sub(available) as f64);
    gauge!(METRIC_POOL_SIZE, "pool" => pool, "state" => "waiting").set(waiting as f64);
}
