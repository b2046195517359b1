//! Prometheus metrics for the depot server.
//!
//! Exposes counters for upload lifecycle transitions, deduplication and
//! garbage collection.
//!
//! The `/metrics` endpoint is unauthenticated so Prometheus can scrape
//! it. The values are aggregates only (no ids, addresses, or hashes),
//! but restrict the endpoint to authorized scraper addresses at the
//! infrastructure level anyway.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{self, Encoder, IntCounter, Registry, TextEncoder};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Upload lifecycle metrics
pub static UPLOADS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_uploads_created_total",
        "Total number of uploads created",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_FINISHED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_uploads_finished_total",
        "Total number of uploads hashed and promoted to their content-addressed path",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_TERMINATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_uploads_terminated_total",
        "Total number of uploads terminated by clients or admins",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_uploads_deduplicated_total",
        "Total number of finished uploads whose blob was already stored",
    )
    .expect("metric creation failed")
});

pub static BYTES_UPLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("depot_bytes_uploaded_total", "Total bytes received in chunks")
        .expect("metric creation failed")
});

// GC metrics
pub static GC_SWEEPS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("depot_gc_sweeps_total", "Total number of GC sweeps run")
        .expect("metric creation failed")
});

pub static GC_UPLOADS_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_gc_uploads_expired_total",
        "Total number of expired uploads collected, including row-only reconciliations",
    )
    .expect("metric creation failed")
});

pub static GC_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_gc_failures_total",
        "Total number of GC operations that failed and were left for the next tick",
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so integration tests sharing the process-wide registry
/// can call it freely.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(UPLOADS_CREATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_FINISHED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_TERMINATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_DEDUPLICATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_UPLOADED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GC_SWEEPS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GC_UPLOADS_EXPIRED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GC_FAILURES.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}
