//! Self-hosted Prometheus text-format metrics endpoint.
//!
//! Grounded on `mapleaiorg-maple`'s use of `axum` for its HTTP surface (the
//! teacher has no HTTP server of its own). A background task accumulates
//! counters from `METRICS_SUMMARY` and `INVESTIGATION_THROTTLE_REQUEST`
//! signals on the [`ChemBus`]; `GET /metrics` renders them in the
//! Prometheus exposition format.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use axum::{routing::get, Router};
use synapse_bus::ChemBus;

#[derive(Default)]
struct Counters {
    investigations_completed_total: AtomicU64,
    investigations_failed_total: AtomicU64,
    queue_depth: AtomicI64,
    pressure_level: AtomicI64,
}

#[derive(Clone)]
pub struct MetricsHandle(Arc<Counters>);

impl MetricsHandle {
    fn render(&self) -> String {
        format!(
            "# HELP synapse_investigations_completed_total Investigations completed since last tick.\n\
             # TYPE synapse_investigations_completed_total counter\n\
             synapse_investigations_completed_total {}\n\
             # HELP synapse_investigations_failed_total Investigations failed since last tick.\n\
             # TYPE synapse_investigations_failed_total counter\n\
             synapse_investigations_failed_total {}\n\
             # HELP synapse_queue_depth Pending curiosity questions.\n\
             # TYPE synapse_queue_depth gauge\n\
             synapse_queue_depth {}\n\
             # HELP synapse_pressure_level Current affect pressure level (0=normal, 1=elevated, 2=critical).\n\
             # TYPE synapse_pressure_level gauge\n\
             synapse_pressure_level {}\n",
            self.0.investigations_completed_total.load(Ordering::Relaxed),
            self.0.investigations_failed_total.load(Ordering::Relaxed),
            self.0.queue_depth.load(Ordering::Relaxed),
            self.0.pressure_level.load(Ordering::Relaxed),
        )
    }
}

/// Spawn the bus listener that keeps the exported counters current and
/// return a handle usable from the HTTP route.
pub fn spawn_collector(bus: &ChemBus) -> MetricsHandle {
    let counters = Arc::new(Counters::default());
    let handle = MetricsHandle(counters.clone());

    let metrics_counters = counters.clone();
    let mut metrics_sub = bus.subscribe_topic("METRICS_SUMMARY");
    tokio::spawn(async move {
        while let Some(signal) = metrics_sub.recv().await {
            if let Some(v) = signal.facts.get("completed").and_then(|v| v.as_i64()) {
                metrics_counters.investigations_completed_total.fetch_add(v.max(0) as u64, Ordering::Relaxed);
            }
            if let Some(v) = signal.facts.get("failed").and_then(|v| v.as_i64()) {
                metrics_counters.investigations_failed_total.fetch_add(v.max(0) as u64, Ordering::Relaxed);
            }
            if let Some(v) = signal.facts.get("queue_depth").and_then(|v| v.as_i64()) {
                metrics_counters.queue_depth.store(v, Ordering::Relaxed);
            }
        }
    });

    let throttle_counters = counters;
    let mut throttle_sub = bus.subscribe_topic("INVESTIGATION_THROTTLE_REQUEST");
    tokio::spawn(async move {
        while let Some(signal) = throttle_sub.recv().await {
            let level = match signal.fact_str("pressure_level") {
                Some("critical") => 2,
                Some("elevated") => 1,
                _ => 0,
            };
            throttle_counters.pressure_level.store(level, Ordering::Relaxed);
        }
    });

    handle
}

/// Serve the `/metrics` endpoint on `port` until the process exits.
pub async fn serve(handle: MetricsHandle, port: u16) -> std::io::Result<()> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use synapse_types::Signal;

    #[tokio::test]
    async fn collector_accumulates_metrics_summary() {
        let bus = ChemBus::default();
        let handle = spawn_collector(&bus);
        tokio::task::yield_now().await;

        bus.publish(Signal::new("METRICS_SUMMARY").with_fact("completed", 3).with_fact("failed", 1).with_fact("queue_depth", 7))
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let rendered = handle.render();
        assert!(rendered.contains("synapse_investigations_completed_total 3"));
        assert!(rendered.contains("synapse_investigations_failed_total 1"));
        assert!(rendered.contains("synapse_queue_depth 7"));
    }

    #[tokio::test]
    async fn collector_tracks_pressure_level_from_throttle_request() {
        let bus = ChemBus::default();
        let handle = spawn_collector(&bus);
        tokio::task::yield_now().await;

        bus.publish(Signal::new("INVESTIGATION_THROTTLE_REQUEST").with_fact("pressure_level", "critical")).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(handle.render().contains("synapse_pressure_level 2"));
    }
}
