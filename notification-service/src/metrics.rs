//! Prometheus metrics for the delivery pipeline.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::{info, warn};

use crate::models::{circuit_breaker::CircuitState, request::Channel, status::DeliveryState};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Installs the Prometheus recorder. Subsequent calls are no-ops.
pub fn init_metrics() {
    let _ = PROMETHEUS_HANDLE.get_or_try_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .inspect(|_| info!("Prometheus metrics initialized"))
            .inspect_err(|e| warn!(error = %e, "Failed to install Prometheus recorder"))
    });
}

pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Per-channel metric helpers.
#[derive(Debug, Clone, Copy)]
pub struct PipelineMetrics {
    channel: Channel,
}

impl PipelineMetrics {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub fn received(&self) {
        counter!("notifications_received_total", "channel" => self.channel.as_str()).increment(1);
    }

    pub fn dispatched(&self, provider: &'static str, duration: Duration) {
        counter!(
            "notifications_dispatched_total",
            "channel" => self.channel.as_str(),
            "provider" => provider
        )
        .increment(1);

        histogram!(
            "notification_dispatch_duration_seconds",
            "channel" => self.channel.as_str(),
            "provider" => provider
        )
        .record(duration.as_secs_f64());
    }

    pub fn dispatch_failed(&self, category: &'static str) {
        counter!(
            "notification_dispatch_errors_total",
            "channel" => self.channel.as_str(),
            "category" => category
        )
        .increment(1);
    }

    pub fn retried(&self) {
        counter!("notifications_retried_total", "channel" => self.channel.as_str()).increment(1);
    }

    pub fn dead_lettered(&self) {
        counter!("notifications_dead_lettered_total", "channel" => self.channel.as_str())
            .increment(1);
    }

    pub fn duplicate_skipped(&self) {
        counter!("notifications_duplicates_total", "channel" => self.channel.as_str())
            .increment(1);
    }

    pub fn terminal(&self, state: DeliveryState) {
        counter!(
            "notifications_terminal_total",
            "channel" => self.channel.as_str(),
            "status" => state.to_string()
        )
        .increment(1);
    }

    pub fn circuit_state(&self, state: CircuitState) {
        let value = match state {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        };
        gauge!("notification_circuit_state", "channel" => self.channel.as_str()).set(value);
    }

    pub fn queue_depth(&self, depth: u32) {
        gauge!("notification_queue_depth", "channel" => self.channel.as_str()).set(depth as f64);
    }
}
