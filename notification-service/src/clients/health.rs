use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::{
    clients::rbmq::RabbitMqClient,
    handler::ChannelHandler,
    metrics::PipelineMetrics,
    models::{
        circuit_breaker::CircuitState,
        health::{HealthCheckResponse, ServiceHealth},
    },
    tracker::DeliveryTracker,
};

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HealthChecker {
    handlers: Vec<Arc<ChannelHandler>>,
    tracker: DeliveryTracker,
    rabbitmq: Option<Arc<RabbitMqClient>>,
}

impl HealthChecker {
    pub fn new(
        handlers: Vec<Arc<ChannelHandler>>,
        tracker: DeliveryTracker,
        rabbitmq: Option<Arc<RabbitMqClient>>,
    ) -> Self {
        Self {
            handlers,
            tracker,
            rabbitmq,
        }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = BTreeMap::new();

        checks.insert("status_store".to_string(), self.check_store().await.critical());

        if let Some(rabbitmq) = &self.rabbitmq {
            let broker = if rabbitmq.is_connected() {
                ServiceHealth::healthy(0)
            } else {
                warn!("RabbitMQ connection lost");
                ServiceHealth::unhealthy("Connection lost".to_string())
            };
            checks.insert("message_broker".to_string(), broker.critical());
        }

        for handler in &self.handlers {
            checks.insert(
                handler.channel().to_string(),
                self.check_channel(handler).await,
            );
        }

        HealthCheckResponse::from_checks(checks)
    }

    /// Refreshes the breaker and queue-depth gauges without probing providers.
    pub async fn refresh_gauges(&self) {
        for handler in &self.handlers {
            let channel = handler.channel();
            let metrics = PipelineMetrics::new(channel);
            metrics.circuit_state(handler.breaker().state());

            if let Some(rabbitmq) = &self.rabbitmq {
                match rabbitmq.queue_depth(channel).await {
                    Ok(depth) => metrics.queue_depth(depth),
                    Err(e) => warn!(%channel, error = %e, "Failed to read queue depth"),
                }
            }
        }
    }

    async fn check_store(&self) -> ServiceHealth {
        let start = Instant::now();

        match timeout(CHECK_TIMEOUT, self.tracker.ping()).await {
            Ok(Ok(())) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Status store health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Status store ping failed");
                ServiceHealth::unhealthy(format!("Ping failed: {}", e))
            }
            Err(_) => ServiceHealth::unhealthy("Ping timed out".to_string()),
        }
    }

    /// Provider reachability combined with breaker state and queue depth.
    async fn check_channel(&self, handler: &ChannelHandler) -> ServiceHealth {
        let channel = handler.channel();
        let metrics = PipelineMetrics::new(channel);
        let state = handler.breaker().state();
        metrics.circuit_state(state);

        let start = Instant::now();
        let mut health = match timeout(CHECK_TIMEOUT, handler.provider().health_check()).await {
            Ok(Ok(true)) => ServiceHealth::healthy(start.elapsed().as_millis() as u64),
            Ok(Ok(false)) => ServiceHealth::unhealthy("Provider reported unavailable".to_string()),
            Ok(Err(e)) => {
                warn!(%channel, error = %e, "Provider health check failed");
                ServiceHealth::unhealthy(format!("Health check failed: {}", e))
            }
            Err(_) => ServiceHealth::unhealthy("Health check timed out".to_string()),
        };

        if health.error.is_none() {
            health = match state {
                CircuitState::Closed => health,
                CircuitState::HalfOpen => {
                    ServiceHealth::degraded("Circuit breaker in recovery mode".to_string())
                }
                CircuitState::Open => ServiceHealth::degraded("Circuit breaker is open".to_string()),
            };
        }
        health = health.with_circuit_breaker(state.as_str());

        if let Some(rabbitmq) = &self.rabbitmq {
            match rabbitmq.queue_depth(channel).await {
                Ok(depth) => {
                    metrics.queue_depth(depth);
                    health = health.with_queue_depth(depth);
                }
                Err(e) => warn!(%channel, error = %e, "Failed to read queue depth"),
            }
        }

        debug!(%channel, status = ?health.status, "Channel health checked");
        health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clients::{
            providers::MockProvider, queue::MemoryQueue, template::TemplateRenderer,
        },
        config::Config,
        models::{health::HealthStatus, request::Channel},
    };

    fn handler(provider: Arc<MockProvider>, tracker: DeliveryTracker) -> Arc<ChannelHandler> {
        let config = Config::default();
        Arc::new(ChannelHandler::new(
            provider,
            Arc::new(TemplateRenderer::new(config.templates.clone())),
            tracker,
            Arc::new(MemoryQueue::new()),
            &config,
        ))
    }

    #[tokio::test]
    async fn test_unavailable_provider_degrades() {
        let tracker = DeliveryTracker::in_memory();
        let email = Arc::new(MockProvider::new(Channel::Email));
        let sms = Arc::new(MockProvider::new(Channel::Sms));

        let checker = HealthChecker::new(
            vec![handler(email.clone(), tracker.clone()), handler(sms.clone(), tracker.clone())],
            tracker,
            None,
        );

        let report = checker.check_all().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.checks["email"].circuit_breaker.as_deref(), Some("closed"));

        sms.set_healthy(false);
        let report = checker.check_all().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.checks["sms"].status, HealthStatus::Unhealthy);
    }
}
