use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub checks: BTreeMap<String, ServiceHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,

    /// Dependencies whose failure makes the whole service unhealthy.
    #[serde(skip)]
    pub critical: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceHealth {
    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            critical: false,
            response_time_ms: Some(response_time_ms),
            circuit_breaker: None,
            queue_depth: None,
            error: None,
        }
    }

    pub fn unhealthy(error: String) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            critical: false,
            response_time_ms: None,
            circuit_breaker: None,
            queue_depth: None,
            error: Some(error),
        }
    }

    pub fn degraded(error: String) -> Self {
        Self {
            status: HealthStatus::Degraded,
            response_time_ms: None,
            error: Some(error),
            ..Self::healthy(0)
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_circuit_breaker(mut self, state: &str) -> Self {
        self.circuit_breaker = Some(state.to_string());
        self
    }

    pub fn with_queue_depth(mut self, depth: u32) -> Self {
        self.queue_depth = Some(depth);
        self
    }
}

impl HealthCheckResponse {
    /// Any critical failure is unhealthy; any other failure or open circuit degrades.
    pub fn from_checks(checks: BTreeMap<String, ServiceHealth>) -> Self {
        let critical_unhealthy = checks
            .values()
            .any(|h| h.critical && h.status == HealthStatus::Unhealthy);

        let has_problem = checks
            .values()
            .any(|h| h.status != HealthStatus::Healthy);

        let status = if critical_unhealthy {
            HealthStatus::Unhealthy
        } else if has_problem {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            timestamp: Utc::now(),
            checks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_status() {
        let mut checks = BTreeMap::new();
        checks.insert("redis".to_string(), ServiceHealth::healthy(2).critical());
        checks.insert("email".to_string(), ServiceHealth::healthy(0));
        assert_eq!(
            HealthCheckResponse::from_checks(checks.clone()).status,
            HealthStatus::Healthy
        );

        checks.insert(
            "sms".to_string(),
            ServiceHealth::unhealthy("provider down".into()),
        );
        assert_eq!(
            HealthCheckResponse::from_checks(checks.clone()).status,
            HealthStatus::Degraded
        );

        checks.insert(
            "redis".to_string(),
            ServiceHealth::unhealthy("refused".into()).critical(),
        );
        assert_eq!(
            HealthCheckResponse::from_checks(checks).status,
            HealthStatus::Unhealthy
        );
    }
}
