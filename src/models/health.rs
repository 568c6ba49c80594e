use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Latency below which a probe counts as healthy
pub const HEALTHY_THRESHOLD: Duration = Duration::from_millis(50);

/// Latency at or above which a probe counts as unhealthy
pub const UNHEALTHY_THRESHOLD: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub connected: bool,
    pub response_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthStatus {
    /// Classify a successful round trip by its latency
    pub fn from_latency(elapsed: Duration) -> Self {
        let status = if elapsed < HEALTHY_THRESHOLD {
            HealthState::Healthy
        } else if elapsed < UNHEALTHY_THRESHOLD {
            HealthState::Degraded
        } else {
            HealthState::Unhealthy
        };

        Self {
            status,
            connected: true,
            response_time_ms: elapsed.as_millis() as u64,
            error: None,
        }
    }

    /// A failed probe; connection errors are always unhealthy
    pub fn failed(elapsed: Duration, error: impl ToString) -> Self {
        Self {
            status: HealthState::Unhealthy,
            connected: false,
            response_time_ms: elapsed.as_millis() as u64,
            error: Some(error.to_string()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_thresholds() {
        assert_eq!(
            HealthStatus::from_latency(Duration::from_millis(0)).status,
            HealthState::Healthy
        );
        assert_eq!(
            HealthStatus::from_latency(Duration::from_millis(49)).status,
            HealthState::Healthy
        );
        assert_eq!(
            HealthStatus::from_latency(Duration::from_millis(50)).status,
            HealthState::Degraded
        );
        assert_eq!(
            HealthStatus::from_latency(Duration::from_millis(199)).status,
            HealthState::Degraded
        );
        assert_eq!(
            HealthStatus::from_latency(Duration::from_millis(200)).status,
            HealthState::Unhealthy
        );
    }

    #[test]
    fn test_failed_probe() {
        let status = HealthStatus::failed(Duration::from_millis(3), "connection refused");
        assert_eq!(status.status, HealthState::Unhealthy);
        assert!(!status.connected);
        assert_eq!(status.error.as_deref(), Some("connection refused"));
    }
}
