//! Probe protocols: HTTP GET, TCP connect, and the SCRIPT stub

use std::time::Duration;
use tracing::debug;

use crate::model::{HealthCheckType, ServiceInstance};

/// Message reported on the SCRIPT path; scripts are a recognized tag but are
/// not executed
pub const SCRIPT_NOT_IMPLEMENTED: &str = "Script check not implemented";

/// Outcome of one full probe (all attempts)
#[derive(Debug, Clone)]
pub struct ProbeVerdict {
    pub healthy: bool,
    pub message: String,
}

impl ProbeVerdict {
    fn up(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
        }
    }

    fn down(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }
}

/// Effective probe parameters after engine defaults are applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    pub check_type: HealthCheckType,
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
    /// Total attempts; the verdict is UP iff any attempt succeeds
    pub attempts: u32,
}

/// Executes probe attempts against instance endpoints
pub struct Prober {
    http: reqwest::Client,
}

impl Prober {
    #[must_use]
    pub fn new() -> Self {
        // 3xx is already a healthy verdict; following the redirect would
        // judge the wrong endpoint
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http }
    }

    /// Run up to `spec.attempts` attempts; stops at the first success. A
    /// failure verdict carries the last attempt's error.
    pub async fn probe(&self, instance: &ServiceInstance, spec: &ProbeSpec) -> ProbeVerdict {
        if spec.check_type == HealthCheckType::Script {
            return ProbeVerdict::up(SCRIPT_NOT_IMPLEMENTED);
        }

        let mut last_error = String::new();
        for attempt in 1..=spec.attempts.max(1) {
            match self.attempt(instance, spec).await {
                Ok(message) => {
                    debug!(
                        service_id = %instance.service_id,
                        instance_id = %instance.instance_id,
                        attempt,
                        "probe succeeded"
                    );
                    return ProbeVerdict::up(message);
                }
                Err(error) => {
                    debug!(
                        service_id = %instance.service_id,
                        instance_id = %instance.instance_id,
                        attempt,
                        error = %error,
                        "probe attempt failed"
                    );
                    last_error = error;
                }
            }
        }
        ProbeVerdict::down(last_error)
    }

    async fn attempt(&self, instance: &ServiceInstance, spec: &ProbeSpec) -> Result<String, String> {
        match spec.check_type {
            HealthCheckType::Http => self.attempt_http(instance, spec).await,
            HealthCheckType::Tcp => attempt_tcp(instance, spec).await,
            HealthCheckType::Script => Ok(SCRIPT_NOT_IMPLEMENTED.to_string()),
        }
    }

    async fn attempt_http(
        &self,
        instance: &ServiceInstance,
        spec: &ProbeSpec,
    ) -> Result<String, String> {
        let url = format!("{}{}", instance.uri(), spec.path);
        let response = self
            .http
            .get(&url)
            .timeout(spec.timeout)
            .send()
            .await
            .map_err(|e| format!("GET {url} failed: {e}"))?;
        let code = response.status().as_u16();
        if (200..400).contains(&code) {
            Ok(format!("HTTP {code}"))
        } else {
            Err(format!("GET {url} returned status {code}"))
        }
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::new()
    }
}

async fn attempt_tcp(instance: &ServiceInstance, spec: &ProbeSpec) -> Result<String, String> {
    let address = format!("{}:{}", instance.host, instance.port);
    match tokio::time::timeout(spec.timeout, tokio::net::TcpStream::connect(&address)).await {
        Ok(Ok(_stream)) => Ok(format!("TCP connect to {address} ok")),
        Ok(Err(error)) => Err(format!("TCP connect to {address} failed: {error}")),
        Err(_) => Err(format!(
            "TCP connect to {address} timed out after {}s",
            spec.timeout.as_secs()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServiceRegistration;
    use chrono::Utc;

    fn instance(host: &str, port: u16) -> ServiceInstance {
        ServiceRegistration {
            instance_id: "i-1".to_string(),
            host: host.to_string(),
            port,
            ..Default::default()
        }
        .into_instance("svc", Utc::now())
    }

    fn spec(check_type: HealthCheckType) -> ProbeSpec {
        ProbeSpec {
            check_type,
            path: "/actuator/health".to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(1),
            attempts: 1,
        }
    }

    #[tokio::test]
    async fn script_probe_always_reports_up() {
        let prober = Prober::new();
        let verdict = prober
            .probe(&instance("127.0.0.1", 1), &spec(HealthCheckType::Script))
            .await;
        assert!(verdict.healthy);
        assert_eq!(verdict.message, SCRIPT_NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn tcp_probe_succeeds_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = Prober::new();
        let verdict = prober
            .probe(&instance("127.0.0.1", port), &spec(HealthCheckType::Tcp))
            .await;
        assert!(verdict.healthy);
    }

    #[tokio::test]
    async fn tcp_probe_fails_against_closed_port() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let prober = Prober::new();
        let verdict = prober
            .probe(&instance("127.0.0.1", port), &spec(HealthCheckType::Tcp))
            .await;
        assert!(!verdict.healthy);
        assert!(verdict.message.contains("TCP connect"));
    }
}
