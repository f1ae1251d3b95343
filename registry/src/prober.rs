use crate::metrics_defs::{INSTANCE_HEALTHY, PROBE_FAILURES};
use crate::registry::ServiceRegistry;
use crate::types::Instance;
use async_trait::async_trait;
use serde::Deserialize;
use shared::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("health check request failed: {0}")]
    Request(String),

    #[error("health check returned status {0}")]
    BadStatus(u16),
}

/// Out-of-band health check against one instance. Trait seam so the probe
/// loop is testable without a network.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, instance: &Instance) -> Result<(), ProbeError>;
}

/// Per-service probing configuration. The failure threshold here is
/// independent of the circuit breaker's thresholds: it governs pool
/// membership, not admission.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ProbeSettings {
    pub path: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub failure_threshold: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        ProbeSettings {
            path: "/health".to_string(),
            interval_secs: 10,
            timeout_secs: 2,
            failure_threshold: 3,
        }
    }
}

/// HTTP GET against the instance's health endpoint; any 2xx is healthy.
pub struct HttpProber {
    client: reqwest::Client,
    path: String,
}

impl HttpProber {
    pub fn new(path: &str, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        HttpProber {
            client,
            path: path.to_string(),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpProber {
    async fn probe(&self, instance: &Instance) -> Result<(), ProbeError> {
        let url = format!("http://{}{}", instance.authority(), self.path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProbeError::Request(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProbeError::BadStatus(response.status().as_u16()))
        }
    }
}

/// Run one probe round for every instance of `service` and apply the
/// results to the pool.
pub async fn probe_service_once(
    registry: &ServiceRegistry,
    service: &str,
    prober: &dyn HealthProbe,
    failure_threshold: u32,
) {
    for instance in registry.instances_of(service) {
        let was_selectable = instance.selectable();
        match prober.probe(&instance).await {
            Ok(()) => {
                instance.record_probe_success();
                if !was_selectable {
                    tracing::info!(
                        service,
                        instance = %instance.authority(),
                        "instance recovered, back in pool"
                    );
                }
            }
            Err(err) => {
                counter!(
                    PROBE_FAILURES,
                    "service" => service.to_string(),
                    "instance" => instance.authority()
                )
                .increment(1);
                let excluded = instance.record_probe_failure(failure_threshold);
                if excluded {
                    tracing::warn!(
                        service,
                        instance = %instance.authority(),
                        error = %err,
                        "instance excluded from pool after consecutive probe failures"
                    );
                } else {
                    tracing::debug!(
                        service,
                        instance = %instance.authority(),
                        error = %err,
                        "health probe failed"
                    );
                }
            }
        }
        gauge!(
            INSTANCE_HEALTHY,
            "service" => service.to_string(),
            "instance" => instance.authority()
        )
        .set(if instance.selectable() { 1.0 } else { 0.0 });
    }
    registry.mark_probed(service);
}

/// Spawn the background probe task for one service, on its own timer.
pub fn spawn_probe_loop(
    registry: ServiceRegistry,
    service: String,
    prober: Arc<dyn HealthProbe>,
    settings: ProbeSettings,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(settings.interval_secs.max(1)));
        loop {
            interval.tick().await;
            probe_service_once(
                &registry,
                &service,
                prober.as_ref(),
                settings.failure_threshold,
            )
            .await;
        }
    })
}
