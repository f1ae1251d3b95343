use crate::clock::Clock;
use crate::metrics_defs::{
    CIRCUIT_REJECTIONS, CIRCUIT_TRANSITIONS, COUNTER_STORE_FAILURES, UPSTREAM_LATENCY,
    UPSTREAM_OUTCOMES,
};
use crate::store::{CounterStore, Result as StoreResult};
use serde::{Deserialize, Serialize};
use shared::{counter, histogram};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// All breaker keys are refreshed on write with this TTL so abandoned
/// services eventually disappear from the store.
const STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    const fn code(self) -> u64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    const fn from_code(code: u64) -> CircuitState {
        match code {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// What trips a closed circuit. Exactly one policy is active; the two
/// conditions are alternatives selected by configuration, never combined.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum TripPolicy {
    ConsecutiveFailures {
        threshold: u32,
    },
    ErrorRate {
        threshold: f64,
        window_secs: u64,
        min_requests: u64,
    },
}

impl Default for TripPolicy {
    fn default() -> Self {
        TripPolicy::ConsecutiveFailures { threshold: 5 }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct CircuitSettings {
    pub trip: TripPolicy,
    pub timeout_secs: u64,
    pub success_threshold: u32,
    pub half_open_max_probes: u32,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        CircuitSettings {
            trip: TripPolicy::default(),
            timeout_secs: 60,
            success_threshold: 3,
            half_open_max_probes: 3,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("circuit open for service {service}")]
pub struct CircuitOpenError {
    pub service: String,
}

fn key_state(service: &str) -> String {
    format!("cb:{service}:state")
}

fn key_opened_at(service: &str) -> String {
    format!("cb:{service}:opened_at")
}

fn key_failures(service: &str) -> String {
    format!("cb:{service}:failures")
}

fn key_successes(service: &str) -> String {
    format!("cb:{service}:successes")
}

fn key_probes(service: &str) -> String {
    format!("cb:{service}:probes")
}

fn key_window(service: &str, bucket: u64, kind: &str) -> String {
    format!("cb:{service}:win:{bucket}:{kind}")
}

/// Per-upstream three-state breaker.
///
/// All state lives in the counter store, owned collectively by every
/// gateway replica; a transition decided here becomes visible to other
/// replicas on their next read. Store outages degrade to allowing traffic,
/// never to rejecting it.
pub struct CircuitBreaker {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        CircuitBreaker { store, clock }
    }

    /// Current state as other components should see it, with the
    /// Open-to-HalfOpen timeout applied. Reads only; for the admin surface.
    pub async fn state(&self, service: &str, settings: &CircuitSettings) -> CircuitState {
        let state = match self.store.get(&key_state(service)).await {
            Ok(code) => code.map(CircuitState::from_code).unwrap_or(CircuitState::Closed),
            Err(_) => return CircuitState::Closed,
        };

        if state == CircuitState::Open && self.open_timeout_elapsed(service, settings).await {
            return CircuitState::HalfOpen;
        }
        state
    }

    /// Gate a call to `service`. `Err(CircuitOpenError)` means reply 503
    /// without touching the upstream.
    pub async fn allow(
        &self,
        service: &str,
        settings: &CircuitSettings,
    ) -> Result<(), CircuitOpenError> {
        let state = match self.store.get(&key_state(service)).await {
            Ok(code) => code.map(CircuitState::from_code).unwrap_or(CircuitState::Closed),
            Err(err) => {
                tracing::warn!(service, error = %err, "counter store unreachable, allowing call");
                counter!(COUNTER_STORE_FAILURES, "component" => "circuit_breaker").increment(1);
                return Ok(());
            }
        };

        match state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if self.open_timeout_elapsed(service, settings).await {
                    // Cooldown over: this call proceeds as the first probe.
                    if let Err(err) = self.enter_half_open(service).await {
                        tracing::warn!(service, error = %err, "half-open transition failed");
                    }
                    Ok(())
                } else {
                    counter!(CIRCUIT_REJECTIONS, "service" => service.to_string()).increment(1);
                    Err(CircuitOpenError {
                        service: service.to_string(),
                    })
                }
            }
            CircuitState::HalfOpen => {
                let admitted = self
                    .store
                    .incr(
                        &key_probes(service),
                        Duration::from_secs(settings.timeout_secs.max(1)),
                    )
                    .await;
                match admitted {
                    Ok(n) if n <= settings.half_open_max_probes as u64 => Ok(()),
                    Ok(_) => {
                        counter!(CIRCUIT_REJECTIONS, "service" => service.to_string()).increment(1);
                        Err(CircuitOpenError {
                            service: service.to_string(),
                        })
                    }
                    Err(err) => {
                        tracing::warn!(service, error = %err, "probe accounting failed, allowing call");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Give back a half-open probe slot when an admitted call was never
    /// sent upstream (no instance available, unreadable request body).
    /// Outside half-open this is a no-op.
    pub async fn release_probe(&self, service: &str) {
        let state = match self.store.get(&key_state(service)).await {
            Ok(code) => code.map(CircuitState::from_code).unwrap_or(CircuitState::Closed),
            Err(_) => return,
        };
        if state != CircuitState::HalfOpen {
            return;
        }
        if let Err(err) = self.store.decr(&key_probes(service)).await {
            tracing::warn!(service, error = %err, "probe slot release failed");
            counter!(COUNTER_STORE_FAILURES, "component" => "circuit_breaker").increment(1);
        }
    }

    /// Record the outcome of a completed (or timed-out, or abandoned)
    /// upstream call. Timeouts and cancellations are failures.
    pub async fn record(
        &self,
        service: &str,
        success: bool,
        latency: Duration,
        settings: &CircuitSettings,
    ) {
        let outcome = if success { "success" } else { "failure" };
        counter!(
            UPSTREAM_OUTCOMES,
            "service" => service.to_string(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!(
            UPSTREAM_LATENCY,
            "service" => service.to_string(),
            "outcome" => outcome
        )
        .record(latency.as_secs_f64());

        if let Err(err) = self.record_inner(service, success, settings).await {
            tracing::warn!(service, error = %err, "circuit state update failed, dropping sample");
            counter!(COUNTER_STORE_FAILURES, "component" => "circuit_breaker").increment(1);
        }
    }

    async fn record_inner(
        &self,
        service: &str,
        success: bool,
        settings: &CircuitSettings,
    ) -> StoreResult<()> {
        let state = self
            .store
            .get(&key_state(service))
            .await?
            .map(CircuitState::from_code)
            .unwrap_or(CircuitState::Closed);

        if let TripPolicy::ErrorRate { window_secs, .. } = settings.trip {
            self.bump_window(service, success, window_secs).await?;
        }

        match (state, success) {
            (CircuitState::Closed, true) => {
                self.store.remove(&key_failures(service)).await?;
            }
            (CircuitState::Closed, false) => {
                let failures = self.store.incr(&key_failures(service), STATE_TTL).await?;
                if self.should_trip(service, failures, settings).await? {
                    self.open(service, CircuitState::Closed).await?;
                }
            }
            (CircuitState::HalfOpen, true) => {
                let successes = self.store.incr(&key_successes(service), STATE_TTL).await?;
                if successes >= settings.success_threshold as u64 {
                    self.close(service).await?;
                }
            }
            (CircuitState::HalfOpen, false) => {
                // One failed probe re-opens immediately with a fresh cooldown.
                self.open(service, CircuitState::HalfOpen).await?;
            }
            (CircuitState::Open, _) => {
                // Late result from before the transition; nothing to update.
            }
        }
        Ok(())
    }

    async fn should_trip(
        &self,
        service: &str,
        consecutive_failures: u64,
        settings: &CircuitSettings,
    ) -> StoreResult<bool> {
        match settings.trip {
            TripPolicy::ConsecutiveFailures { threshold } => {
                Ok(consecutive_failures >= threshold as u64)
            }
            TripPolicy::ErrorRate {
                threshold,
                window_secs,
                min_requests,
            } => {
                let (total, failed) = self.window_counts(service, window_secs).await?;
                Ok(total >= min_requests && (failed as f64) / (total as f64) > threshold)
            }
        }
    }

    /// Trailing-window tallies: the current bucket plus the previous one.
    async fn window_counts(&self, service: &str, window_secs: u64) -> StoreResult<(u64, u64)> {
        let bucket = self.clock.unix_seconds() / window_secs.max(1);
        let mut total = 0;
        let mut failed = 0;
        for b in [bucket.saturating_sub(1), bucket] {
            total += self
                .store
                .get(&key_window(service, b, "total"))
                .await?
                .unwrap_or(0);
            failed += self
                .store
                .get(&key_window(service, b, "failed"))
                .await?
                .unwrap_or(0);
        }
        Ok((total, failed))
    }

    async fn bump_window(&self, service: &str, success: bool, window_secs: u64) -> StoreResult<()> {
        let window_secs = window_secs.max(1);
        let bucket = self.clock.unix_seconds() / window_secs;
        let ttl = Duration::from_secs(window_secs * 2);
        self.store
            .incr(&key_window(service, bucket, "total"), ttl)
            .await?;
        if !success {
            self.store
                .incr(&key_window(service, bucket, "failed"), ttl)
                .await?;
        }
        Ok(())
    }

    async fn open_timeout_elapsed(&self, service: &str, settings: &CircuitSettings) -> bool {
        let opened_at = match self.store.get(&key_opened_at(service)).await {
            Ok(Some(at)) => at,
            // Missing or unreadable opened_at: treat the cooldown as over
            // rather than leaving the circuit stuck open.
            _ => return true,
        };
        self.clock.unix_seconds().saturating_sub(opened_at) >= settings.timeout_secs
    }

    async fn open(&self, service: &str, from: CircuitState) -> StoreResult<()> {
        self.store
            .put(&key_state(service), CircuitState::Open.code(), Some(STATE_TTL))
            .await?;
        self.store
            .put(
                &key_opened_at(service),
                self.clock.unix_seconds(),
                Some(STATE_TTL),
            )
            .await?;
        self.store.remove(&key_failures(service)).await?;
        self.store.remove(&key_successes(service)).await?;
        self.store.remove(&key_probes(service)).await?;

        tracing::warn!(service, from = from.as_str(), "circuit opened");
        counter!(
            CIRCUIT_TRANSITIONS,
            "service" => service.to_string(),
            "from" => from.as_str(),
            "to" => "open"
        )
        .increment(1);
        Ok(())
    }

    async fn enter_half_open(&self, service: &str) -> StoreResult<()> {
        self.store
            .put(
                &key_state(service),
                CircuitState::HalfOpen.code(),
                Some(STATE_TTL),
            )
            .await?;
        self.store.remove(&key_successes(service)).await?;
        // The transitioning call is probe number one.
        self.store.put(&key_probes(service), 1, Some(STATE_TTL)).await?;

        tracing::info!(service, "circuit half-open, probing upstream");
        counter!(
            CIRCUIT_TRANSITIONS,
            "service" => service.to_string(),
            "from" => "open",
            "to" => "half_open"
        )
        .increment(1);
        Ok(())
    }

    async fn close(&self, service: &str) -> StoreResult<()> {
        self.store
            .put(
                &key_state(service),
                CircuitState::Closed.code(),
                Some(STATE_TTL),
            )
            .await?;
        self.store.remove(&key_failures(service)).await?;
        self.store.remove(&key_successes(service)).await?;
        self.store.remove(&key_probes(service)).await?;
        self.store.remove(&key_opened_at(service)).await?;

        tracing::info!(service, "circuit closed");
        counter!(
            CIRCUIT_TRANSITIONS,
            "service" => service.to_string(),
            "from" => "half_open",
            "to" => "closed"
        )
        .increment(1);
        Ok(())
    }
}
