use serde::Serialize;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }

    const fn code(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Unhealthy => 1,
            HealthStatus::Unknown => 2,
        }
    }

    const fn from_code(code: u8) -> HealthStatus {
        match code {
            0 => HealthStatus::Healthy,
            1 => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }
}

/// One concrete upstream endpoint behind a logical service.
///
/// Health and connection accounting are atomics so the probe loop and the
/// selection hot path never contend on a lock over this struct.
#[derive(Debug)]
pub struct Instance {
    pub address: String,
    pub port: u16,
    weight: AtomicU32,
    health: AtomicU8,
    active_connections: AtomicUsize,
    consecutive_probe_failures: AtomicU32,
    last_check_unix: AtomicU64,
}

impl Instance {
    pub fn new(address: impl Into<String>, port: u16, weight: u32) -> Self {
        Instance {
            address: address.into(),
            port,
            weight: AtomicU32::new(weight),
            health: AtomicU8::new(HealthStatus::Unknown.code()),
            active_connections: AtomicUsize::new(0),
            consecutive_probe_failures: AtomicU32::new(0),
            last_check_unix: AtomicU64::new(0),
        }
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus::from_code(self.health.load(Ordering::Relaxed))
    }

    pub fn set_health(&self, status: HealthStatus) {
        self.health.store(status.code(), Ordering::Relaxed);
    }

    /// Unhealthy instances are excluded from selection; Unknown ones (not
    /// yet probed) stay in the pool.
    pub fn selectable(&self) -> bool {
        self.health() != HealthStatus::Unhealthy
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub(crate) fn acquire(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn release(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Apply a successful probe result: reset the failure streak and
    /// re-include the instance.
    pub fn record_probe_success(&self) {
        self.consecutive_probe_failures.store(0, Ordering::Relaxed);
        self.set_health(HealthStatus::Healthy);
        self.touch_last_check();
    }

    /// Apply a failed probe result. Marks the instance Unhealthy once the
    /// streak reaches `threshold`; returns true when this call crossed it.
    pub fn record_probe_failure(&self, threshold: u32) -> bool {
        let streak = self
            .consecutive_probe_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        self.touch_last_check();
        if streak >= threshold && self.health() != HealthStatus::Unhealthy {
            self.set_health(HealthStatus::Unhealthy);
            return true;
        }
        false
    }

    fn touch_last_check(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.last_check_unix.store(now, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let last_check = self.last_check_unix.load(Ordering::Relaxed);
        InstanceSnapshot {
            address: self.address.clone(),
            port: self.port,
            weight: self.weight(),
            health: self.health(),
            active_connections: self.active_connections(),
            last_check_unix: (last_check > 0).then_some(last_check),
        }
    }
}

/// Point-in-time view of an instance for the admin stats surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSnapshot {
    pub address: String,
    pub port: u16,
    pub weight: u32,
    pub health: HealthStatus,
    pub active_connections: usize,
    pub last_check_unix: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_failure_threshold() {
        let instance = Instance::new("10.0.0.1", 8080, 1);
        assert_eq!(instance.health(), HealthStatus::Unknown);
        assert!(instance.selectable());

        assert!(!instance.record_probe_failure(3));
        assert!(!instance.record_probe_failure(3));
        assert!(instance.record_probe_failure(3));
        assert_eq!(instance.health(), HealthStatus::Unhealthy);
        assert!(!instance.selectable());

        // Already unhealthy: further failures do not re-cross.
        assert!(!instance.record_probe_failure(3));

        instance.record_probe_success();
        assert_eq!(instance.health(), HealthStatus::Healthy);
        assert!(instance.selectable());
    }

    #[test]
    fn test_connection_accounting() {
        let instance = Instance::new("10.0.0.1", 8080, 1);
        instance.acquire();
        instance.acquire();
        assert_eq!(instance.active_connections(), 2);
        instance.release();
        assert_eq!(instance.active_connections(), 1);
    }
}
