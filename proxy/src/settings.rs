use control::circuit::CircuitSettings;
use control::rate_limit::RateSettings;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The reloadable part of the configuration: quotas and breaker behavior.
/// Everything else (listeners, services, routes) requires a restart.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LimitSettings {
    pub rate: RateSettings,
    #[serde(default)]
    pub circuit: CircuitSettings,
}

/// One immutable generation of limit settings.
#[derive(Debug)]
pub struct VersionedSettings {
    pub version: u64,
    pub limits: LimitSettings,
}

/// Copy-on-write handle to the active settings generation.
///
/// A request reads the pointer once at the start of its pipeline and keeps
/// that generation for its whole lifetime; a concurrent reload never
/// changes the rules mid-request. The write lock is held only for the
/// pointer swap.
#[derive(Clone)]
pub struct SharedSettings {
    inner: Arc<RwLock<Arc<VersionedSettings>>>,
}

impl SharedSettings {
    pub fn new(limits: LimitSettings) -> Self {
        SharedSettings {
            inner: Arc::new(RwLock::new(Arc::new(VersionedSettings {
                version: 1,
                limits,
            }))),
        }
    }

    pub fn current(&self) -> Arc<VersionedSettings> {
        self.inner.read().clone()
    }

    /// Install a new generation and return its version number.
    pub fn swap(&self, limits: LimitSettings) -> u64 {
        let mut slot = self.inner.write();
        let version = slot.version + 1;
        *slot = Arc::new(VersionedSettings { version, limits });
        version
    }
}
