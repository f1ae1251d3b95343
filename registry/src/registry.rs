use crate::balancer::{Strategy, pick};
use crate::metrics_defs::SELECTION_FAILURES;
use crate::types::{Instance, InstanceSnapshot};
use parking_lot::RwLock;
use serde::Serialize;
use shared::counter;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("no healthy instance for service {service}")]
pub struct NoHealthyInstanceError {
    pub service: String,
}

struct Pool {
    strategy: Strategy,
    instances: Vec<Arc<Instance>>,
    cursor: AtomicUsize,
    probed: AtomicBool,
}

impl Pool {
    fn new(strategy: Strategy) -> Self {
        Pool {
            strategy,
            instances: Vec::new(),
            cursor: AtomicUsize::new(0),
            probed: AtomicBool::new(false),
        }
    }
}

struct RegistryInner {
    pools: RwLock<BTreeMap<String, Pool>>,
}

/// Live set of upstream instances per logical service.
///
/// The probe loop and registration calls mutate pools under the write
/// lock; request-path selection takes only the read lock and touches
/// nothing but atomics. Cheap to clone.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry {
            inner: Arc::new(RegistryInner {
                pools: RwLock::new(BTreeMap::new()),
            }),
        }
    }

    /// Create the pool for `service` (or update its strategy).
    pub fn add_service(&self, service: &str, strategy: Strategy) {
        let mut pools = self.inner.pools.write();
        pools
            .entry(service.to_string())
            .and_modify(|p| p.strategy = strategy)
            .or_insert_with(|| Pool::new(strategy));
    }

    /// Register an instance. Idempotent: re-registering the same
    /// `(service, address, port)` updates the weight without creating a
    /// duplicate pool entry.
    pub fn register(&self, service: &str, address: &str, port: u16, weight: u32) {
        let mut pools = self.inner.pools.write();
        let pool = pools
            .entry(service.to_string())
            .or_insert_with(|| Pool::new(Strategy::default()));

        match pool
            .instances
            .iter()
            .find(|i| i.address == address && i.port == port)
        {
            Some(existing) => existing.set_weight(weight),
            None => {
                tracing::info!(service, address, port, weight, "registered instance");
                pool.instances.push(Arc::new(Instance::new(address, port, weight)));
            }
        }
    }

    /// Pick an instance for one request. The returned [`Selection`] holds
    /// the instance's connection slot until dropped.
    pub fn select(
        &self,
        service: &str,
        affinity: Option<&str>,
    ) -> Result<Selection, NoHealthyInstanceError> {
        let pools = self.inner.pools.read();
        let chosen = pools
            .get(service)
            .and_then(|pool| pick(pool.strategy, &pool.instances, &pool.cursor, affinity));

        match chosen {
            Some(instance) => {
                instance.acquire();
                Ok(Selection { instance })
            }
            None => {
                counter!(SELECTION_FAILURES, "service" => service.to_string()).increment(1);
                Err(NoHealthyInstanceError {
                    service: service.to_string(),
                })
            }
        }
    }

    pub fn services(&self) -> Vec<String> {
        self.inner.pools.read().keys().cloned().collect()
    }

    pub(crate) fn instances_of(&self, service: &str) -> Vec<Arc<Instance>> {
        self.inner
            .pools
            .read()
            .get(service)
            .map(|pool| pool.instances.clone())
            .unwrap_or_default()
    }

    pub(crate) fn mark_probed(&self, service: &str) {
        if let Some(pool) = self.inner.pools.read().get(service) {
            pool.probed.store(true, Ordering::Relaxed);
        }
    }

    /// Ready once every pool has completed at least one probe round.
    pub fn is_ready(&self) -> bool {
        let pools = self.inner.pools.read();
        !pools.is_empty() && pools.values().all(|p| p.probed.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> BTreeMap<String, ServiceSnapshot> {
        let pools = self.inner.pools.read();
        pools
            .iter()
            .map(|(name, pool)| {
                (
                    name.clone(),
                    ServiceSnapshot {
                        strategy: pool.strategy,
                        instances: pool.instances.iter().map(|i| i.snapshot()).collect(),
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub strategy: Strategy,
    pub instances: Vec<InstanceSnapshot>,
}

/// A selected instance plus its connection slot; dropping the selection
/// releases the slot (least-connections accounting).
#[derive(Debug)]
pub struct Selection {
    instance: Arc<Instance>,
}

impl Selection {
    pub fn instance(&self) -> &Instance {
        &self.instance
    }
}

impl Drop for Selection {
    fn drop(&mut self) {
        self.instance.release();
    }
}
