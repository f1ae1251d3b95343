use crate::types::Instance;
use serde::{Deserialize, Serialize};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How to pick an instance among the healthy members of a pool.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
    ClientAffinity,
}

/// Pick an instance. Pure over the current pool contents: the only
/// mutation is the pool's selection cursor, so this runs under the
/// registry's read lock.
///
/// `instances` is the full registration-ordered list; unselectable members
/// are skipped here rather than pre-filtered so affinity hashing stays
/// stable while instances flap.
pub(crate) fn pick(
    strategy: Strategy,
    instances: &[Arc<Instance>],
    cursor: &AtomicUsize,
    affinity: Option<&str>,
) -> Option<Arc<Instance>> {
    let healthy: Vec<&Arc<Instance>> = instances.iter().filter(|i| i.selectable()).collect();
    if healthy.is_empty() {
        return None;
    }

    let chosen = match strategy {
        Strategy::RoundRobin => round_robin(&healthy, cursor),
        Strategy::LeastConnections => healthy
            .iter()
            .min_by_key(|i| i.active_connections())
            .copied()
            .unwrap_or(healthy[0]),
        Strategy::Weighted => weighted(&healthy, cursor),
        Strategy::ClientAffinity => match affinity {
            Some(key) => {
                let mapped = &instances[hash_key(key) as usize % instances.len()];
                if mapped.selectable() {
                    mapped
                } else {
                    round_robin(&healthy, cursor)
                }
            }
            None => round_robin(&healthy, cursor),
        },
    };

    Some(Arc::clone(chosen))
}

fn round_robin<'a>(healthy: &[&'a Arc<Instance>], cursor: &AtomicUsize) -> &'a Arc<Instance> {
    let n = cursor.fetch_add(1, Ordering::Relaxed);
    healthy[n % healthy.len()]
}

/// Deterministic proportional selection: the cursor walks the cumulative
/// weight range, so over one full cycle each instance is picked exactly
/// `weight` times.
fn weighted<'a>(healthy: &[&'a Arc<Instance>], cursor: &AtomicUsize) -> &'a Arc<Instance> {
    let total: u64 = healthy.iter().map(|i| i.weight() as u64).sum();
    if total == 0 {
        return round_robin(healthy, cursor);
    }

    let mut slot = (cursor.fetch_add(1, Ordering::Relaxed) as u64) % total;
    for instance in healthy {
        let weight = instance.weight() as u64;
        if slot < weight {
            return instance;
        }
        slot -= weight;
    }
    healthy[healthy.len() - 1]
}

fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}
