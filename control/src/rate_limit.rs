use crate::claims::Claims;
use crate::clock::Clock;
use crate::metrics_defs::{COUNTER_STORE_FAILURES, RATE_LIMIT_DECISIONS};
use crate::store::CounterStore;
use async_trait::async_trait;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use shared::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Independent dimension along which quotas are enforced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Endpoint,
    User,
    Organization,
}

impl Tier {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Tier::Endpoint => "endpoint",
            Tier::User => "user",
            Tier::Organization => "organization",
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct TierLimit {
    pub limit: u64,
    pub window_secs: u64,
}

/// Organization limits keyed by subscription plan.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrgLimits {
    pub default_plan: String,
    pub plans: HashMap<String, TierLimit>,
}

impl OrgLimits {
    pub fn limit_for(&self, plan: &str) -> Option<&TierLimit> {
        self.plans
            .get(plan)
            .or_else(|| self.plans.get(&self.default_plan))
    }
}

/// Per-tier quotas; part of the reloadable settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RateSettings {
    pub endpoint: TierLimit,
    pub user: TierLimit,
    pub organization: OrgLimits,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied { tier: Tier },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Fixed-window counter key: `(tier, identity, floor(now / window))`.
/// Expiry is enforced by the store TTL; keys are never deleted explicitly.
pub fn window_key(tier: Tier, identity: &str, window_secs: u64, unix_now: u64) -> String {
    let window_start = unix_now / window_secs * window_secs;
    format!("rl:{}:{}:{}", tier.as_str(), identity, window_start)
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan lookup failed: {0}")]
    Lookup(String),
}

/// Resolves an organization's subscription plan. Injected so the gateway
/// never hard-codes tiers; backed by whatever billing source the
/// deployment has.
#[async_trait]
pub trait PlanResolver: Send + Sync {
    async fn plan_for(&self, org_id: &str) -> Result<String, PlanError>;
}

/// Plan assignments from static configuration; unknown organizations get
/// the default plan.
pub struct StaticPlanResolver {
    assignments: HashMap<String, String>,
    default_plan: String,
}

impl StaticPlanResolver {
    pub fn new(assignments: HashMap<String, String>, default_plan: String) -> Self {
        StaticPlanResolver {
            assignments,
            default_plan,
        }
    }
}

#[async_trait]
impl PlanResolver for StaticPlanResolver {
    async fn plan_for(&self, org_id: &str) -> Result<String, PlanError> {
        Ok(self
            .assignments
            .get(org_id)
            .cloned()
            .unwrap_or_else(|| self.default_plan.clone()))
    }
}

/// Caches plan lookups so the billing source is not consulted per request.
pub struct CachedPlanResolver {
    inner: Arc<dyn PlanResolver>,
    cache: Cache<String, String>,
}

impl CachedPlanResolver {
    pub fn new(inner: Arc<dyn PlanResolver>, capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        CachedPlanResolver { inner, cache }
    }
}

#[async_trait]
impl PlanResolver for CachedPlanResolver {
    async fn plan_for(&self, org_id: &str) -> Result<String, PlanError> {
        if let Some(plan) = self.cache.get(org_id) {
            return Ok(plan);
        }
        let plan = self.inner.plan_for(org_id).await?;
        self.cache.insert(org_id.to_string(), plan.clone());
        Ok(plan)
    }
}

#[derive(Default)]
pub struct TierTally {
    pub allowed: AtomicU64,
    pub denied: AtomicU64,
}

/// Aggregated decision counts for the admin stats surface. Identities are
/// deliberately not part of this; only totals per tier.
#[derive(Default)]
pub struct RateLimitStats {
    endpoint: TierTally,
    user: TierTally,
    organization: TierTally,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TallySnapshot {
    pub allowed: u64,
    pub denied: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub endpoint: TallySnapshot,
    pub user: TallySnapshot,
    pub organization: TallySnapshot,
}

impl RateLimitStats {
    fn tally(&self, tier: Tier) -> &TierTally {
        match tier {
            Tier::Endpoint => &self.endpoint,
            Tier::User => &self.user,
            Tier::Organization => &self.organization,
        }
    }

    fn snapshot_tier(tally: &TierTally) -> TallySnapshot {
        TallySnapshot {
            allowed: tally.allowed.load(Ordering::Relaxed),
            denied: tally.denied.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            endpoint: Self::snapshot_tier(&self.endpoint),
            user: Self::snapshot_tier(&self.user),
            organization: Self::snapshot_tier(&self.organization),
        }
    }
}

/// Multi-tier fixed-window rate limiter over the shared counter store.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    plans: Arc<dyn PlanResolver>,
    clock: Arc<dyn Clock>,
    stats: RateLimitStats,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        plans: Arc<dyn PlanResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        RateLimiter {
            store,
            plans,
            clock,
            stats: RateLimitStats::default(),
        }
    }

    /// Check one tier: a single atomic increment on the current window key.
    ///
    /// Store outage fails open; the fault is logged and counted, never
    /// surfaced to the client.
    pub async fn check(&self, tier: Tier, identity: &str, limit: &TierLimit) -> Decision {
        let key = window_key(tier, identity, limit.window_secs, self.clock.unix_seconds());

        let decision = match self
            .store
            .incr(&key, Duration::from_secs(limit.window_secs))
            .await
        {
            Ok(count) if count > limit.limit => Decision::Denied { tier },
            Ok(_) => Decision::Allowed,
            Err(err) => {
                tracing::warn!(
                    tier = tier.as_str(),
                    error = %err,
                    "counter store unreachable, failing open"
                );
                counter!(COUNTER_STORE_FAILURES, "component" => "rate_limiter").increment(1);
                Decision::Allowed
            }
        };

        let tally = self.stats.tally(tier);
        let outcome = match decision {
            Decision::Allowed => {
                tally.allowed.fetch_add(1, Ordering::Relaxed);
                "allowed"
            }
            Decision::Denied { .. } => {
                tally.denied.fetch_add(1, Ordering::Relaxed);
                "denied"
            }
        };
        counter!(RATE_LIMIT_DECISIONS, "tier" => tier.as_str(), "outcome" => outcome).increment(1);

        decision
    }

    /// Evaluate all tiers for a request: Endpoint, then User, then
    /// Organization, short-circuiting on the first denial. A tier that is
    /// never reached is never incremented.
    pub async fn check_request(
        &self,
        claims: &Claims,
        method: &str,
        path: &str,
        settings: &RateSettings,
    ) -> Decision {
        let endpoint_identity = format!("{method} {path}");
        let decision = self
            .check(Tier::Endpoint, &endpoint_identity, &settings.endpoint)
            .await;
        if !decision.is_allowed() {
            return decision;
        }

        let decision = self
            .check(Tier::User, &claims.subject_id, &settings.user)
            .await;
        if !decision.is_allowed() {
            return decision;
        }

        let plan = match self.plans.plan_for(&claims.org_id).await {
            Ok(plan) => plan,
            Err(err) => {
                tracing::warn!(error = %err, "plan lookup failed, using default plan");
                settings.organization.default_plan.clone()
            }
        };

        match settings.organization.limit_for(&plan) {
            Some(limit) => self.check(Tier::Organization, &claims.org_id, limit).await,
            None => {
                // No limit configured for the plan or the default; treat the
                // organization tier as unlimited.
                tracing::warn!(plan = %plan, "no organization limit configured for plan");
                Decision::Allowed
            }
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
