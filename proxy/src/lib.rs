pub mod admin;
pub mod config;
pub mod errors;
pub mod forward;
pub mod metrics_defs;
pub mod router;
pub mod settings;

use crate::admin::{AdminService, AdminState};
use crate::config::{Config, CounterStoreConfig};
use crate::errors::GatewayError;
use crate::router::{RouterService, RouterState};
use crate::settings::SharedSettings;
use control::circuit::CircuitBreaker;
use control::claims::ClaimsValidator;
use control::clock::{Clock, SystemClock};
use control::rate_limit::{CachedPlanResolver, PlanResolver, RateLimiter, StaticPlanResolver};
use control::store::{CounterStore, MemoryCounterStore, RedisCounterStore};
use metrics_exporter_prometheus::PrometheusHandle;
use registry::{HttpProber, ServiceRegistry, spawn_probe_loop};
use shared::http::run_http_service;
use std::sync::Arc;
use std::time::Duration;

/// Assemble the gateway from a validated [`Config`] and serve both
/// listeners until one of them fails.
pub async fn run(config: Config, metrics: Option<PrometheusHandle>) -> Result<(), GatewayError> {
    metrics_defs::describe_all();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let store: Arc<dyn CounterStore> = match &config.counter_store {
        CounterStoreConfig::Memory => {
            tracing::warn!("using in-memory counters; limits are per-replica");
            Arc::new(MemoryCounterStore::new(clock.clone()))
        }
        CounterStoreConfig::Redis { url } => Arc::new(RedisCounterStore::connect(url).await?),
    };

    let validator = ClaimsValidator::new(
        config.auth.secret.as_bytes(),
        config.auth.issuer.as_deref(),
        config.auth.audience.as_deref(),
        clock.clone(),
    );

    let plans: Arc<dyn PlanResolver> = Arc::new(CachedPlanResolver::new(
        Arc::new(StaticPlanResolver::new(
            config.plan_assignments.clone(),
            config.limits.rate.organization.default_plan.clone(),
        )),
        config.plan_cache.capacity,
        Duration::from_secs(config.plan_cache.ttl_secs),
    ));
    let limiter = Arc::new(RateLimiter::new(store.clone(), plans, clock.clone()));
    let breaker = Arc::new(CircuitBreaker::new(store, clock));

    let registry = ServiceRegistry::new();
    for service in &config.services {
        registry.add_service(&service.name, service.strategy);
        for instance in &service.instances {
            registry.register(&service.name, &instance.address, instance.port, instance.weight);
        }
        let prober = Arc::new(HttpProber::new(
            &service.probe.path,
            Duration::from_secs(service.probe.timeout_secs),
        ));
        spawn_probe_loop(
            registry.clone(),
            service.name.clone(),
            prober,
            service.probe.clone(),
        );
    }

    let settings = SharedSettings::new(config.limits.clone());

    let router = RouterService::new(RouterState {
        validator,
        limiter: limiter.clone(),
        breaker: breaker.clone(),
        registry: registry.clone(),
        settings: settings.clone(),
        client: forward::build_client(),
        routes: config.routes.clone(),
        upstream_timeout: Duration::from_secs(config.upstream_timeout_secs),
    });
    let admin = AdminService::new(AdminState {
        registry,
        settings,
        breaker,
        limiter,
        metrics,
    });

    tracing::info!(
        listener = %format!("{}:{}", config.listener.host, config.listener.port),
        admin = %format!("{}:{}", config.admin_listener.host, config.admin_listener.port),
        services = config.services.len(),
        "gateway listening"
    );

    tokio::try_join!(
        run_http_service(&config.listener.host, config.listener.port, router),
        run_http_service(&config.admin_listener.host, config.admin_listener.port, admin),
    )?;
    Ok(())
}
