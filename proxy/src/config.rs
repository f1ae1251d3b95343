use crate::settings::LimitSettings;
use control::circuit::TripPolicy;
use registry::{ProbeSettings, Strategy};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Auth secret cannot be empty")]
    EmptySecret,

    #[error("Empty service name")]
    EmptyServiceName,

    #[error("Duplicate service name: {0}")]
    DuplicateService(String),

    #[error("Service has no instances: {0}")]
    ServiceWithoutInstances(String),

    #[error("Route references unknown service: {0}")]
    UnknownRouteService(String),

    #[error("Route path prefix must start with '/': {0:?}")]
    BadRoutePrefix(String),

    #[error("Rate window for {0} tier cannot be 0 seconds")]
    ZeroWindow(&'static str),

    #[error("Organization default plan has no configured limit: {0}")]
    UnknownDefaultPlan(String),

    #[error("Invalid circuit settings: {0}")]
    InvalidCircuit(&'static str),
}

/// Gateway configuration, loaded once at startup. The `limits` section is
/// also accepted by the admin reload endpoint.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Main listener for proxied traffic
    pub listener: Listener,
    /// Admin listener for health, stats, reload and metrics
    pub admin_listener: Listener,
    pub auth: AuthConfig,
    #[serde(default)]
    pub counter_store: CounterStoreConfig,
    /// Whole upstream request/response cycle deadline
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,
    pub services: Vec<ServiceConfig>,
    pub routes: Vec<Route>,
    pub limits: LimitSettings,
    /// Explicit org-to-plan assignments; unlisted orgs get the default plan
    #[serde(default)]
    pub plan_assignments: HashMap<String, String>,
    #[serde(default)]
    pub plan_cache: PlanCacheConfig,
    #[serde(default)]
    pub sentry_dsn: Option<String>,
}

fn default_upstream_timeout() -> u64 {
    30
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;
        self.admin_listener.validate()?;

        if self.auth.secret.is_empty() {
            return Err(ValidationError::EmptySecret);
        }

        let mut service_names = HashSet::new();
        for service in &self.services {
            if service.name.is_empty() {
                return Err(ValidationError::EmptyServiceName);
            }
            if !service_names.insert(&service.name) {
                return Err(ValidationError::DuplicateService(service.name.clone()));
            }
            if service.instances.is_empty() {
                return Err(ValidationError::ServiceWithoutInstances(
                    service.name.clone(),
                ));
            }
            for instance in &service.instances {
                if instance.port == 0 {
                    return Err(ValidationError::InvalidPort);
                }
            }
        }

        for route in &self.routes {
            if !route.path_prefix.starts_with('/') {
                return Err(ValidationError::BadRoutePrefix(route.path_prefix.clone()));
            }
            if !service_names.contains(&route.service) {
                return Err(ValidationError::UnknownRouteService(route.service.clone()));
            }
        }

        validate_limits(&self.limits)
    }
}

/// Validate the reloadable section. Also called on every admin reload so a
/// bad payload never becomes the active generation.
pub fn validate_limits(limits: &LimitSettings) -> Result<(), ValidationError> {
    let rate = &limits.rate;
    if rate.endpoint.window_secs == 0 {
        return Err(ValidationError::ZeroWindow("endpoint"));
    }
    if rate.user.window_secs == 0 {
        return Err(ValidationError::ZeroWindow("user"));
    }
    for plan_limit in rate.organization.plans.values() {
        if plan_limit.window_secs == 0 {
            return Err(ValidationError::ZeroWindow("organization"));
        }
    }
    if !rate
        .organization
        .plans
        .contains_key(&rate.organization.default_plan)
    {
        return Err(ValidationError::UnknownDefaultPlan(
            rate.organization.default_plan.clone(),
        ));
    }

    let circuit = &limits.circuit;
    if circuit.timeout_secs == 0 {
        return Err(ValidationError::InvalidCircuit("timeout_secs cannot be 0"));
    }
    if circuit.success_threshold == 0 {
        return Err(ValidationError::InvalidCircuit(
            "success_threshold cannot be 0",
        ));
    }
    if circuit.half_open_max_probes == 0 {
        return Err(ValidationError::InvalidCircuit(
            "half_open_max_probes cannot be 0",
        ));
    }
    match circuit.trip {
        TripPolicy::ConsecutiveFailures { threshold } => {
            if threshold == 0 {
                return Err(ValidationError::InvalidCircuit("trip threshold cannot be 0"));
            }
        }
        TripPolicy::ErrorRate {
            threshold,
            window_secs,
            min_requests,
        } => {
            if !(threshold > 0.0 && threshold < 1.0) {
                return Err(ValidationError::InvalidCircuit(
                    "error rate threshold must be between 0 and 1",
                ));
            }
            if window_secs == 0 {
                return Err(ValidationError::InvalidCircuit(
                    "error rate window cannot be 0 seconds",
                ));
            }
            if min_requests == 0 {
                return Err(ValidationError::InvalidCircuit(
                    "min_requests cannot be 0",
                ));
            }
        }
    }
    Ok(())
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AuthConfig {
    /// HMAC secret shared with the token issuer
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

/// Where rate-limit and breaker counters live. Memory is for single-replica
/// and test deployments; Redis for anything replicated.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum CounterStoreConfig {
    #[default]
    Memory,
    Redis {
        url: String,
    },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub probe: ProbeSettings,
    pub instances: Vec<InstanceConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct InstanceConfig {
    pub address: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Longest matching prefix wins, regardless of declaration order.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Route {
    pub path_prefix: String,
    pub service: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlanCacheConfig {
    pub capacity: u64,
    pub ttl_secs: u64,
}

impl Default for PlanCacheConfig {
    fn default() -> Self {
        PlanCacheConfig {
            capacity: 10_000,
            ttl_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_YAML: &str = r#"
listener:
    host: "0.0.0.0"
    port: 8080
admin_listener:
    host: "127.0.0.1"
    port: 8081
auth:
    secret: "shared-hmac-secret"
    issuer: "https://issuer.example.com"
counter_store:
    backend: redis
    url: "redis://127.0.0.1:6379"
upstream_timeout_secs: 10
services:
    - name: jobs
      strategy: least_connections
      probe:
          path: /healthz
          interval_secs: 5
          timeout_secs: 1
          failure_threshold: 2
      instances:
          - address: "10.0.0.1"
            port: 9000
          - address: "10.0.0.2"
            port: 9000
            weight: 3
    - name: search
      instances:
          - address: "10.0.1.1"
            port: 9100
routes:
    - path_prefix: /api/jobs
      service: jobs
    - path_prefix: /api
      service: search
limits:
    rate:
        endpoint: {limit: 100, window_secs: 60}
        user: {limit: 50, window_secs: 60}
        organization:
            default_plan: free
            plans:
                free: {limit: 20, window_secs: 60}
                enterprise: {limit: 1000, window_secs: 60}
    circuit:
        trip:
            policy: error_rate
            threshold: 0.5
            window_secs: 30
            min_requests: 20
        timeout_secs: 45
plan_assignments:
    big-corp: enterprise
"#;

    fn valid_config() -> Config {
        serde_yaml::from_str(VALID_YAML).unwrap()
    }

    #[test]
    fn test_parse_valid_config() {
        let config = valid_config();
        assert!(config.validate().is_ok());

        assert_eq!(config.listener.port, 8080);
        assert_eq!(
            config.counter_store,
            CounterStoreConfig::Redis {
                url: "redis://127.0.0.1:6379".to_string()
            }
        );
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].strategy, Strategy::LeastConnections);
        assert_eq!(config.services[0].probe.path, "/healthz");
        assert_eq!(config.services[0].instances[1].weight, 3);
        // Defaults fill in omitted sections.
        assert_eq!(config.services[1].strategy, Strategy::RoundRobin);
        assert_eq!(config.services[1].instances[0].weight, 1);
        assert_eq!(config.services[1].probe, ProbeSettings::default());
        assert_eq!(config.limits.circuit.timeout_secs, 45);
        assert_eq!(config.limits.circuit.success_threshold, 3);
        assert_eq!(
            config.plan_assignments.get("big-corp").unwrap(),
            "enterprise"
        );
    }

    #[test]
    fn test_minimal_config_defaults() {
        let yaml = r#"
listener: {host: "0.0.0.0", port: 8080}
admin_listener: {host: "127.0.0.1", port: 8081}
auth: {secret: "s"}
services:
    - name: api
      instances: [{address: "127.0.0.1", port: 9000}]
routes:
    - {path_prefix: /, service: api}
limits:
    rate:
        endpoint: {limit: 100, window_secs: 60}
        user: {limit: 50, window_secs: 60}
        organization:
            default_plan: free
            plans:
                free: {limit: 20, window_secs: 60}
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.counter_store, CounterStoreConfig::Memory);
        assert_eq!(config.upstream_timeout_secs, 30);
        assert_eq!(
            config.limits.circuit.trip,
            TripPolicy::ConsecutiveFailures { threshold: 5 }
        );
        assert_eq!(config.plan_cache, PlanCacheConfig::default());
    }

    #[test]
    fn test_validation_errors() {
        let base = valid_config();

        let mut config = base.clone();
        config.listener.port = 0;
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::InvalidPort
        ));

        let mut config = base.clone();
        config.auth.secret = String::new();
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::EmptySecret
        ));

        let mut config = base.clone();
        config.services[1].name = "jobs".to_string();
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::DuplicateService(_)
        ));

        let mut config = base.clone();
        config.services[0].instances.clear();
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::ServiceWithoutInstances(_)
        ));

        let mut config = base.clone();
        config.routes[0].service = "missing".to_string();
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::UnknownRouteService(_)
        ));

        let mut config = base.clone();
        config.routes[0].path_prefix = "api".to_string();
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::BadRoutePrefix(_)
        ));
    }

    #[test]
    fn test_limit_validation_errors() {
        let base = valid_config();

        let mut config = base.clone();
        config.limits.rate.user.window_secs = 0;
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::ZeroWindow("user")
        ));

        let mut config = base.clone();
        config.limits.rate.organization.default_plan = "platinum".to_string();
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::UnknownDefaultPlan(_)
        ));

        let mut config = base.clone();
        config.limits.circuit.timeout_secs = 0;
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::InvalidCircuit(_)
        ));

        let mut config = base.clone();
        config.limits.circuit.trip = TripPolicy::ErrorRate {
            threshold: 1.5,
            window_secs: 30,
            min_requests: 10,
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ValidationError::InvalidCircuit(_)
        ));
    }

    #[test]
    fn test_deserialization_errors() {
        // Unknown counter store backend
        assert!(
            serde_yaml::from_str::<CounterStoreConfig>("backend: etcd").is_err()
        );

        // Unknown balancing strategy
        assert!(serde_yaml::from_str::<Strategy>("fastest_first").is_err());

        // Missing required field
        assert!(
            serde_yaml::from_str::<Config>(
                r#"
listener: {host: "0.0.0.0"}
"#
            )
            .is_err()
        );
    }
}
