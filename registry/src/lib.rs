pub mod balancer;
pub mod metrics_defs;
pub mod prober;
pub mod registry;
pub mod types;

pub use balancer::Strategy;
pub use prober::{HealthProbe, HttpProber, ProbeError, ProbeSettings, spawn_probe_loop};
pub use registry::{NoHealthyInstanceError, Selection, ServiceRegistry, ServiceSnapshot};
pub use types::{HealthStatus, Instance, InstanceSnapshot};
