pub mod circuit;
pub mod claims;
pub mod clock;
pub mod metrics_defs;
pub mod rate_limit;
pub mod store;
pub mod testutils;
