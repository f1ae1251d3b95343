//! Test doubles shared by admission-control tests here and in dependent
//! crates.

use crate::store::{CounterStore, Result, StoreError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Store whose every operation fails, simulating a backend outage.
#[derive(Default)]
pub struct FailingCounterStore {
    calls: AtomicU64,
}

impl FailingCounterStore {
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("simulated outage".to_string()))
    }
}

#[async_trait]
impl CounterStore for FailingCounterStore {
    async fn incr(&self, _key: &str, _ttl: Duration) -> Result<u64> {
        self.fail()
    }

    async fn decr(&self, _key: &str) -> Result<u64> {
        self.fail()
    }

    async fn get(&self, _key: &str) -> Result<Option<u64>> {
        self.fail()
    }

    async fn put(&self, _key: &str, _value: u64, _ttl: Option<Duration>) -> Result<()> {
        self.fail()
    }

    async fn remove(&self, _key: &str) -> Result<()> {
        self.fail()
    }
}
