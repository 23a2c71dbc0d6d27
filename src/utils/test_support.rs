use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;

use crate::gateway::Clock;
use crate::gateway::store::{KvStore, MemoryStore, StoreError, Versioned};

pub fn should_skip_httpmock() -> bool {
    if can_bind_localhost() {
        return false;
    }
    eprintln!("skipping httpmock test: sandbox forbids binding to localhost");
    true
}

fn can_bind_localhost() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(err) => panic!("failed to bind localhost for httpmock tests: {err}"),
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(now_millis),
        }
    }

    pub fn set(&self, now_millis: u64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// In-memory store with injectable write failures and CAS conflicts.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
    cas_conflicts: AtomicUsize,
    writes: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, `set`, `delete` and `compare_and_set` return a backend error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// The next `count` compare-and-set calls report a version conflict.
    pub fn fail_next_cas(&self, count: usize) {
        self.cas_conflicts.store(count, Ordering::SeqCst);
    }

    /// Successful `set` and `compare_and_set` calls so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend {
                message: "injected write failure".to_string(),
            });
        }
        Ok(())
    }

    fn take_conflict(&self) -> bool {
        self.cas_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned<Value>>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<u64, StoreError> {
        self.check_writable()?;
        let version = self.inner.set(key, value).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_writable()?;
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned<Value>)>, StoreError> {
        self.inner.list(prefix).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<bool, StoreError> {
        self.check_writable()?;
        if self.take_conflict() {
            return Ok(false);
        }
        let applied = self.inner.compare_and_set(key, expected, value).await?;
        if applied {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(applied)
    }
}
