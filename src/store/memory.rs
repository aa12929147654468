//! In-memory collaborators for tests

use crate::error::{Error, Result};
use crate::ipam::Pool;
use crate::store::{PodLiveness, PoolSnapshot, PoolStore, ResourceVersion};
use std::collections::HashSet;
use std::sync::Mutex;

struct Stored {
    pool: Pool,
    version: u64,
    writes: usize,
}

/// Single-pool store with a monotonically increasing version
pub struct MemoryStore {
    stored: Mutex<Stored>,
    broken_writes: bool,
}

impl MemoryStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            stored: Mutex::new(Stored {
                pool,
                version: 1,
                writes: 0,
            }),
            broken_writes: false,
        }
    }

    /// Every write fails with a non-conflict error
    pub fn with_broken_writes(mut self) -> Self {
        self.broken_writes = true;
        self
    }

    /// Current stored pool
    pub fn pool(&self) -> Pool {
        self.stored.lock().unwrap().pool.clone()
    }

    /// Number of successful writes
    pub fn writes(&self) -> usize {
        self.stored.lock().unwrap().writes
    }
}

impl PoolStore for MemoryStore {
    fn fetch(&self, _pool_name: &str) -> Result<PoolSnapshot> {
        let stored = self.stored.lock().unwrap();
        Ok(PoolSnapshot {
            pool: stored.pool.clone(),
            version: ResourceVersion::new(stored.version.to_string()),
        })
    }

    fn write_status(&self, pool_name: &str, pool: &Pool, version: &ResourceVersion) -> Result<()> {
        if self.broken_writes {
            return Err(Error::Store("connection refused".into()));
        }

        let mut stored = self.stored.lock().unwrap();
        if version.as_str() != stored.version.to_string() {
            return Err(Error::Conflict {
                pool: pool_name.to_string(),
            });
        }

        // Only the status section is persisted
        stored.pool = stored
            .pool
            .clone()
            .with_dynamic_reservations(pool.dynamic_reservations().cloned());
        stored.version += 1;
        stored.writes += 1;
        Ok(())
    }
}

/// Set of live pods
#[derive(Default)]
pub struct MemoryLiveness {
    live: Mutex<HashSet<(String, String)>>,
    queries: Mutex<usize>,
    broken: bool,
}

impl MemoryLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pod(self, namespace: &str, pod: &str) -> Self {
        self.live
            .lock()
            .unwrap()
            .insert((namespace.to_string(), pod.to_string()));
        self
    }

    /// Every query fails
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    pub fn queries(&self) -> usize {
        *self.queries.lock().unwrap()
    }
}

impl PodLiveness for MemoryLiveness {
    fn exists(&self, namespace: &str, pod: &str) -> Result<bool> {
        *self.queries.lock().unwrap() += 1;
        if self.broken {
            return Err(Error::LivenessQuery(format!(
                "unable to get pod {}/{}",
                namespace, pod
            )));
        }
        Ok(self
            .live
            .lock()
            .unwrap()
            .contains(&(namespace.to_string(), pod.to_string())))
    }
}
