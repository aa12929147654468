//! Pod address allocation against a versioned pool store
//!
//! Each call reads a fresh pool snapshot, works on it in memory and writes
//! it back at most once, guarded by the snapshot's version. Losing that race
//! surfaces as `Error::Conflict`; restarting the call is the caller's job.

use crate::error::{Error, Result};
use crate::ipam::pool::{Coverage, Pool, ReservationKind};
use crate::store::{PodLiveness, PoolSnapshot, PoolStore};
use ipnet::IpNet;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Deserialize;
use std::net::IpAddr;

/// What happens to a candidate taken over from a pod that no longer exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReclaimMode {
    /// The reclaimed candidate is assigned right away
    #[default]
    Accept,
    /// The reclaimed candidate goes through one more evaluation before it
    /// is assigned; no new candidate is drawn in between
    Reevaluate,
}

/// Allocator tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatorOptions {
    /// Random candidates drawn before giving up on a saturated pool
    #[serde(default = "default_max_probes")]
    pub max_probes: u32,

    #[serde(default)]
    pub reclaim: ReclaimMode,

    #[serde(default)]
    pub coverage: Coverage,
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        Self {
            max_probes: default_max_probes(),
            reclaim: ReclaimMode::default(),
            coverage: Coverage::default(),
        }
    }
}

fn default_max_probes() -> u32 {
    4096
}

/// An address handed to a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Pod address with the pool's netmask
    pub address: IpNet,
    pub gateway: Option<IpAddr>,
}

impl Allocation {
    /// Addresses from the pool's own family carry its netmask. Anything else,
    /// such as a static entry from the other family, gets a host prefix.
    fn new(pool: &Pool, addr: IpAddr) -> Self {
        let same_family = addr.is_ipv4() == pool.range().network().is_ipv4();
        let address = u8::try_from(pool.netmask_bits())
            .ok()
            .filter(|_| same_family)
            .and_then(|prefix_len| IpNet::new(addr, prefix_len).ok())
            .unwrap_or_else(|| IpNet::from(addr));
        Self {
            address,
            gateway: pool.gateway(),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.address.addr()
    }
}

/// Allocates and frees pod addresses in one named pool
pub struct Allocator<S, L> {
    store: S,
    liveness: L,
    pool_name: String,
    options: AllocatorOptions,
    rng: StdRng,
}

impl<S: PoolStore, L: PodLiveness> Allocator<S, L> {
    pub fn new(store: S, liveness: L, pool_name: impl Into<String>) -> Self {
        Self {
            store,
            liveness,
            pool_name: pool_name.into(),
            options: AllocatorOptions::default(),
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_options(mut self, options: AllocatorOptions) -> Self {
        self.options = options;
        self
    }

    /// Use a specific random source for candidate draws
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// Get an address for a pod
    ///
    /// A pod that already holds a reservation gets it back without a write.
    pub fn allocate(&mut self, namespace: &str, pod: &str) -> Result<Allocation> {
        let PoolSnapshot { mut pool, version } = self.store.fetch(&self.pool_name)?;
        pool.validate()?;

        if let Some(addr) = pool.existing_reservation(namespace, pod) {
            return Ok(Allocation::new(&pool, addr));
        }

        let addr = self.probe(&mut pool, namespace, pod)?;
        self.store.write_status(&self.pool_name, &pool, &version)?;
        Ok(Allocation::new(&pool, addr))
    }

    /// Drop a pod's dynamic reservation
    ///
    /// Freeing a pod without one succeeds without writing.
    pub fn free(&self, namespace: &str, pod: &str) -> Result<()> {
        let PoolSnapshot { mut pool, version } = self.store.fetch(&self.pool_name)?;

        if pool.release_dynamic(namespace, pod).is_none() {
            return Ok(());
        }

        self.store.write_status(&self.pool_name, &pool, &version)
    }

    /// Current allocation of a pod, without changing anything
    pub fn lookup(&self, namespace: &str, pod: &str) -> Result<Option<Allocation>> {
        let PoolSnapshot { pool, .. } = self.store.fetch(&self.pool_name)?;
        pool.validate()?;

        Ok(pool
            .existing_reservation(namespace, pod)
            .map(|addr| Allocation::new(&pool, addr)))
    }

    /// Draw candidates until one can be reserved for the pod
    ///
    /// Candidates held by pods that no longer exist are reclaimed. Static
    /// reservations are never reclaimed.
    fn probe(&mut self, pool: &mut Pool, namespace: &str, pod: &str) -> Result<IpAddr> {
        let mut draws: u32 = 0;
        let mut pending: Option<IpAddr> = None;

        loop {
            let candidate = match pending.take() {
                Some(candidate) => candidate,
                None => {
                    if draws >= self.options.max_probes {
                        return Err(Error::PoolExhausted {
                            pool: self.pool_name.clone(),
                            attempts: draws,
                        });
                    }
                    draws += 1;
                    pool.random_address(&mut self.rng, self.options.coverage)
                }
            };

            match pool.holder_of(&candidate) {
                Some(holder) if holder.is(namespace, pod) => return Ok(candidate),
                Some(holder) if holder.kind == ReservationKind::Static => continue,
                Some(holder) => {
                    if self.liveness.exists(&holder.namespace, &holder.pod)? {
                        continue;
                    }

                    pool.release_dynamic(&holder.namespace, &holder.pod);
                    pool.reserve_dynamic(namespace, pod, candidate);
                    match self.options.reclaim {
                        ReclaimMode::Accept => return Ok(candidate),
                        ReclaimMode::Reevaluate => pending = Some(candidate),
                    }
                }
                None if !pool.is_reserved(&candidate) => {
                    pool.reserve_dynamic(namespace, pod, candidate);
                    return Ok(candidate);
                }
                // Gateway
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipam::range::Range;
    use crate::ipam::reservation::ReservationTable;
    use crate::store::ResourceVersion;
    use crate::store::memory::{MemoryLiveness, MemoryStore};
    use std::cell::Cell;
    use std::collections::HashSet;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn pool(range: &str, netmask_bits: i32) -> Pool {
        Pool::new(Range::parse(range).unwrap(), netmask_bits)
    }

    fn allocator<'a>(
        store: &'a MemoryStore,
        liveness: &'a MemoryLiveness,
        seed: u64,
    ) -> Allocator<&'a MemoryStore, &'a MemoryLiveness> {
        Allocator::new(store, liveness, "sample").with_rng(StdRng::seed_from_u64(seed))
    }

    #[test]
    fn test_allocate_from_empty_pool() {
        let store = MemoryStore::new(pool("2001:db8::/65", 64));
        let liveness = MemoryLiveness::new();
        let mut allocator = allocator(&store, &liveness, 1);

        let allocation = allocator.allocate("ns1", "pod1").unwrap();
        assert!(Range::parse("2001:db8::/65").unwrap().contains(&allocation.ip()));
        assert_eq!(allocation.address.prefix_len(), 64);
        assert_eq!(allocation.gateway, None);

        let stored = store.pool();
        assert_eq!(stored.existing_reservation("ns1", "pod1"), Some(allocation.ip()));
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn test_allocate_returns_gateway() {
        let store = MemoryStore::new(
            pool("2001:db8::/65", 64).with_gateway(Some(ip("2001:db8::1"))),
        );
        let liveness = MemoryLiveness::new();
        let mut allocator = allocator(&store, &liveness, 2);

        let allocation = allocator.allocate("foo", "bar").unwrap();
        assert_eq!(allocation.gateway, Some(ip("2001:db8::1")));
        assert_ne!(allocation.ip(), ip("2001:db8::1"));
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let store = MemoryStore::new(pool("10.2.3.64/28", 27));
        let liveness = MemoryLiveness::new();
        let mut allocator = allocator(&store, &liveness, 3);

        let first = allocator.allocate("ns1", "pod1").unwrap();
        let second = allocator.allocate("ns1", "pod1").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn test_static_reservation_used_without_write() {
        let mut statics = ReservationTable::new();
        statics.reserve("ns-bar", "pod-foo", ip("2001:db8:0:1::23"));
        let store = MemoryStore::new(pool("2001:db8::/65", 64).with_static_reservations(statics));
        let liveness = MemoryLiveness::new();
        let mut allocator = allocator(&store, &liveness, 4);

        let allocation = allocator.allocate("ns-bar", "pod-foo").unwrap();
        assert_eq!(allocation.ip(), ip("2001:db8:0:1::23"));
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn test_static_reservation_from_other_family() {
        let mut statics = ReservationTable::new();
        statics.reserve("ns", "legacy", ip("192.0.2.10"));
        let store = MemoryStore::new(pool("2001:db8::/65", 64).with_static_reservations(statics));
        let liveness = MemoryLiveness::new();
        let mut allocator = allocator(&store, &liveness, 4);

        let allocation = allocator.allocate("ns", "legacy").unwrap();
        assert_eq!(allocation.address, "192.0.2.10/32".parse::<IpNet>().unwrap());
        assert_eq!(store.writes(), 0);
        assert_eq!(allocator.lookup("ns", "legacy").unwrap(), Some(allocation));
    }

    #[test]
    fn test_free_then_allocate_draws_again() {
        let store = MemoryStore::new(pool("2001:db8::/65", 64));
        let liveness = MemoryLiveness::new();
        let mut allocator = allocator(&store, &liveness, 5);

        let first = allocator.allocate("ns1", "pod1").unwrap();
        allocator.free("ns1", "pod1").unwrap();

        let stored = store.pool();
        assert_eq!(stored.existing_reservation("ns1", "pod1"), None);
        assert!(!stored.is_reserved(&first.ip()));
        assert!(!stored.dynamic_reservations().unwrap().contains_namespace("ns1"));

        let second = allocator.allocate("ns1", "pod1").unwrap();
        assert_eq!(store.pool().existing_reservation("ns1", "pod1"), Some(second.ip()));
        assert_eq!(store.writes(), 3);
    }

    #[test]
    fn test_free_unknown_pod_is_noop() {
        let store = MemoryStore::new(pool("10.2.3.64/28", 27));
        let liveness = MemoryLiveness::new();
        let allocator = allocator(&store, &liveness, 6);

        allocator.free("ns1", "ghost").unwrap();
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn test_fills_pool_then_exhausts() {
        let store = MemoryStore::new(pool("10.0.0.0/30", 30).with_gateway(Some(ip("10.0.0.1"))));
        let liveness = MemoryLiveness::new()
            .with_pod("ns", "a")
            .with_pod("ns", "b")
            .with_pod("ns", "c");
        let mut allocator = allocator(&store, &liveness, 7).with_options(AllocatorOptions {
            max_probes: 64,
            ..AllocatorOptions::default()
        });

        let mut seen = HashSet::new();
        for pod in ["a", "b", "c"] {
            let allocation = allocator.allocate("ns", pod).unwrap();
            assert_ne!(allocation.ip(), ip("10.0.0.1"));
            assert!(seen.insert(allocation.ip()), "duplicate address handed out");
        }

        let err = allocator.allocate("ns", "d").unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { attempts: 64, .. }));
        assert_eq!(store.writes(), 3);
    }

    fn dead_pod_pool() -> Pool {
        let mut p = pool("10.0.0.0/31", 31);
        p.reserve_dynamic("old", "a", ip("10.0.0.0"));
        p.reserve_dynamic("old", "b", ip("10.0.0.1"));
        p
    }

    fn assert_reclaimed(reclaim: ReclaimMode) {
        let store = MemoryStore::new(dead_pod_pool());
        let liveness = MemoryLiveness::new();
        let mut allocator = allocator(&store, &liveness, 8).with_options(AllocatorOptions {
            reclaim,
            ..AllocatorOptions::default()
        });

        let allocation = allocator.allocate("new", "c").unwrap();
        assert_eq!(liveness.queries(), 1);

        let stored = store.pool();
        let holder = stored.holder_of(&allocation.ip()).unwrap();
        assert!(holder.is("new", "c"));
        assert_eq!(stored.existing_reservation("new", "c"), Some(allocation.ip()));
        // The dead pod's entry is gone, the other dead pod is untouched
        assert_eq!(stored.dynamic_reservations().unwrap().len(), 2);
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn test_reclaims_dead_pod_address() {
        assert_reclaimed(ReclaimMode::Accept);
    }

    #[test]
    fn test_reclaims_dead_pod_address_after_reevaluation() {
        assert_reclaimed(ReclaimMode::Reevaluate);
    }

    #[test]
    fn test_live_holders_are_not_reclaimed() {
        let store = MemoryStore::new(dead_pod_pool());
        let liveness = MemoryLiveness::new().with_pod("old", "a").with_pod("old", "b");
        let mut allocator = allocator(&store, &liveness, 9).with_options(AllocatorOptions {
            max_probes: 16,
            ..AllocatorOptions::default()
        });

        let err = allocator.allocate("new", "c").unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { .. }));
        assert_eq!(liveness.queries(), 16);
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn test_static_holders_are_not_reclaimed() {
        let mut statics = ReservationTable::new();
        statics.reserve("ops", "a", ip("10.0.0.0"));
        statics.reserve("ops", "b", ip("10.0.0.1"));
        let store = MemoryStore::new(pool("10.0.0.0/31", 31).with_static_reservations(statics));
        let liveness = MemoryLiveness::new();
        let mut allocator = allocator(&store, &liveness, 10).with_options(AllocatorOptions {
            max_probes: 16,
            ..AllocatorOptions::default()
        });

        assert!(matches!(
            allocator.allocate("new", "c"),
            Err(Error::PoolExhausted { .. })
        ));
        assert_eq!(liveness.queries(), 0);
    }

    #[test]
    fn test_liveness_failure_propagates() {
        let store = MemoryStore::new(dead_pod_pool());
        let liveness = MemoryLiveness::broken();
        let mut allocator = allocator(&store, &liveness, 11);

        assert!(matches!(
            allocator.allocate("new", "c"),
            Err(Error::LivenessQuery(_))
        ));
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn test_store_failure_is_not_conflict() {
        let store = MemoryStore::new(pool("10.2.3.64/28", 27)).with_broken_writes();
        let liveness = MemoryLiveness::new();
        let mut allocator = allocator(&store, &liveness, 12);

        let err = allocator.allocate("ns1", "pod1").unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_invalid_pool_rejected_before_mutation() {
        let store = MemoryStore::new(pool("2001:db8::/65", 70));
        let liveness = MemoryLiveness::new();
        let mut allocator = allocator(&store, &liveness, 13);

        assert!(matches!(
            allocator.allocate("ns1", "pod1"),
            Err(Error::Validation(_))
        ));
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn test_lookup() {
        let store = MemoryStore::new(pool("10.2.3.64/28", 27).with_gateway(Some(ip("10.2.3.65"))));
        let liveness = MemoryLiveness::new();
        let mut allocator = allocator(&store, &liveness, 14);

        assert_eq!(allocator.lookup("ns1", "pod1").unwrap(), None);
        let allocation = allocator.allocate("ns1", "pod1").unwrap();
        assert_eq!(allocator.lookup("ns1", "pod1").unwrap(), Some(allocation));
    }

    #[test]
    fn test_stale_snapshot_conflicts() {
        let store = MemoryStore::new(pool("10.0.0.0/24", 24));

        let a = store.fetch("sample").unwrap();
        let b = store.fetch("sample").unwrap();
        assert_eq!(a.version, b.version);

        let mut pool_a = a.pool;
        pool_a.reserve_dynamic("ns", "a", ip("10.0.0.10"));
        store.write_status("sample", &pool_a, &a.version).unwrap();

        let mut pool_b = b.pool;
        pool_b.reserve_dynamic("ns", "b", ip("10.0.0.10"));
        let err = store.write_status("sample", &pool_b, &b.version).unwrap_err();
        assert!(err.is_conflict());

        let fresh = store.fetch("sample").unwrap();
        assert_ne!(fresh.version, b.version);
        assert!(fresh.pool.is_reserved(&ip("10.0.0.10")));
    }

    /// Lets another writer win the race right before the first write
    struct Interloper<'a> {
        inner: &'a MemoryStore,
        fired: Cell<bool>,
    }

    impl PoolStore for Interloper<'_> {
        fn fetch(&self, pool_name: &str) -> Result<PoolSnapshot> {
            self.inner.fetch(pool_name)
        }

        fn write_status(&self, pool_name: &str, pool: &Pool, version: &ResourceVersion) -> Result<()> {
            if !self.fired.replace(true) {
                let PoolSnapshot { pool: mut other, version: current } = self.inner.fetch(pool_name)?;
                other.reserve_dynamic("ns2", "winner", ip("10.0.0.5"));
                self.inner.write_status(pool_name, &other, &current)?;
            }
            self.inner.write_status(pool_name, pool, version)
        }
    }

    #[test]
    fn test_lost_race_retries_from_fresh_snapshot() {
        let store = MemoryStore::new(pool("10.0.0.0/24", 24));
        let interloper = Interloper {
            inner: &store,
            fired: Cell::new(false),
        };
        let liveness = MemoryLiveness::new().with_pod("ns2", "winner");
        let mut allocator =
            Allocator::new(&interloper, &liveness, "sample").with_rng(StdRng::seed_from_u64(15));

        let err = allocator.allocate("ns1", "loser").unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.pool().existing_reservation("ns1", "loser"), None);

        let allocation = allocator.allocate("ns1", "loser").unwrap();
        assert_ne!(allocation.ip(), ip("10.0.0.5"));

        let stored = store.pool();
        assert_eq!(stored.existing_reservation("ns2", "winner"), Some(ip("10.0.0.5")));
        assert_eq!(stored.existing_reservation("ns1", "loser"), Some(allocation.ip()));
        assert_eq!(store.writes(), 2);
    }
}
