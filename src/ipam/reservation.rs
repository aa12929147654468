//! Reservation tables mapping pod identities to addresses
//!
//! Entries are keyed by the composite `(namespace, pod)` pair. On the wire
//! the table is the nested `namespace -> pod -> address` map the IPPool
//! resource uses; a namespace with no pods is never written out.

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

type Key = (String, String);

/// Table of `(namespace, pod) -> address` reservations
///
/// Keys are unique; addresses are not. Keeping an address held by a single
/// key is up to the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationTable {
    entries: BTreeMap<Key, IpAddr>,
}

impl ReservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `addr` for a pod, replacing any address it already held
    pub fn reserve(&mut self, namespace: &str, pod: &str, addr: IpAddr) {
        self.entries
            .insert((namespace.to_string(), pod.to_string()), addr);
    }

    /// Address reserved for a pod, if any
    pub fn lookup(&self, namespace: &str, pod: &str) -> Option<IpAddr> {
        self.entries
            .get(&(namespace.to_string(), pod.to_string()))
            .copied()
    }

    /// Pod holding `addr`
    ///
    /// When several pods hold the same address the one returned is
    /// unspecified.
    pub fn holder_of(&self, addr: &IpAddr) -> Option<(&str, &str)> {
        self.entries
            .iter()
            .find(|(_, held)| *held == addr)
            .map(|((namespace, pod), _)| (namespace.as_str(), pod.as_str()))
    }

    /// Drop a pod's reservation, returning the address it held
    pub fn release(&mut self, namespace: &str, pod: &str) -> Option<IpAddr> {
        self.entries
            .remove(&(namespace.to_string(), pod.to_string()))
    }

    #[allow(dead_code)]
    pub fn is_reserved(&self, addr: &IpAddr) -> bool {
        self.holder_of(addr).is_some()
    }

    /// True if any pod in `namespace` holds a reservation
    #[allow(dead_code)]
    pub fn contains_namespace(&self, namespace: &str) -> bool {
        self.entries.keys().any(|(ns, _)| ns == namespace)
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(namespace, pod, address)` in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, IpAddr)> {
        self.entries
            .iter()
            .map(|((namespace, pod), addr)| (namespace.as_str(), pod.as_str(), *addr))
    }
}

impl Serialize for ReservationTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut nested: BTreeMap<&str, BTreeMap<&str, IpAddr>> = BTreeMap::new();
        for (namespace, pod, addr) in self.iter() {
            nested.entry(namespace).or_default().insert(pod, addr);
        }
        nested.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ReservationTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let nested = Option::<BTreeMap<String, Option<BTreeMap<String, IpAddr>>>>::deserialize(
            deserializer,
        )?
        .unwrap_or_default();

        let mut table = ReservationTable::new();
        for (namespace, pods) in nested {
            for (pod, addr) in pods.unwrap_or_default() {
                table.reserve(&namespace, &pod, addr);
            }
        }
        Ok(table)
    }
}
