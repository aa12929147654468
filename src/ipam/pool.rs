//! IP pool model
//!
//! A pool combines:
//! - the allocation range random addresses are drawn from
//! - the netmask of the subnet the range lives in
//! - an implicitly reserved gateway
//! - operator-authored static reservations
//! - dynamic reservations written by the allocator

use crate::error::{Error, Result};
use crate::ipam::range::Range;
use crate::ipam::reservation::ReservationTable;
use ipnet::IpNet;
use rand::Rng;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Which table a reservation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationKind {
    Static,
    Dynamic,
}

/// The pod claiming an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Holder {
    pub namespace: String,
    pub pod: String,
    pub kind: ReservationKind,
}

impl Holder {
    fn new(namespace: &str, pod: &str, kind: ReservationKind) -> Self {
        Self {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            kind,
        }
    }

    /// True if this is the given pod's claim
    pub fn is(&self, namespace: &str, pod: &str) -> bool {
        self.namespace == namespace && self.pod == pod
    }
}

/// How many random bits feed a drawn address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Coverage {
    /// Every host bit of the range is randomized
    #[default]
    Full,
    /// Only the low 64 host bits are randomized. IPv6 ranges shorter
    /// than /64 never get addresses with the upper host bits set.
    Legacy64,
}

/// Address pool as stored in an IPPool resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    range: Range,
    netmask_bits: i32,
    gateway: Option<IpAddr>,
    static_reservations: ReservationTable,
    dynamic_reservations: Option<ReservationTable>,
}

impl Pool {
    /// Create an empty pool with no gateway
    pub fn new(range: Range, netmask_bits: i32) -> Self {
        Self {
            range,
            netmask_bits,
            gateway: None,
            static_reservations: ReservationTable::new(),
            dynamic_reservations: None,
        }
    }

    pub fn with_gateway(mut self, gateway: Option<IpAddr>) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_static_reservations(mut self, reservations: ReservationTable) -> Self {
        self.static_reservations = reservations;
        self
    }

    pub fn with_dynamic_reservations(mut self, reservations: Option<ReservationTable>) -> Self {
        self.dynamic_reservations = reservations;
        self
    }

    pub fn range(&self) -> &Range {
        &self.range
    }

    pub fn netmask_bits(&self) -> i32 {
        self.netmask_bits
    }

    pub fn gateway(&self) -> Option<IpAddr> {
        self.gateway
    }

    pub fn static_reservations(&self) -> &ReservationTable {
        &self.static_reservations
    }

    pub fn dynamic_reservations(&self) -> Option<&ReservationTable> {
        self.dynamic_reservations.as_ref()
    }

    /// The range's network address masked to the pool's netmask
    ///
    /// An out-of-range netmask is clamped; `validate` reports it.
    pub fn effective_network(&self) -> IpNet {
        let width = i32::from(self.range.address_family_bits());
        let bits = self.netmask_bits.clamp(0, width) as u8;
        match IpNet::new(self.range.network(), bits) {
            Ok(net) => net.trunc(),
            Err(_) => self.range.net(),
        }
    }

    /// Check the pool for obvious configuration errors
    pub fn validate(&self) -> Result<()> {
        let width = i32::from(self.range.address_family_bits());
        if self.netmask_bits < 0 || self.netmask_bits > width {
            return Err(Error::Validation(format!(
                "netmask /{} is invalid for range {}",
                self.netmask_bits, self.range
            )));
        }

        if self.netmask_bits > i32::from(self.range.prefix_len()) {
            return Err(Error::Validation(format!(
                "netmask /{} doesn't completely contain range {}, please adjust",
                self.netmask_bits, self.range
            )));
        }

        if let Some(gateway) = self.gateway {
            let network = self.effective_network();
            if !network.contains(&gateway) {
                return Err(Error::Validation(format!(
                    "gateway {} must be on subnet {} that includes range {}",
                    gateway, network, self.range
                )));
            }
        }

        Ok(())
    }

    /// True if `addr` lies in the pool's subnet
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.effective_network().contains(addr)
    }

    pub fn is_gateway(&self, addr: &IpAddr) -> bool {
        self.gateway.as_ref() == Some(addr)
    }

    /// Address already reserved for a pod, static reservations first
    ///
    /// Static reservations are returned even when they fall outside the pool.
    pub fn existing_reservation(&self, namespace: &str, pod: &str) -> Option<IpAddr> {
        self.static_reservations
            .lookup(namespace, pod)
            .or_else(|| {
                self.dynamic_reservations
                    .as_ref()
                    .and_then(|table| table.lookup(namespace, pod))
            })
    }

    /// The pod holding `addr`
    ///
    /// Addresses outside the pool and the gateway have no holder.
    pub fn holder_of(&self, addr: &IpAddr) -> Option<Holder> {
        if !self.contains(addr) || self.is_gateway(addr) {
            return None;
        }

        if let Some((namespace, pod)) = self.static_reservations.holder_of(addr) {
            return Some(Holder::new(namespace, pod, ReservationKind::Static));
        }

        self.dynamic_reservations
            .as_ref()
            .and_then(|table| table.holder_of(addr))
            .map(|(namespace, pod)| Holder::new(namespace, pod, ReservationKind::Dynamic))
    }

    /// True if `addr` is in the pool and is the gateway or held by a pod
    ///
    /// Addresses outside the pool are not reserved.
    pub fn is_reserved(&self, addr: &IpAddr) -> bool {
        if !self.contains(addr) {
            return false;
        }
        self.is_gateway(addr) || self.holder_of(addr).is_some()
    }

    /// Draw a random address from the allocation range
    ///
    /// Network bits of the range are kept, host bits are random. The
    /// result may be taken; callers check `is_reserved`.
    pub fn random_address<R: Rng>(&self, rng: &mut R, coverage: Coverage) -> IpAddr {
        let host_bits = u32::from(self.range.host_bits());
        let host_mask = if host_bits >= 128 {
            u128::MAX
        } else {
            (1u128 << host_bits) - 1
        };
        let drawn = match coverage {
            Coverage::Full => rng.random::<u128>(),
            Coverage::Legacy64 => u128::from(rng.random::<u64>()),
        };

        match self.range.network() {
            IpAddr::V4(network) => {
                let base = u128::from(u32::from(network));
                let addr = (base & !host_mask) | (drawn & host_mask);
                IpAddr::V4(Ipv4Addr::from(addr as u32))
            }
            IpAddr::V6(network) => {
                let base = u128::from(network);
                IpAddr::V6(Ipv6Addr::from((base & !host_mask) | (drawn & host_mask)))
            }
        }
    }

    /// Record a dynamic reservation
    pub fn reserve_dynamic(&mut self, namespace: &str, pod: &str, addr: IpAddr) {
        self.dynamic_reservations
            .get_or_insert_with(ReservationTable::new)
            .reserve(namespace, pod, addr);
    }

    /// Remove a pod's dynamic reservation, returning the freed address
    pub fn release_dynamic(&mut self, namespace: &str, pod: &str) -> Option<IpAddr> {
        self.dynamic_reservations
            .as_mut()
            .and_then(|table| table.release(namespace, pod))
    }
}
