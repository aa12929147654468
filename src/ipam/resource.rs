//! Wire form of the IPPool custom resource
//!
//! The allocator only ever writes the status section back; spec fields are
//! carried through unchanged.

use crate::error::{Error, Result};
use crate::ipam::pool::Pool;
use crate::ipam::range::Range;
use crate::ipam::reservation::ReservationTable;
use crate::store::ResourceVersion;
use serde::{Deserialize, Deserializer, Serialize};
use std::net::IpAddr;

/// API group and version the IPPool resource is served under
pub const API_VERSION: &str = "k8s.pgc.umn.edu/v1alpha1";

pub const KIND: &str = "IPPool";

/// IPPool resource as exchanged with the API server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolResource {
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_kind")]
    pub kind: String,

    pub metadata: ObjectMeta,

    pub spec: PoolSpec,

    #[serde(default)]
    pub status: PoolStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Operator-authored pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// CIDR block addresses are drawn from
    pub range: String,

    /// Width of the subnet the range lives in
    #[serde(default)]
    pub netmask_bits: i32,

    #[serde(
        default,
        deserialize_with = "deserialize_gateway",
        skip_serializing_if = "Option::is_none"
    )]
    pub gateway: Option<IpAddr>,

    #[serde(default)]
    pub static_reservations: ReservationTable,
}

/// Allocator-owned state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    #[serde(
        rename = "DynamicReservations",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub dynamic_reservations: Option<ReservationTable>,
}

impl PoolResource {
    /// Build the validated pool described by this resource
    pub fn to_pool(&self) -> Result<Pool> {
        let range = Range::parse(&self.spec.range)?;
        let pool = Pool::new(range, self.spec.netmask_bits)
            .with_gateway(self.spec.gateway)
            .with_static_reservations(self.spec.static_reservations.clone())
            .with_dynamic_reservations(self.status.dynamic_reservations.clone());
        pool.validate()?;
        Ok(pool)
    }

    /// Version token the resource was read at
    pub fn version(&self) -> Result<ResourceVersion> {
        self.metadata
            .resource_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(ResourceVersion::new)
            .ok_or_else(|| {
                Error::Store(format!(
                    "IPPool '{}' has no resourceVersion",
                    self.metadata.name
                ))
            })
    }

    /// Resource carrying `pool` that is only accepted at `version`
    pub fn from_pool(name: &str, pool: &Pool, version: &ResourceVersion) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta {
                name: name.to_string(),
                resource_version: Some(version.as_str().to_string()),
            },
            spec: PoolSpec {
                range: pool.range().to_string(),
                netmask_bits: pool.netmask_bits(),
                gateway: pool.gateway(),
                static_reservations: pool.static_reservations().clone(),
            },
            status: PoolStatus {
                dynamic_reservations: pool.dynamic_reservations().cloned(),
            },
        }
    }
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    KIND.to_string()
}

/// Unset gateways arrive as `null` or as an empty string
fn deserialize_gateway<'de, D>(deserializer: D) -> std::result::Result<Option<IpAddr>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) if !s.trim().is_empty() => s
            .trim()
            .parse()
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}
