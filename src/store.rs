//! External collaborators of the allocator
//!
//! Provides:
//! - `PoolStore`: versioned read and conditional write of a named pool
//! - `PodLiveness`: whether a pod still exists
//! - A Kubernetes API implementation of both, configured from a kubeconfig
//!   or the in-cluster service account

pub mod kube;
pub mod kubeconfig;
#[cfg(test)]
pub mod memory;

pub use kube::{KubeClient, KubeConfig};

use crate::error::Result;
use crate::ipam::Pool;
use std::fmt;

/// Opaque version marker a pool was read at
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceVersion(String);

impl ResourceVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A pool together with the version it was read at
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub pool: Pool,
    pub version: ResourceVersion,
}

/// Versioned storage for pools
pub trait PoolStore {
    /// Read the current state of a pool
    fn fetch(&self, pool_name: &str) -> Result<PoolSnapshot>;

    /// Persist the pool's dynamic reservations
    ///
    /// Fails with `Error::Conflict` when the stored pool is no longer at
    /// `version`; the write then has no effect.
    fn write_status(&self, pool_name: &str, pool: &Pool, version: &ResourceVersion) -> Result<()>;
}

/// Lookup of running pods
pub trait PodLiveness {
    fn exists(&self, namespace: &str, pod: &str) -> Result<bool>;
}

impl<T: PoolStore + ?Sized> PoolStore for &T {
    fn fetch(&self, pool_name: &str) -> Result<PoolSnapshot> {
        (**self).fetch(pool_name)
    }

    fn write_status(&self, pool_name: &str, pool: &Pool, version: &ResourceVersion) -> Result<()> {
        (**self).write_status(pool_name, pool, version)
    }
}

impl<T: PodLiveness + ?Sized> PodLiveness for &T {
    fn exists(&self, namespace: &str, pod: &str) -> Result<bool> {
        (**self).exists(namespace, pod)
    }
}
