//! CNI plugin protocol types
//!
//! Provides:
//! - Network configuration parsing (stdin)
//! - `CNI_ARGS` parsing into a pod identity
//! - The IPAM result, version and error documents (stdout)

use crate::error::{Error, Result};
use crate::ipam::{Allocation, AllocatorOptions};
use crate::retry::RetryConfig;
use crate::store::KubeConfig;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

/// CNI spec versions this plugin can produce results for
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0"];

/// Result version used when the configuration doesn't name one
pub const DEFAULT_VERSION: &str = "0.4.0";

/// Network configuration handed to the plugin
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    #[serde(default)]
    pub cni_version: String,

    #[serde(default)]
    pub name: String,

    pub ipam: Option<IpamConf>,
}

impl NetConf {
    /// Version results are reported in
    pub fn result_version(&self) -> &str {
        if self.cni_version.is_empty() {
            DEFAULT_VERSION
        } else {
            &self.cni_version
        }
    }

    /// Validated IPAM section
    pub fn ipam(&self) -> Result<&IpamConf> {
        self.ipam
            .as_ref()
            .ok_or_else(|| Error::Config("network configuration has no ipam section".into()))
    }

    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_VERSIONS.contains(&self.result_version()) {
            return Err(Error::UnsupportedVersion(self.cni_version.clone()));
        }

        let ipam = self.ipam()?;
        if ipam.ip_pool_name.trim().is_empty() {
            return Err(Error::Config(
                "an ip pool name is required for this ip allocator".into(),
            ));
        }

        Ok(())
    }
}

/// The plugin's own section of the network configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamConf {
    #[serde(rename = "type", default)]
    pub plugin_type: String,

    /// Name of the IPPool resource to allocate from
    #[serde(default)]
    pub ip_pool_name: String,

    /// Kubeconfig file for the API server connection
    pub kube_config: Option<PathBuf>,

    #[serde(default)]
    pub kubernetes: KubeConfig,

    #[serde(default)]
    pub allocator: AllocatorOptions,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl IpamConf {
    /// API server connection settings, `kubeConfig` included
    pub fn connection(&self) -> KubeConfig {
        let mut config = self.kubernetes.clone();
        if config.kubeconfig.is_none() {
            config.kubeconfig = self.kube_config.clone();
        }
        config
    }
}

/// Parse and validate the network configuration
pub fn parse_config(stdin: &[u8]) -> Result<NetConf> {
    let conf: NetConf = serde_json::from_slice(stdin)?;
    conf.validate()?;
    Ok(conf)
}

/// Pod a CNI call is made for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

/// Extract the pod identity from `CNI_ARGS`
///
/// Arguments are `;`-separated `KEY=VALUE` pairs; anything else is ignored.
pub fn parse_pod_args(args: &str) -> Result<PodRef> {
    let mut namespace = None;
    let mut name = None;

    for arg in args.split(';') {
        let parts: Vec<&str> = arg.split('=').collect();
        if let [key, value] = parts.as_slice() {
            match *key {
                "K8S_POD_NAMESPACE" => namespace = Some(value.to_string()),
                "K8S_POD_NAME" => name = Some(value.to_string()),
                _ => {}
            }
        }
    }

    let namespace = namespace
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| Error::InvalidArgs("no K8S_POD_NAMESPACE provided in CNI_ARGS".into()))?;
    let name = name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::InvalidArgs("no K8S_POD_NAME provided in CNI_ARGS".into()))?;

    Ok(PodRef { namespace, name })
}

/// IPAM result document
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamResult {
    pub cni_version: String,
    pub ips: Vec<IpConfig>,
    pub routes: Vec<Route>,
    pub dns: Dns,
}

#[derive(Debug, Clone, Serialize)]
pub struct IpConfig {
    /// "4" or "6"
    pub version: String,
    /// Address in CIDR notation
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Route {
    pub dst: String,
    pub gw: IpAddr,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Dns {}

impl IpamResult {
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            ips: Vec::new(),
            routes: Vec::new(),
            dns: Dns::default(),
        }
    }

    /// Add an allocated address, plus a default route when it has a gateway
    pub fn add_allocation(&mut self, allocation: &Allocation) {
        let version = match allocation.ip() {
            IpAddr::V4(_) => "4",
            IpAddr::V6(_) => "6",
        };

        if let Some(gw) = allocation.gateway {
            let dst = match gw {
                IpAddr::V4(_) => "0.0.0.0/0",
                IpAddr::V6(_) => "::/0",
            };
            self.routes.push(Route {
                dst: dst.to_string(),
                gw,
            });
        }

        self.ips.push(IpConfig {
            version: version.to_string(),
            address: allocation.address.to_string(),
            gateway: allocation.gateway,
        });
    }
}

/// Reply to the VERSION command
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub cni_version: String,
    pub supported_versions: Vec<String>,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            cni_version: DEFAULT_VERSION.to_string(),
            supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

/// Error document printed when a command fails
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResult {
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
}

impl ErrorResult {
    pub fn new(cni_version: &str, err: &Error) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            code: error_code(err),
            msg: err.to_string(),
        }
    }
}

/// Well-known CNI error codes; plugin-specific failures use 100 and up
fn error_code(err: &Error) -> u32 {
    match err {
        Error::UnsupportedVersion(_) => 1,
        Error::InvalidArgs(_) => 4,
        Error::Io(_) => 5,
        Error::Json(_) => 6,
        Error::Config(_) | Error::Validation(_) => 7,
        Error::Conflict { .. } => 11,
        Error::PoolExhausted { .. } => 101,
        Error::NoReservation { .. } => 102,
        Error::Store(_) | Error::LivenessQuery(_) => 100,
    }
}
