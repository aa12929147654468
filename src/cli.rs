//! Command-line interface for pod-ipam
//!
//! The container runtime drives the plugin through `CNI_*` environment
//! variables; every one of them can also be passed as a flag.

use clap::{Parser, ValueEnum};

/// pod-ipam - sticky per-pod addresses from a Kubernetes IPPool
#[derive(Parser, Debug)]
#[command(name = "pod-ipam")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Operation requested by the runtime
    #[arg(long, env = "CNI_COMMAND", value_enum, ignore_case = true)]
    pub command: CniCommand,

    /// Container ID
    #[arg(long, env = "CNI_CONTAINERID")]
    pub container_id: Option<String>,

    /// Path to the container's network namespace
    #[arg(long, env = "CNI_NETNS")]
    pub netns: Option<String>,

    /// Interface name inside the container
    #[arg(long, env = "CNI_IFNAME")]
    pub ifname: Option<String>,

    /// Extra `KEY=VALUE;...` arguments carrying the pod identity
    #[arg(long, env = "CNI_ARGS", default_value = "")]
    pub args: String,

    /// Plugin search path
    #[arg(long, env = "CNI_PATH")]
    pub path: Option<String>,
}

/// CNI operations
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[value(rename_all = "UPPER")]
pub enum CniCommand {
    /// Allocate an address for the pod
    Add,
    /// Release the pod's address
    Del,
    /// Verify the pod still holds its address
    Check,
    /// Report supported CNI versions
    Version,
}

impl Cli {
    /// Parse command line arguments and environment
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
