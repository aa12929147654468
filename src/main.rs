//! pod-ipam - CNI IPAM plugin backed by a Kubernetes IPPool
//!
//! Pods get a random free address from the pool on first launch and the
//! same address on every relaunch. Addresses of pods that no longer exist
//! are reclaimed.

mod cli;
mod cni;
mod error;
mod ipam;
mod retry;
mod store;

use cli::{Cli, CniCommand};
use error::{Error, Result};
use ipam::Allocator;
use log::{debug, error, info};
use serde::Serialize;
use std::io::{self, Read, Write};
use store::KubeClient;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse_args();
    let mut cni_version = cni::DEFAULT_VERSION.to_string();
    if let Err(e) = run(&cli, &mut cni_version) {
        error!("{:?} failed: {}", cli.command, e);
        // The runtime reads the failure from stdout
        report_failure(io::stdout().lock(), &cni_version, &e);
        std::process::exit(1);
    }
}

fn run(cli: &Cli, cni_version: &mut String) -> Result<()> {
    if cli.command == CniCommand::Version {
        return print_json(&cni::VersionInfo::current());
    }

    let mut stdin = Vec::new();
    io::stdin().read_to_end(&mut stdin)?;
    let conf = cni::parse_config(&stdin)?;
    *cni_version = conf.result_version().to_string();
    let ipam_conf = conf.ipam()?;

    let pod = cni::parse_pod_args(&cli.args)?;
    debug!(
        "{:?} on network '{}' via {} for pod {}/{} (container {:?}, ifname {:?}, netns {:?}, path {:?})",
        cli.command,
        conf.name,
        ipam_conf.plugin_type,
        pod.namespace,
        pod.name,
        cli.container_id,
        cli.ifname,
        cli.netns,
        cli.path
    );

    let client = KubeClient::new(&ipam_conf.connection())?;
    let mut allocator = Allocator::new(&client, &client, ipam_conf.ip_pool_name.clone())
        .with_options(ipam_conf.allocator.clone());

    match cli.command {
        CniCommand::Add => {
            let allocation = retry::on_conflict(&ipam_conf.retry, || {
                allocator.allocate(&pod.namespace, &pod.name)
            })?;
            info!(
                "Assigned {} to pod {}/{} from pool '{}'",
                allocation.address,
                pod.namespace,
                pod.name,
                allocator.pool_name()
            );

            let mut result = cni::IpamResult::new(conf.result_version());
            result.add_allocation(&allocation);
            print_json(&result)
        }
        CniCommand::Del => {
            retry::on_conflict(&ipam_conf.retry, || allocator.free(&pod.namespace, &pod.name))?;
            info!(
                "Released address of pod {}/{} in pool '{}'",
                pod.namespace,
                pod.name,
                allocator.pool_name()
            );
            print_json(&cni::IpamResult::new(conf.result_version()))
        }
        CniCommand::Check => match allocator.lookup(&pod.namespace, &pod.name)? {
            Some(allocation) => {
                debug!("Pod {}/{} holds {}", pod.namespace, pod.name, allocation.address);
                Ok(())
            }
            None => Err(Error::NoReservation {
                pool: allocator.pool_name().to_string(),
                namespace: pod.namespace.clone(),
                pod: pod.name.clone(),
            }),
        },
        CniCommand::Version => print_json(&cni::VersionInfo::current()),
    }
}

fn report_failure<W: Write>(out: W, cni_version: &str, err: &Error) {
    if let Err(print_err) = write_json(out, &cni::ErrorResult::new(cni_version, err)) {
        error!("Unable to report failure to the runtime: {}", print_err);
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    write_json(io::stdout().lock(), value)
}

fn write_json<W: Write, T: Serialize>(mut out: W, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}
