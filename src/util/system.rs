//
// SPDX-License-Identifier: MIT
// See LICENSE for details
//! System topology and identity helpers.
//!
//! Everything here is read once per run from procfs / sysfs or via libc and
//! cached where the value cannot change while we are running.
use std::collections::BTreeSet;
use std::ffi::CStr;
use std::fs::{read_dir, read_to_string};
use std::path::Path;

use eyre::{eyre, Context, Result};
use lazy_static::lazy_static;
use log::warn;
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use super::cpulist::parse_kernel_cpu_list;

const SYS_NODE_DIR: &str = "/sys/devices/system/node";
const SYS_NET_DIR: &str = "/sys/class/net";
const PROC_CMDLINE: &str = "/proc/cmdline";

lazy_static! {
    static ref CPU_COUNT: usize = read_cpu_count();
    static ref NUMA_NODES: u32 = read_numa_node_count(Path::new(SYS_NODE_DIR));
}

pub fn cpu_count() -> usize {
    *CPU_COUNT
}

pub fn numa_node_count() -> u32 {
    *NUMA_NODES
}

fn read_cpu_count() -> usize {
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if count < 1 {
        1
    } else {
        count as usize
    }
}

/// Count `node<N>` directories under /sys/devices/system/node. Machines
/// without NUMA support expose no node directories and count as one node.
fn read_numa_node_count(node_dir: &Path) -> u32 {
    let nodes = match read_dir(node_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.strip_prefix("node")
                    .map(|suffix| !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
            .count() as u32,
        Err(_) => 0,
    };
    nodes.max(1)
}

/// The cpus belonging to one NUMA node, from the node's `cpulist` file.
pub fn node_cpu_list(node: u32) -> Result<BTreeSet<u32>> {
    let path = format!("{}/node{}/cpulist", SYS_NODE_DIR, node);
    let contents = read_to_string(&path).wrap_err_with(|| eyre!("Unable to read {}", path))?;
    parse_kernel_cpu_list(&contents)
}

/// Pin the calling process (and every thread it spawns afterwards) to the
/// given cpu set.
pub fn set_cpu_affinity(cpus: &BTreeSet<u32>) -> Result<()> {
    let mut set = CpuSet::new();
    for cpu in cpus {
        set.set(*cpu as usize)
            .wrap_err_with(|| eyre!("Cpu {} not representable in affinity mask", cpu))?;
    }
    sched_setaffinity(Pid::from_raw(0), &set).wrap_err("Unable to set cpu affinity")?;
    Ok(())
}

pub fn pid_exists(pid: i32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

struct UnameInfo {
    sysname: String,
    nodename: String,
    release: String,
    machine: String,
}

fn uname_info() -> Result<UnameInfo> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return Err(eyre!("uname() failed"));
    }
    fn field(raw: &[libc::c_char]) -> String {
        unsafe { CStr::from_ptr(raw.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
    Ok(UnameInfo {
        sysname: field(&uts.sysname),
        nodename: field(&uts.nodename),
        release: field(&uts.release),
        machine: field(&uts.machine),
    })
}

fn network_interfaces() -> Vec<String> {
    match read_dir(SYS_NET_DIR) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// One-shot record of the machine the run happened on, stored in the first
/// fragment and carried unchanged into the merged result.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SystemConfiguration {
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "Kernel Release")]
    pub kernel_release: String,
    #[serde(rename = "cpu count")]
    pub cpu_count: usize,
    #[serde(rename = "NUMA Nodes")]
    pub numa_nodes: u32,
    #[serde(rename = "Operating System")]
    pub operating_system: String,
    #[serde(rename = "Processor Architecture")]
    pub architecture: String,
    #[serde(rename = "Network interfaces")]
    pub network_interfaces: Vec<String>,
    #[serde(rename = "cmdline")]
    pub cmdline: String,
}

impl SystemConfiguration {
    pub fn collect() -> Self {
        let uname = match uname_info() {
            Ok(uname) => uname,
            Err(e) => {
                warn!("Unable to read system identity: {}", e);
                UnameInfo {
                    sysname: String::new(),
                    nodename: String::new(),
                    release: String::new(),
                    machine: String::new(),
                }
            }
        };
        let cmdline = read_to_string(PROC_CMDLINE).unwrap_or_default();
        Self {
            hostname: uname.nodename,
            kernel_release: uname.release,
            cpu_count: cpu_count(),
            numa_nodes: numa_node_count(),
            operating_system: uname.sysname,
            architecture: uname.machine,
            network_interfaces: network_interfaces(),
            cmdline,
        }
    }
}
