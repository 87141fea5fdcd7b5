//
// SPDX-License-Identifier: MIT
// See LICENSE for details
//! The source catalog: one stable tag per logical file stream.
//!
//! Tags come in three shapes and the shape is the identity used everywhere
//! downstream (buffers, fragments, the merged result):
//!
//! - `proc_<name>` for a global `/proc/<name>` file,
//! - `node<N>_sys_<name>` for `/sys/devices/system/node/node<N>/<name>`,
//! - `<pid>_proc_<name>` for `/proc/<pid>/<name>`.
//!
//! Hugepage pool files use the extended shape `numa<N>_sys_<file>_<size>`
//! and live in a separate collect-once table; they deliberately do not
//! classify as time-series tags.
use std::path::PathBuf;

use log::warn;

use crate::collector::parsers::{separator_for, Separator};
use crate::config::metric_spec::MetricSpec;

const SYS_NODE_DIR: &str = "/sys/devices/system/node";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Proc,
    NodeSys,
    PidProc,
}

/// Classify a top-level result key by tag shape. Anything that does not
/// match one of the three shapes (run metadata, hugepage one-shots) is not
/// a time-series tag.
pub fn classify(tag: &str) -> Option<TagKind> {
    if let Some(rest) = tag.strip_prefix("proc_") {
        if !rest.is_empty() {
            return Some(TagKind::Proc);
        }
    }
    if let Some(rest) = tag.strip_prefix("node") {
        if let Some((node, file)) = rest.split_once("_sys_") {
            if !node.is_empty() && node.chars().all(|c| c.is_ascii_digit()) && !file.is_empty() {
                return Some(TagKind::NodeSys);
            }
        }
    }
    if let Some((pid, file)) = tag.split_once("_proc_") {
        if !pid.is_empty() && pid.chars().all(|c| c.is_ascii_digit()) && !file.is_empty() {
            return Some(TagKind::PidProc);
        }
    }
    None
}

/// The numeric pid of a `<pid>_proc_<name>` tag.
pub fn tag_pid(tag: &str) -> Option<i64> {
    let (pid, _) = tag.split_once("_proc_")?;
    pid.parse().ok()
}

pub fn proc_tag(name: &str) -> String {
    format!("proc_{}", name)
}

pub fn proc_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{}", name))
}

pub fn node_sys_tag(node: u32, name: &str) -> String {
    format!("node{}_sys_{}", node, name)
}

pub fn node_sys_path(node: u32, name: &str) -> PathBuf {
    PathBuf::from(format!("{}/node{}/{}", SYS_NODE_DIR, node, name))
}

pub fn pid_proc_tag(pid: i32, name: &str) -> String {
    format!("{}_proc_{}", pid, name)
}

pub fn pid_proc_path(pid: i32, name: &str) -> PathBuf {
    PathBuf::from(format!("/proc/{}/{}", pid, name))
}

pub fn hugepage_tag(node: u32, file: &str, size: &str) -> String {
    format!("numa{}_sys_{}_{}", node, file, size)
}

pub fn hugepage_path(node: u32, file: &str, size: &str) -> PathBuf {
    PathBuf::from(format!(
        "{}/node{}/hugepages/hugepages-{}/{}",
        SYS_NODE_DIR, node, size, file
    ))
}

#[derive(Debug, Clone)]
pub enum GlobalKind {
    ProcStat,
    ProcGeneric { base: String, separator: Separator },
    NodeGeneric {
        node: u32,
        base: String,
        separator: Separator,
    },
}

/// One periodically sampled global file.
#[derive(Debug, Clone)]
pub struct GlobalSource {
    pub tag: String,
    pub path: PathBuf,
    pub kind: GlobalKind,
}

#[derive(Debug, Clone)]
pub enum PidKind {
    Stat,
    Statm,
    Generic(Separator),
}

/// A per-pid file template; concrete tags are expanded per tick from the
/// tracker's current snapshot.
#[derive(Debug, Clone)]
pub struct PidTemplate {
    pub file: String,
    pub kind: PidKind,
}

pub struct SourceCatalog {
    pub global: Vec<GlobalSource>,
    /// Hugepage files read exactly once at run start.
    pub once: Vec<(String, PathBuf)>,
    pub pid_templates: Vec<PidTemplate>,
}

impl SourceCatalog {
    /// Built once at run start from the metric spec. `sys` entries expand
    /// over every NUMA node; files with no known parser are dropped with a
    /// warning instead of failing the run.
    pub fn build(spec: &MetricSpec, numa_nodes: u32) -> Self {
        let mut global = Vec::new();
        let mut once = Vec::new();

        for node in 0..numa_nodes {
            for size in &spec.hugepages.sizes {
                for file in &spec.hugepages.files {
                    once.push((hugepage_tag(node, file, size), hugepage_path(node, file, size)));
                }
            }
            for file in spec.sys.keys() {
                match separator_for(file) {
                    Some(separator) => global.push(GlobalSource {
                        tag: node_sys_tag(node, file),
                        path: node_sys_path(node, file),
                        kind: GlobalKind::NodeGeneric {
                            node,
                            base: file.clone(),
                            separator,
                        },
                    }),
                    None => warn!("No parser for node file {}, skipping", file),
                }
            }
        }

        for file in spec.proc.keys() {
            let kind = if file == "stat" {
                GlobalKind::ProcStat
            } else {
                match separator_for(file) {
                    Some(separator) => GlobalKind::ProcGeneric {
                        base: file.clone(),
                        separator,
                    },
                    None => {
                        warn!("No parser for /proc/{}, skipping", file);
                        continue;
                    }
                }
            };
            global.push(GlobalSource {
                tag: proc_tag(file),
                path: proc_path(file),
                kind,
            });
        }

        let mut pid_templates = Vec::new();
        for file in spec.pid.keys() {
            let kind = match file.as_str() {
                "stat" => PidKind::Stat,
                "statm" => PidKind::Statm,
                _ => match separator_for(file) {
                    Some(separator) => PidKind::Generic(separator),
                    None => {
                        warn!("No parser for /proc/<pid>/{}, skipping", file);
                        continue;
                    }
                },
            };
            pid_templates.push(PidTemplate {
                file: file.clone(),
                kind,
            });
        }

        Self {
            global,
            once,
            pid_templates,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("proc_meminfo", Some(TagKind::Proc))]
    #[case("proc_smaps_rollup", Some(TagKind::Proc))]
    #[case("node0_sys_numastat", Some(TagKind::NodeSys))]
    #[case("node12_sys_vmstat", Some(TagKind::NodeSys))]
    #[case("4242_proc_stat", Some(TagKind::PidProc))]
    #[case("4242_proc_smaps_rollup", Some(TagKind::PidProc))]
    #[case("numa0_sys_nr_hugepages_2048kB", None)]
    #[case("timestamps", None)]
    #[case("system configuration", None)]
    #[case("proc_", None)]
    #[case("nodeX_sys_meminfo", None)]
    #[case("pid_proc_stat", None)]
    fn tag_classification(#[case] tag: &str, #[case] expected: Option<TagKind>) {
        assert_eq!(classify(tag), expected);
    }

    #[test]
    fn tag_and_path_shapes() {
        assert_eq!(proc_tag("meminfo"), "proc_meminfo");
        assert_eq!(proc_path("meminfo"), PathBuf::from("/proc/meminfo"));
        assert_eq!(node_sys_tag(1, "numastat"), "node1_sys_numastat");
        assert_eq!(
            node_sys_path(1, "numastat"),
            PathBuf::from("/sys/devices/system/node/node1/numastat")
        );
        assert_eq!(pid_proc_tag(77, "statm"), "77_proc_statm");
        assert_eq!(pid_proc_path(77, "statm"), PathBuf::from("/proc/77/statm"));
        assert_eq!(
            hugepage_tag(0, "nr_hugepages", "2048kB"),
            "numa0_sys_nr_hugepages_2048kB"
        );
        assert_eq!(
            hugepage_path(0, "nr_hugepages", "2048kB"),
            PathBuf::from("/sys/devices/system/node/node0/hugepages/hugepages-2048kB/nr_hugepages")
        );
        assert_eq!(tag_pid("4242_proc_stat"), Some(4242));
        assert_eq!(tag_pid("proc_stat"), None);
    }

    #[test]
    fn build_expands_nodes_and_one_shots() {
        let spec = MetricSpec::default();
        let catalog = SourceCatalog::build(&spec, 2);

        // Three node files per node plus three global proc files.
        assert_eq!(catalog.global.len(), 2 * 3 + 3);
        // sizes x files x nodes one-shot hugepage readings.
        assert_eq!(catalog.once.len(), 2 * 2 * 3);
        assert_eq!(catalog.pid_templates.len(), 3);

        assert!(catalog.global.iter().any(|s| s.tag == "node1_sys_vmstat"));
        assert!(catalog
            .global
            .iter()
            .any(|s| matches!(s.kind, GlobalKind::ProcStat)));
        assert!(catalog
            .once
            .iter()
            .any(|(tag, _)| tag == "numa1_sys_free_hugepages_2048kB"));
    }

    #[test]
    fn unknown_files_are_dropped() {
        let mut spec = MetricSpec::default();
        spec.proc.insert(
            "interrupts".to_string(),
            crate::config::metric_spec::AllowList::All,
        );
        let catalog = SourceCatalog::build(&spec, 1);
        assert!(!catalog.global.iter().any(|s| s.tag == "proc_interrupts"));
    }
}
