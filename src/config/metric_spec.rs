//
// SPDX-License-Identifier: MIT
// See LICENSE for details
//! The collector input spec: which pseudo-files to sample and which metrics
//! to keep from each.
//!
//! The spec is a JSON document with one table per source family:
//!
//! ```json
//! {
//!     "proc": { "meminfo": "all", "vmstat": "pgfault,pgmajfault" },
//!     "sys": { "numastat": "all" },
//!     "pid": { "stat": "all", "statm": "all" },
//!     "hugepages": { "sizes": "2048kB", "files": "nr_hugepages,free_hugepages" }
//! }
//! ```
//!
//! `proc` entries are global `/proc/<name>` files, `sys` entries are
//! expanded per NUMA node under `/sys/devices/system/node/node<N>/`, and
//! `pid` entries are expanded per tracked process under `/proc/<pid>/`.
//! Each entry carries a metric allow-list: the sentinel `all`, or a
//! comma-separated list of metric base names.
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use eyre::{eyre, Context, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const ALL_METRICS: &str = "all";

/// Which metrics of one file survive parsing. The check always applies to
/// the base metric name, before any pid or node prefix is attached.
#[derive(Debug, Clone, PartialEq)]
pub enum AllowList {
    All,
    Metrics(BTreeSet<String>),
}

impl AllowList {
    pub fn allows(&self, base_metric: &str) -> bool {
        match self {
            AllowList::All => true,
            AllowList::Metrics(metrics) => metrics.contains(base_metric),
        }
    }
}

impl Serialize for AllowList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AllowList::All => serializer.serialize_str(ALL_METRICS),
            AllowList::Metrics(metrics) => {
                serializer.serialize_str(&metrics.iter().cloned().collect::<Vec<_>>().join(","))
            }
        }
    }
}

impl<'de> Deserialize<'de> for AllowList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == ALL_METRICS {
            return Ok(AllowList::All);
        }
        let metrics: BTreeSet<String> = trimmed
            .split(',')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if metrics.is_empty() {
            return Err(D::Error::custom(format!("empty metric list: {:?}", raw)));
        }
        Ok(AllowList::Metrics(metrics))
    }
}

mod comma_list {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&values.join(","))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(raw
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect())
    }
}

/// Hugepage pool counters are sampled exactly once per run: their values do
/// not move at sampling rates.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HugepageSpec {
    #[serde(with = "comma_list", default = "default_hugepage_sizes")]
    pub sizes: Vec<String>,
    #[serde(with = "comma_list", default = "default_hugepage_files")]
    pub files: Vec<String>,
}

impl Default for HugepageSpec {
    fn default() -> Self {
        Self {
            sizes: default_hugepage_sizes(),
            files: default_hugepage_files(),
        }
    }
}

fn default_hugepage_sizes() -> Vec<String> {
    // 1GB and 2MB pools
    vec!["1048576kB".to_string(), "2048kB".to_string()]
}

fn default_hugepage_files() -> Vec<String> {
    vec![
        "nr_hugepages".to_string(),
        "surplus_hugepages".to_string(),
        "free_hugepages".to_string(),
    ]
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MetricSpec {
    #[serde(default = "default_proc_files")]
    pub proc: BTreeMap<String, AllowList>,
    #[serde(default = "default_node_files")]
    pub sys: BTreeMap<String, AllowList>,
    #[serde(default = "default_pid_files")]
    pub pid: BTreeMap<String, AllowList>,
    #[serde(default)]
    pub hugepages: HugepageSpec,
}

impl Default for MetricSpec {
    fn default() -> Self {
        Self {
            proc: default_proc_files(),
            sys: default_node_files(),
            pid: default_pid_files(),
            hugepages: HugepageSpec::default(),
        }
    }
}

fn all_of(files: &[&str]) -> BTreeMap<String, AllowList> {
    files
        .iter()
        .map(|f| (f.to_string(), AllowList::All))
        .collect()
}

fn default_proc_files() -> BTreeMap<String, AllowList> {
    all_of(&["meminfo", "stat", "vmstat"])
}

fn default_node_files() -> BTreeMap<String, AllowList> {
    all_of(&["meminfo", "numastat", "vmstat"])
}

fn default_pid_files() -> BTreeMap<String, AllowList> {
    all_of(&["stat", "statm", "status"])
}

const ALLOW_ALL: AllowList = AllowList::All;

impl MetricSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .wrap_err_with(|| eyre!("Unable to read metric spec {}", path.display()))?;
        serde_json::from_reader(BufReader::new(file))
            .wrap_err_with(|| eyre!("Unable to parse metric spec {}", path.display()))
    }

    pub fn proc_allow(&self, base: &str) -> &AllowList {
        self.proc.get(base).unwrap_or(&ALLOW_ALL)
    }

    pub fn sys_allow(&self, base: &str) -> &AllowList {
        self.sys.get(base).unwrap_or(&ALLOW_ALL)
    }

    pub fn pid_allow(&self, base: &str) -> &AllowList {
        self.pid.get(base).unwrap_or(&ALLOW_ALL)
    }

    /// A one-line record of what was collected, stored with the results.
    pub fn describe(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
