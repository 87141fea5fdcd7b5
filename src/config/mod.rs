//
// SPDX-License-Identifier: MIT
// See LICENSE for details
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use eyre::{eyre, Result};

use crate::util::cpulist::parse_affinity_list;

pub use self::metric_spec::{AllowList, HugepageSpec, MetricSpec, ALL_METRICS};

pub mod metric_spec;

pub const DEFAULT_SAMPLE_PERIOD: f64 = 5.0;
pub const DEFAULT_NR_SAMPLES: u64 = 10;
pub const DEFAULT_FLUSH_LIMIT: usize = 13_545_880;
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_OUTPUT_FILE_NAME: &str = "results";
pub const PID_BATCH_SIZE: usize = 1000;

/// Immutable run configuration. Built once by the CLI layer and passed
/// explicitly into the run controller, which threads it through the
/// sampler, tracker and aggregator.
#[derive(Debug, Clone)]
pub struct Config {
    pub metric_spec: MetricSpec,
    pub pid: Option<i32>,
    pub workload: Option<String>,
    pub ignore_children: bool,
    pub ignore_threads: bool,
    pub keep_workload_alive: bool,
    pub nr_samples: Option<u64>,
    pub delay: Duration,
    pub sample_period: f64,
    pub output_file_name: String,
    pub cpu_affinity: BTreeSet<u32>,
    pub flush_limit: usize,
    pub batch_size: usize,
    pub ignore_workload_logs: bool,
    /// Directory owned by this run; fragments and results live here.
    pub run_dir: PathBuf,
    pub csv_result: bool,
    pub ignore_offset: bool,
    pub cpu_count: usize,
    pub numa_nodes: u32,
}

impl Config {
    /// When no per-pid files are configured there is nothing to sample for
    /// descendants, so the tracker only needs to watch the root for exit.
    pub fn normalize_tracking(&mut self) {
        if self.metric_spec.pid.is_empty() {
            self.ignore_children = true;
            self.ignore_threads = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_period <= 0.0 {
            return Err(eyre!(
                "Sample period must be positive, got {}",
                self.sample_period
            ));
        }
        if self.cpu_affinity.is_empty() {
            return Err(eyre!("Empty cpu set for running the collector"));
        }
        Ok(())
    }
}

/// Resolve the cpu set the collector pins itself to: the intersection of
/// the `--cpu-affinity` list and the cpus belonging to the `--node-affinity`
/// nodes. `node_cpus` holds each node's cpu set, indexed by node id. An
/// empty intersection cannot be sampled from and is a configuration error.
pub fn resolve_affinity(
    cpu_arg: Option<&str>,
    node_arg: Option<&str>,
    cpu_count: usize,
    node_cpus: &[BTreeSet<u32>],
) -> Result<BTreeSet<u32>> {
    let all_cpus: BTreeSet<u32> = (0..cpu_count as u32).collect();
    let cpus = match cpu_arg {
        Some(arg) => parse_affinity_list(arg, cpu_count as u32)?,
        None => all_cpus.clone(),
    };
    let node_set = match node_arg {
        Some(arg) => {
            let nodes = parse_affinity_list(arg, node_cpus.len() as u32)?;
            let mut combined = BTreeSet::new();
            for node in nodes {
                combined.extend(node_cpus[node as usize].iter().copied());
            }
            combined
        }
        None => all_cpus,
    };
    let affinity: BTreeSet<u32> = cpus.intersection(&node_set).copied().collect();
    if affinity.is_empty() {
        return Err(eyre!(
            "No usable cpus: cpu list {:?} does not intersect node cpus {:?}",
            cpus,
            node_set
        ));
    }
    Ok(affinity)
}

#[cfg(test)]
impl Config {
    pub fn test_fixture() -> Self {
        Config {
            metric_spec: MetricSpec::default(),
            pid: None,
            workload: None,
            ignore_children: false,
            ignore_threads: false,
            keep_workload_alive: false,
            nr_samples: Some(2),
            delay: Duration::from_secs(0),
            sample_period: 0.05,
            output_file_name: DEFAULT_OUTPUT_FILE_NAME.to_string(),
            cpu_affinity: (0..crate::util::system::cpu_count() as u32).collect(),
            flush_limit: DEFAULT_FLUSH_LIMIT,
            batch_size: PID_BATCH_SIZE,
            ignore_workload_logs: false,
            run_dir: PathBuf::from("/tmp/wit-test"),
            csv_result: false,
            ignore_offset: false,
            cpu_count: crate::util::system::cpu_count(),
            numa_nodes: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn two_nodes() -> Vec<BTreeSet<u32>> {
        vec![(0..4).collect(), (4..8).collect()]
    }

    #[test]
    fn defaults_use_every_cpu() {
        let affinity = resolve_affinity(None, None, 8, &two_nodes()).unwrap();
        assert_eq!(affinity, (0..8).collect());
    }

    #[rstest]
    #[case(Some("0:2,6"), None, &[0, 1, 2, 6])]
    #[case(None, Some("1"), &[4, 5, 6, 7])]
    #[case(Some("0:5"), Some("0"), &[0, 1, 2, 3])]
    #[case(Some("3,4"), Some("0,1"), &[3, 4])]
    fn intersections(
        #[case] cpu_arg: Option<&str>,
        #[case] node_arg: Option<&str>,
        #[case] expected: &[u32],
    ) {
        let affinity = resolve_affinity(cpu_arg, node_arg, 8, &two_nodes()).unwrap();
        assert_eq!(affinity, expected.iter().copied().collect());
    }

    #[test]
    fn empty_intersection_is_fatal() {
        assert!(resolve_affinity(Some("0:1"), Some("1"), 8, &two_nodes()).is_err());
    }

    #[test]
    fn out_of_range_inputs_are_fatal() {
        assert!(resolve_affinity(Some("9"), None, 8, &two_nodes()).is_err());
        assert!(resolve_affinity(None, Some("2"), 8, &two_nodes()).is_err());
    }

    #[test]
    fn pid_files_gate_tree_tracking() {
        let mut config = Config::test_fixture();
        config.metric_spec.pid.clear();
        config.normalize_tracking();
        assert!(config.ignore_children);
        assert!(config.ignore_threads);
    }

    #[test]
    fn validation_rejects_bad_periods() {
        let mut config = Config::test_fixture();
        config.sample_period = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn pid_and_workload_together_are_accepted() {
        // A launched workload silently takes precedence over --pid.
        let mut config = Config::test_fixture();
        config.pid = Some(1);
        config.workload = Some("sleep 1".to_string());
        assert!(config.validate().is_ok());
    }
}
