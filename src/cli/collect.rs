//
// SPDX-License-Identifier: MIT
// See LICENSE for details
use std::path::{Path, PathBuf};
use std::time::Duration;

use argh::FromArgs;
use eyre::{Context, Result};

use crate::collector;
use crate::config::{
    resolve_affinity, Config, MetricSpec, DEFAULT_FLUSH_LIMIT, DEFAULT_LOG_DIR,
    DEFAULT_NR_SAMPLES, DEFAULT_OUTPUT_FILE_NAME, DEFAULT_SAMPLE_PERIOD, PID_BATCH_SIZE,
};
use crate::util::system::{cpu_count, node_cpu_list, numa_node_count};
use crate::util::time::now_string;

#[derive(FromArgs)]
/// Sample system and per-process telemetry for a bounded interval and
/// merge the samples into one time-aligned result.
#[argh(subcommand, name = "collect")]
pub struct CollectArgs {
    /// path to the collector input spec (JSON; built-in defaults if unset)
    #[argh(option, short = 'c')]
    collector_input_config: Option<String>,

    /// pid of the process tree to monitor
    #[argh(option, short = 'p')]
    pid: Option<i32>,

    /// command to run and monitor
    #[argh(option, short = 'w')]
    workload: Option<String>,

    /// collect for the parent process only, not its children
    #[argh(switch, short = 'C')]
    ignore_children: bool,

    /// collect for processes but not their threads
    #[argh(switch, short = 'T')]
    ignore_threads: bool,

    /// keep the workload alive when collection ends
    #[argh(switch, short = 'K')]
    keep_workload_alive: bool,

    /// number of samples to collect (unset: run until the workload exits)
    #[argh(option, short = 'n')]
    nr_samples: Option<u64>,

    /// start monitoring after this many seconds
    #[argh(option, short = 'd', default = "0")]
    delay_time: u64,

    /// seconds between successive samples
    #[argh(option, short = 's', default = "DEFAULT_SAMPLE_PERIOD")]
    sample_period: f64,

    /// output file name
    #[argh(option, short = 'o', default = "DEFAULT_OUTPUT_FILE_NAME.to_string()")]
    output_file_name: String,

    /// bind the collector to these cpus, e.g. '0:7,12'
    #[argh(option, short = 'j')]
    cpu_affinity: Option<String>,

    /// bind the collector to these NUMA nodes, e.g. '0,1'
    #[argh(option, short = 'm')]
    node_affinity: Option<String>,

    /// flush buffered samples to disk past this many bytes
    #[argh(option, short = 'f', default = "DEFAULT_FLUSH_LIMIT")]
    flush_limit: usize,

    /// don't capture workload output into workload.output
    #[argh(switch, short = 'L')]
    ignore_workload_logs: bool,

    /// results directory
    #[argh(option, short = 'l', default = "DEFAULT_LOG_DIR.to_string()")]
    log_dir: String,

    /// also write the merged result as CSV
    #[argh(switch, short = 'a')]
    csv_result: bool,

    /// don't offset monotonic counters to a zero baseline
    #[argh(switch, short = 'R')]
    ignore_offset: bool,
}

impl CollectArgs {
    pub fn into_config(self) -> Result<Config> {
        let metric_spec = match &self.collector_input_config {
            Some(path) => MetricSpec::load(Path::new(path))?,
            None => MetricSpec::default(),
        };

        let cpu_count = cpu_count();
        let numa_nodes = numa_node_count();
        let node_cpus: Vec<_> = (0..numa_nodes)
            .map(node_cpu_list)
            .collect::<Result<_>>()
            .wrap_err("Unable to read NUMA topology")?;
        let cpu_affinity = resolve_affinity(
            self.cpu_affinity.as_deref(),
            self.node_affinity.as_deref(),
            cpu_count,
            &node_cpus,
        )?;

        // With a tracked process and no explicit budget, the workload's
        // lifetime bounds the run; global-only runs fall back to a default
        // sample count.
        let nr_samples = match (self.nr_samples, self.pid.is_some() || self.workload.is_some()) {
            (Some(nr_samples), _) => Some(nr_samples),
            (None, true) => None,
            (None, false) => Some(DEFAULT_NR_SAMPLES),
        };

        let run_dir = PathBuf::from(&self.log_dir).join(now_string());

        let mut config = Config {
            metric_spec,
            pid: self.pid,
            workload: self.workload,
            ignore_children: self.ignore_children,
            ignore_threads: self.ignore_threads,
            keep_workload_alive: self.keep_workload_alive,
            nr_samples,
            delay: Duration::from_secs(self.delay_time),
            sample_period: self.sample_period,
            output_file_name: self.output_file_name,
            cpu_affinity,
            flush_limit: self.flush_limit,
            batch_size: PID_BATCH_SIZE,
            ignore_workload_logs: self.ignore_workload_logs,
            run_dir,
            csv_result: self.csv_result,
            ignore_offset: self.ignore_offset,
            cpu_count,
            numa_nodes,
        };
        config.normalize_tracking();
        config.validate()?;
        Ok(config)
    }
}

pub fn run(args: CollectArgs) -> Result<()> {
    collector::run(args.into_config()?)
}
