//
// SPDX-License-Identifier: MIT
// See LICENSE for details
//! Run controller: owns the lifecycle of one collection run.
//!
//! Start-up order matters: pin the process to the configured cpu set
//! first so every thread spawned afterwards inherits it, record the
//! one-shot readings, honor the start delay, then start the tracker and
//! the sample loop. Shutdown (normal exit, SIGINT/SIGTERM, workload
//! termination or an exhausted sample budget) drains the workers, flushes
//! the final slice and hands the fragments to the aggregator.
use std::fs::create_dir_all;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use eyre::{eyre, Context, Result};
use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::aggregate::Aggregator;
use crate::collector::buffer::{keys, FragmentWriter, SampleBuffer};
use crate::collector::catalog::SourceCatalog;
use crate::collector::parsers::Parsers;
use crate::collector::sampler::{read_source, ReadError, Sampler};
use crate::collector::tracker::ProcessTreeTracker;
use crate::collector::workload::Workload;
use crate::config::Config;
use crate::util::system::{pid_exists, set_cpu_affinity, SystemConfiguration};
use crate::util::time::interruptible_sleep;

pub mod buffer;
pub mod catalog;
pub mod parsers;
pub mod sampler;
pub mod tracker;
pub mod workload;

pub const WORKLOAD_OUTPUT_FILE: &str = "workload.output";

pub fn run(config: Config) -> Result<()> {
    create_dir_all(&config.run_dir).wrap_err_with(|| {
        eyre!("Unable to create run directory {}", config.run_dir.display())
    })?;
    info!("Run directory: {}", config.run_dir.display());

    set_cpu_affinity(&config.cpu_affinity)?;
    debug!("Pinned to cpus {:?}", config.cpu_affinity);

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&shutdown))?;
    }

    let mut workload = match &config.workload {
        Some(command) => {
            let capture = if config.ignore_workload_logs {
                None
            } else {
                Some(config.run_dir.join(WORKLOAD_OUTPUT_FILE))
            };
            Some(Workload::launch(command, capture.as_deref())?)
        }
        None => None,
    };
    // A launched workload takes precedence over an explicit --pid.
    let root_pid = workload.as_ref().map(|w| w.pid).or(config.pid);
    if let Some(pid) = root_pid {
        if !pid_exists(pid) {
            return Err(eyre!("No process with pid {}", pid));
        }
        info!("Tracking process tree of pid {}", pid);
    }

    let catalog = Arc::new(SourceCatalog::build(&config.metric_spec, config.numa_nodes));
    let parsers = Arc::new(Parsers::new(&config.metric_spec, config.cpu_count));

    let mut buffer = SampleBuffer::new();
    store_run_info(&mut buffer, &config, root_pid);
    collect_once(&mut buffer, &catalog.once);
    let buffer = Arc::new(Mutex::new(buffer));

    if !config.delay.is_zero() {
        info!("Delaying collection for {:?}", config.delay);
        interruptible_sleep(config.delay);
    }

    let tracker =
        root_pid.map(|pid| ProcessTreeTracker::new(pid, &config, Arc::clone(&shutdown)));
    let tracker_thread = tracker.as_ref().map(|t| t.spawn());

    info!("Collecting...");
    let mut sampler = Sampler::new(
        &config,
        Arc::clone(&catalog),
        parsers,
        Arc::clone(&buffer),
        tracker.clone(),
        root_pid,
        Arc::clone(&shutdown),
        FragmentWriter::new(&config.run_dir),
    );
    let sampled = sampler.run();

    info!("Saving results...");
    shutdown.store(true, Ordering::Relaxed);
    if let Some(workload) = workload.as_mut() {
        workload.kill_if_running(config.keep_workload_alive);
    }
    if let Some(thread) = tracker_thread {
        let _ = thread.join();
    }
    if let Some(tracker) = &tracker {
        buffer
            .lock()
            .expect("Mutex poisoned")
            .set_meta(keys::ALL_PIDS, json!(tracker.all_ids()));
    }
    sampler.finish();

    let output = Aggregator::new(&config.run_dir).run(
        &config.output_file_name,
        config.ignore_offset,
        config.csv_result,
    )?;
    info!("Results at: {}", output.display());
    sampled
}

/// Run metadata stored once, in the first fragment, and carried through
/// aggregation unchanged.
fn store_run_info(buffer: &mut SampleBuffer, config: &Config, root_pid: Option<i32>) {
    buffer.set_meta(
        keys::FILE_TYPE,
        Value::String(config.metric_spec.describe()),
    );
    buffer.set_meta(keys::OFFSET, json!(config.ignore_offset));
    buffer.set_meta(
        keys::SYSTEM_CONFIGURATION,
        json!([SystemConfiguration::collect()]),
    );
    buffer.set_meta(keys::SAMPLE_PERIOD, json!(config.sample_period));
    if root_pid.is_none() {
        if let Some(nr_samples) = config.nr_samples {
            buffer.set_meta(keys::NR_SAMPLES, json!(nr_samples));
        }
    }
}

/// Read the collect-once table (hugepage pool counters). Values do not
/// change at sampling rates, so the first token of each file is stored as
/// run metadata. Absent files (no hugepages on this node) are skipped.
fn collect_once(buffer: &mut SampleBuffer, sources: &[(String, PathBuf)]) {
    for (tag, path) in sources {
        match read_source(path) {
            Ok(contents) => match contents.split_whitespace().next() {
                Some(value) => buffer.set_meta(tag, Value::String(value.to_string())),
                None => debug!("{} is empty", tag),
            },
            Err(ReadError::Gone) => debug!("{} not found", tag),
            Err(ReadError::Io(e)) => warn!("{}: read failed: {}", tag, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;

    use serde_json::Value;

    use super::*;
    use crate::collector::buffer::TMP_RESULT_PREFIX;
    use crate::config::metric_spec::AllowList;

    fn read_results(config: &Config) -> Value {
        let path = config
            .run_dir
            .join(format!("{}.json", config.output_file_name));
        serde_json::from_str(&read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn global_only_bounded_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::test_fixture();
        config.run_dir = dir.path().join("run");
        config.nr_samples = Some(3);
        config.sample_period = 0.05;
        config.metric_spec.proc =
            [("stat".to_string(), AllowList::All)].into_iter().collect();
        config.metric_spec.sys.clear();
        config.metric_spec.pid.clear();
        config.normalize_tracking();

        run(config.clone()).unwrap();

        let results = read_results(&config);
        assert_eq!(results["timestamps"].as_array().unwrap().len(), 3);
        assert_eq!(results["nr_samples"], serde_json::json!(3));
        let cpu_user = &results["proc_stat"][0]["CPU user"];
        assert_eq!(cpu_user.as_array().unwrap().len(), 3);
        assert!(results["system configuration"][0]["cpu count"].is_number());

        // Fragments are gone after a successful aggregation.
        let leftovers: Vec<_> = std::fs::read_dir(&config.run_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with(TMP_RESULT_PREFIX)
            })
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn tracked_workload_stops_on_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::test_fixture();
        config.run_dir = dir.path().join("run");
        config.nr_samples = None;
        config.sample_period = 0.1;
        config.workload = Some("sleep 0.4".to_string());
        config.metric_spec.proc =
            [("meminfo".to_string(), AllowList::All)].into_iter().collect();
        config.metric_spec.sys.clear();
        config.metric_spec.pid =
            [("stat".to_string(), AllowList::All)].into_iter().collect();

        run(config.clone()).unwrap();

        let results = read_results(&config);
        let ticks = results["timestamps"].as_array().unwrap().len();
        assert!((1..=10).contains(&ticks), "unexpected tick count {}", ticks);
        let all_pids = results["all_pids"].as_array().unwrap();
        assert!(!all_pids.is_empty());
        // The sleeper was short-lived: the run stopped by itself and no
        // nr_samples budget was recorded.
        assert!(results.get("nr_samples").is_none());
    }
}
