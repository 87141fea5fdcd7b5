//
// SPDX-License-Identifier: MIT
// See LICENSE for details
//! The tick loop: wait for the next scheduled sample time, stamp the tick,
//! then fan the file reads out over worker pools.
//!
//! Two pools exist, both sized to the cpu count: one for global sources
//! and one for the per-pid expansion (submitted in batches for
//! throughput). The dispatcher is the only writer of the timestamp list,
//! so it stays in strict insertion order; each `(tag, timestamp)` cell has
//! exactly one writer. Tasks may complete out of order and across tick
//! boundaries without conflicting.
//!
//! Scheduling runs in catch-up mode: a tick that starts late sleeps a
//! plain sample period instead of trying to fire faster, so one slow tick
//! never compounds into drift or a burst of reads.
use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eyre::Result;
use log::warn;
use threadpool::ThreadPool;

use crate::collector::buffer::{FragmentWriter, SampleBuffer};
use crate::collector::catalog::{pid_proc_path, pid_proc_tag, PidKind, SourceCatalog};
use crate::collector::parsers::Parsers;
use crate::collector::tracker::ProcessTreeTracker;
use crate::config::Config;
use crate::util::system::pid_exists;
use crate::util::time::{interruptible_sleep, now_string, to_seconds};

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    /// ENOENT / ESRCH: the file (or its process) no longer exists. Not an
    /// error worth logging; the sample is simply absent for this tick.
    #[error("source disappeared")]
    Gone,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn read_source(path: &Path) -> Result<String, ReadError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(ReadError::Gone),
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Err(ReadError::Gone),
        Err(e) => Err(ReadError::Io(e)),
    }
}

/// How long to sleep before collecting this tick. Late ticks (and the
/// first tick) get a plain period; on-schedule ticks sleep just enough to
/// land on `prev_scheduled + period`.
fn nap_seconds(prev_scheduled: Option<f64>, now: f64, period: f64) -> f64 {
    match prev_scheduled {
        Some(prev) => {
            let wait = (prev + period) - now;
            if wait > 0.0 {
                wait
            } else {
                period
            }
        }
        None => period,
    }
}

#[derive(Clone)]
struct PidTask {
    pid: i32,
    tag: String,
    path: std::path::PathBuf,
    file: String,
    kind: PidKind,
}

pub struct Sampler {
    catalog: Arc<SourceCatalog>,
    parsers: Arc<Parsers>,
    buffer: Arc<Mutex<SampleBuffer>>,
    tracker: Option<Arc<ProcessTreeTracker>>,
    shutdown: Arc<AtomicBool>,
    fragments: FragmentWriter,
    global_pool: ThreadPool,
    pid_pool: Option<ThreadPool>,
    sample_period: f64,
    nr_samples: Option<u64>,
    batch_size: usize,
    flush_limit: usize,
    root_pid: Option<i32>,
}

impl Sampler {
    pub fn new(
        config: &Config,
        catalog: Arc<SourceCatalog>,
        parsers: Arc<Parsers>,
        buffer: Arc<Mutex<SampleBuffer>>,
        tracker: Option<Arc<ProcessTreeTracker>>,
        root_pid: Option<i32>,
        shutdown: Arc<AtomicBool>,
        fragments: FragmentWriter,
    ) -> Self {
        let pid_pool = tracker
            .as_ref()
            .map(|_| ThreadPool::with_name("pid-reader".to_string(), config.cpu_count));
        Self {
            catalog,
            parsers,
            buffer,
            tracker,
            shutdown,
            fragments,
            global_pool: ThreadPool::with_name("global-reader".to_string(), config.cpu_count),
            pid_pool,
            sample_period: config.sample_period,
            nr_samples: config.nr_samples,
            batch_size: config.batch_size,
            flush_limit: config.flush_limit,
            root_pid,
        }
    }

    fn running(&self) -> bool {
        !self.shutdown.load(Ordering::Relaxed)
    }

    fn root_alive(&self) -> bool {
        match self.root_pid {
            Some(pid) => {
                if pid_exists(pid) {
                    true
                } else {
                    warn!("Process {} no longer exists, stopping collection", pid);
                    false
                }
            }
            None => true,
        }
    }

    /// The sample loop. Returns when the sample budget is exhausted, the
    /// tracked process exits, or shutdown is requested.
    pub fn run(&mut self) -> Result<()> {
        let mut prev_scheduled: Option<f64> = None;
        let mut remaining = self.nr_samples;
        while self.running() {
            self.flush_if_needed();
            let ts = now_string();
            let now = to_seconds(&ts)?;
            let nap = nap_seconds(prev_scheduled, now, self.sample_period);
            interruptible_sleep(Duration::from_secs_f64(nap));
            prev_scheduled = Some(now);
            if !self.running() {
                break;
            }

            self.buffer
                .lock()
                .expect("Mutex poisoned")
                .push_timestamp(&ts);
            self.dispatch_global(&ts);
            self.dispatch_pid(&ts);

            match remaining.as_mut() {
                Some(samples_left) => {
                    if *samples_left <= 1 || !self.root_alive() {
                        break;
                    }
                    *samples_left -= 1;
                }
                None => {
                    if !self.root_alive() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn flush_if_needed(&mut self) {
        let mut buffer = self.buffer.lock().expect("Mutex poisoned");
        if buffer.estimated_bytes() > self.flush_limit {
            let slice = buffer.take_slice();
            drop(buffer);
            self.fragments.flush(slice);
        }
    }

    fn dispatch_global(&self, ts: &str) {
        for source in &self.catalog.global {
            self.buffer
                .lock()
                .expect("Mutex poisoned")
                .ensure_tag(&source.tag);
            let source = source.clone();
            let parsers = Arc::clone(&self.parsers);
            let buffer = Arc::clone(&self.buffer);
            let ts = ts.to_string();
            self.global_pool.execute(move || match read_source(&source.path) {
                Ok(contents) => {
                    let metrics = parsers.parse_global(&source, &contents);
                    buffer
                        .lock()
                        .expect("Mutex poisoned")
                        .insert(&source.tag, &ts, metrics);
                }
                Err(ReadError::Gone) => {}
                Err(ReadError::Io(e)) => warn!("{}: read failed: {}", source.tag, e),
            });
        }
    }

    fn dispatch_pid(&self, ts: &str) {
        let (Some(tracker), Some(pool)) = (&self.tracker, &self.pid_pool) else {
            return;
        };
        if self.catalog.pid_templates.is_empty() {
            return;
        }
        let ids = tracker.snapshot();
        let mut tasks = Vec::with_capacity(ids.len() * self.catalog.pid_templates.len());
        {
            let mut buffer = self.buffer.lock().expect("Mutex poisoned");
            for pid in ids.iter() {
                for template in &self.catalog.pid_templates {
                    let tag = pid_proc_tag(*pid, &template.file);
                    buffer.ensure_tag(&tag);
                    tasks.push(PidTask {
                        pid: *pid,
                        path: pid_proc_path(*pid, &template.file),
                        tag,
                        file: template.file.clone(),
                        kind: template.kind.clone(),
                    });
                }
            }
        }

        for batch in tasks.chunks(self.batch_size) {
            let batch = batch.to_vec();
            let parsers = Arc::clone(&self.parsers);
            let buffer = Arc::clone(&self.buffer);
            let tracker = Arc::clone(tracker);
            let ts = ts.to_string();
            pool.execute(move || {
                for task in batch {
                    match read_source(&task.path) {
                        Ok(contents) => {
                            let metrics =
                                parsers.parse_pid_file(&task.kind, &task.file, task.pid, &contents);
                            buffer
                                .lock()
                                .expect("Mutex poisoned")
                                .insert(&task.tag, &ts, metrics);
                        }
                        Err(ReadError::Gone) => tracker.discard(task.pid),
                        Err(ReadError::Io(e)) => warn!("{}: read failed: {}", task.tag, e),
                    }
                }
            });
        }
    }

    /// Drain the worker pools, flush the final slice and wait for every
    /// fragment to land on disk. Call after the buffer has received its
    /// end-of-run metadata.
    pub fn finish(mut self) {
        self.global_pool.join();
        if let Some(pool) = &self.pid_pool {
            pool.join();
        }
        let slice = self.buffer.lock().expect("Mutex poisoned").take_slice();
        self.fragments.flush(slice);
        self.fragments.wait();
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    // First tick sleeps a full period.
    #[case(None, 100.0, 0.5, 0.5)]
    // On schedule: sleep the remainder until prev + period.
    #[case(Some(100.0), 100.2, 0.5, 0.3)]
    // Late tick: catch-up mode sleeps a plain period, no compounding.
    #[case(Some(100.0), 100.9, 0.5, 0.5)]
    // Exactly on the boundary counts as late.
    #[case(Some(100.0), 100.5, 0.5, 0.5)]
    fn nap_scheduling(
        #[case] prev: Option<f64>,
        #[case] now: f64,
        #[case] period: f64,
        #[case] expected: f64,
    ) {
        assert!((nap_seconds(prev, now, period) - expected).abs() < 1e-9);
    }

    #[test]
    fn read_source_distinguishes_missing_files() {
        assert!(matches!(
            read_source(Path::new("/proc/nonexistent-telemetry-file")),
            Err(ReadError::Gone)
        ));
        assert!(read_source(Path::new("/proc/uptime")).is_ok());
    }
}
