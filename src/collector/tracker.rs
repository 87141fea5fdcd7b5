//
// SPDX-License-Identifier: MIT
// See LICENSE for details
//! Background tracker for the pid/tid tree below a root process.
//!
//! The tracker re-enumerates descendants of the root on every iteration and
//! folds thread ids in when a decay counter runs out or the live set is
//! still small. It publishes an immutable snapshot of the live set that the
//! sampler picks up at the start of each tick, so the sampler never
//! observes a half-updated view. There is no sleep in the loop: the
//! iteration cadence is governed by /proc read latency.
//!
//! Ids are only removed from the live set when a read confirms the process
//! is gone ([`ProcessTreeTracker::discard`]); the cumulative set of every
//! id ever observed is kept separately for the end-of-run `all_pids`
//! record. Stale live entries are harmless because the sampler treats a
//! vanished file as "no sample".
use std::collections::{BTreeSet, HashMap};
use std::fs::{read_dir, read_to_string};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use crate::config::Config;

const THREAD_RESCAN_DECAY: u32 = 5;

struct TrackerState {
    live: BTreeSet<i32>,
    ever: BTreeSet<i32>,
    decay: u32,
}

pub struct ProcessTreeTracker {
    root: i32,
    ignore_children: bool,
    ignore_threads: bool,
    rescan_floor: usize,
    proc_dir: PathBuf,
    shutdown: Arc<AtomicBool>,
    state: Mutex<TrackerState>,
    published: RwLock<Arc<Vec<i32>>>,
}

impl ProcessTreeTracker {
    pub fn new(root: i32, config: &Config, shutdown: Arc<AtomicBool>) -> Arc<Self> {
        let mut live = BTreeSet::new();
        live.insert(root);
        Arc::new(Self {
            root,
            ignore_children: config.ignore_children,
            ignore_threads: config.ignore_threads,
            rescan_floor: 3 * config.cpu_count,
            proc_dir: PathBuf::from("/proc"),
            shutdown,
            state: Mutex::new(TrackerState {
                ever: live.clone(),
                live,
                decay: 1,
            }),
            published: RwLock::new(Arc::new(vec![root])),
        })
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        std::thread::Builder::new()
            .name("pid-tracker".to_string())
            .spawn(move || tracker.run_loop())
            .expect("spawn pid tracker")
    }

    fn run_loop(&self) {
        while !self.shutdown.load(Ordering::Relaxed) {
            if !self.proc_dir.join(self.root.to_string()).exists() {
                // Root exited; the sampler notices on its next tick and
                // starts shutdown. Nothing more to observe here.
                break;
            }
            self.scan();
        }
    }

    fn scan(&self) {
        let rescan_pids = {
            let mut state = self.state.lock().expect("Mutex poisoned");
            state.decay = state.decay.saturating_sub(1);
            if !self.ignore_children {
                for id in process_tree(self.root, &self.proc_dir) {
                    if state.live.insert(id) {
                        state.ever.insert(id);
                    }
                }
            }
            let want_threads = !self.ignore_children
                && !self.ignore_threads
                && (state.decay == 0 || state.live.len() < self.rescan_floor);
            if want_threads {
                state.decay = THREAD_RESCAN_DECAY;
                Some(state.live.iter().copied().collect::<Vec<i32>>())
            } else {
                None
            }
        };

        if let Some(pids) = rescan_pids {
            // /proc reads happen outside the lock; the ids get folded in
            // afterwards.
            let mut tids = Vec::new();
            for pid in pids {
                tids.extend(thread_ids(pid, &self.proc_dir));
            }
            let mut state = self.state.lock().expect("Mutex poisoned");
            for tid in tids {
                if state.live.insert(tid) {
                    state.ever.insert(tid);
                }
            }
        }

        self.publish();
    }

    fn publish(&self) {
        let snapshot: Vec<i32> = {
            let state = self.state.lock().expect("Mutex poisoned");
            state.live.iter().copied().collect()
        };
        *self.published.write().expect("RwLock poisoned") = Arc::new(snapshot);
    }

    /// The immutable id list the sampler reads once per tick.
    pub fn snapshot(&self) -> Arc<Vec<i32>> {
        Arc::clone(&self.published.read().expect("RwLock poisoned"))
    }

    /// Drop an id whose files were confirmed gone mid-read. It stays in
    /// the cumulative record.
    pub fn discard(&self, pid: i32) {
        let mut state = self.state.lock().expect("Mutex poisoned");
        state.live.remove(&pid);
    }

    /// Every pid/tid ever observed in the tree during this run.
    pub fn all_ids(&self) -> Vec<i32> {
        let state = self.state.lock().expect("Mutex poisoned");
        state.ever.iter().copied().collect()
    }
}

/// The parent pid is the 4th field of /proc/<pid>/stat, after the
/// parenthesized comm (which may itself contain spaces).
pub(crate) fn parse_ppid(stat: &str) -> Option<i32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

fn numeric_entries(dir: &Path) -> Vec<i32> {
    match read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_string_lossy().parse().ok())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Walk the process table and collect `root` plus all its descendants.
fn process_tree(root: i32, proc_dir: &Path) -> BTreeSet<i32> {
    let mut children_of: HashMap<i32, Vec<i32>> = HashMap::new();
    for pid in numeric_entries(proc_dir) {
        if let Ok(stat) = read_to_string(proc_dir.join(pid.to_string()).join("stat")) {
            if let Some(ppid) = parse_ppid(&stat) {
                children_of.entry(ppid).or_default().push(pid);
            }
        }
    }

    let mut tree = BTreeSet::new();
    let mut queue = vec![root];
    while let Some(pid) = queue.pop() {
        if tree.insert(pid) {
            if let Some(children) = children_of.get(&pid) {
                queue.extend(children);
            }
        }
    }
    tree
}

/// Thread ids of one process, from /proc/<pid>/task/.
fn thread_ids(pid: i32, proc_dir: &Path) -> Vec<i32> {
    numeric_entries(&proc_dir.join(pid.to_string()).join("task"))
}

#[cfg(test)]
mod tests {
    use std::fs::{create_dir_all, write};

    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("100 (sleep) S 1 100 100 0 -1 4194304 100 0 0 0 0 0 0 0", Some(1))]
    #[case("200 (tmux: server) S 42 200 200 0 -1 4194304 0 0 0 0 0 0 0 0", Some(42))]
    #[case("300 (we(ird)name) R 7 300 300 0 -1 0 0 0 0 0 0 0 0 0", Some(7))]
    #[case("garbage", None)]
    fn ppid_parsing(#[case] stat: &str, #[case] expected: Option<i32>) {
        assert_eq!(parse_ppid(stat), expected);
    }

    fn fake_proc(entries: &[(i32, i32)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (pid, ppid) in entries {
            let pid_dir = dir.path().join(pid.to_string());
            create_dir_all(&pid_dir).unwrap();
            write(
                pid_dir.join("stat"),
                format!("{} (proc) S {} 0 0 0 -1 0 0 0 0 0 0 0 0 0", pid, ppid),
            )
            .unwrap();
        }
        dir
    }

    #[test]
    fn tree_walk_collects_descendants() {
        let proc_dir = fake_proc(&[(100, 1), (101, 100), (102, 101), (200, 1)]);
        let tree = process_tree(100, proc_dir.path());
        assert_eq!(tree, BTreeSet::from([100, 101, 102]));
    }

    #[test]
    fn tree_walk_with_no_children_is_just_the_root() {
        let proc_dir = fake_proc(&[(100, 1), (200, 1)]);
        assert_eq!(process_tree(100, proc_dir.path()), BTreeSet::from([100]));
    }

    #[test]
    fn thread_ids_from_task_dir() {
        let dir = tempfile::tempdir().unwrap();
        create_dir_all(dir.path().join("100/task/100")).unwrap();
        create_dir_all(dir.path().join("100/task/110")).unwrap();
        let mut tids = thread_ids(100, dir.path());
        tids.sort();
        assert_eq!(tids, vec![100, 110]);
    }

    #[test]
    fn discard_keeps_the_cumulative_record() {
        let config = Config::test_fixture();
        let shutdown = Arc::new(AtomicBool::new(false));
        let tracker = ProcessTreeTracker::new(4242, &config, shutdown);
        tracker.discard(4242);
        assert_eq!(tracker.all_ids(), vec![4242]);
        tracker.publish();
        assert!(tracker.snapshot().is_empty());
    }
}
