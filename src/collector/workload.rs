//
// SPDX-License-Identifier: MIT
// See LICENSE for details
//! Launch and reap the workload whose process tree gets sampled.
//!
//! The command runs under `sh -c`, optionally with stdout captured to
//! `workload.output`. The tracked pid is the shell's first child when one
//! appears quickly (the usual case for `sh -c "cmd args"`), otherwise the
//! shell itself (which happens when the shell exec()s the command away).
use std::fs::File;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use eyre::{eyre, Context, Result};
use log::{info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::collector::tracker::parse_ppid;
use crate::util::system::pid_exists;
use crate::util::time::interruptible_sleep;

const CHILD_RESOLVE_ATTEMPTS: u32 = 10;
const CHILD_RESOLVE_WAIT: Duration = Duration::from_millis(20);

pub struct Workload {
    child: Child,
    /// The pid handed to the tracker and sampler.
    pub pid: i32,
}

impl Workload {
    /// Workload launch failure is fatal: there is nothing to sample.
    pub fn launch(command: &str, capture_output: Option<&Path>) -> Result<Self> {
        let mut shell = Command::new("sh");
        shell.arg("-c").arg(command).stdin(Stdio::null());
        if let Some(path) = capture_output {
            let output = File::create(path)
                .wrap_err_with(|| eyre!("Unable to create {}", path.display()))?;
            shell.stdout(Stdio::from(output));
        }
        let child = shell
            .spawn()
            .wrap_err_with(|| eyre!("Unable to launch workload: {}", command))?;
        let shell_pid = child.id() as i32;

        let mut pid = shell_pid;
        for _ in 0..CHILD_RESOLVE_ATTEMPTS {
            if let Some(first_child) = first_child_of(shell_pid, Path::new("/proc")) {
                pid = first_child;
                break;
            }
            if !pid_exists(shell_pid) {
                break;
            }
            interruptible_sleep(CHILD_RESOLVE_WAIT);
        }
        info!("Workload pid: {}", pid);
        Ok(Self { child, pid })
    }

    /// SIGKILL the workload at end of run, unless asked to keep it alive.
    /// Also reaps the shell so no zombie outlives the collector.
    pub fn kill_if_running(&mut self, keep_alive: bool) {
        if keep_alive {
            let _ = self.child.try_wait();
            return;
        }
        if pid_exists(self.pid) {
            match kill(Pid::from_raw(self.pid), Signal::SIGKILL) {
                Ok(()) => info!("Killed workload pid {}", self.pid),
                Err(e) => warn!("Unable to kill workload pid {}: {}", self.pid, e),
            }
        }
        let _ = self.child.wait();
    }
}

/// The lowest-numbered live child of `pid`, if any.
fn first_child_of(pid: i32, proc_dir: &Path) -> Option<i32> {
    let mut children: Vec<i32> = std::fs::read_dir(proc_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_string_lossy().parse::<i32>().ok())
        .filter(|candidate| {
            std::fs::read_to_string(proc_dir.join(candidate.to_string()).join("stat"))
                .ok()
                .and_then(|stat| parse_ppid(&stat))
                == Some(pid)
        })
        .collect();
    children.sort_unstable();
    children.first().copied()
}
