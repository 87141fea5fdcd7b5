//
// SPDX-License-Identifier: MIT
// See LICENSE for details
//! Pseudo-file parsers.
//!
//! All parsers are pure functions from raw file contents to a [`MetricMap`];
//! reading the file (and deciding what a missing file means) is the
//! sampling engine's job. Three families exist:
//!
//! - a generic key/value parser driven by a per-file delimiter table,
//! - a `/proc/stat` parser that spreads the per-cpu columns over a
//!   precomputed `CPU <n> <field>` name vector,
//! - positional parsers for `/proc/<pid>/stat` and `/proc/<pid>/statm`
//!   whose single line is paired with a fixed schema.
//!
//! Metric naming is part of the on-disk contract: per-node `numastat` /
//! `vmstat` metrics get a `Node <N> ` prefix and per-pid metrics a
//! `<pid> ` prefix so series from different nodes and processes never
//! collide. Allow-lists always match the base name, after prefixing.
use std::collections::HashSet;

use crate::collector::catalog::{GlobalKind, GlobalSource, PidKind};
use crate::config::metric_spec::{AllowList, MetricSpec};
use crate::metrics::{numeric_or_string, MetricMap, MetricValue};

/// Field schema for the leading `cpu` lines of /proc/stat.
pub const PROC_STAT_CPU_FIELDS: &[&str] = &[
    "user",
    "nice",
    "system",
    "idle",
    "iowait",
    "irq",
    "softirq",
    "steal",
    "guest",
    "guest_nice",
];

/// Positional schema for /proc/<pid>/stat (man proc_pid_stat(5)).
pub const PID_STAT_FIELDS: &[&str] = &[
    "pid",
    "comm",
    "state",
    "ppid",
    "pgrp",
    "session",
    "tty_nr",
    "tpgid",
    "flags",
    "minflt",
    "cminflt",
    "majflt",
    "cmajflt",
    "utime",
    "stime",
    "cutime",
    "cstime",
    "priority",
    "nice",
    "num_threads",
    "itrealvalue",
    "starttime",
    "vsize",
    "rss",
    "rsslim",
    "startcode",
    "endcode",
    "startstack",
    "kstkesp",
    "kstkeip",
    "signal",
    "blocked",
    "sigignore",
    "sigcatch",
    "wchan",
    "nswap",
    "cnswap",
    "exit_signal",
    "processor",
    "rt_priority",
    "policy",
    "delayacct_blkio_ticks",
    "guest_time",
    "cguest_time",
    "start_data",
    "end_data",
    "start_brk",
    "arg_start",
    "arg_end",
    "env_start",
    "env_end",
    "exit_code",
];

/// Positional schema for /proc/<pid>/statm, in pages.
pub const PID_STATM_FIELDS: &[&str] =
    &["size", "resident", "shared", "text", "lib", "data", "dt"];

/// How one file separates metric names from values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Separator {
    Colon,
    Equals,
    Whitespace,
}

impl Separator {
    pub fn split<'a>(&self, line: &'a str) -> Option<(&'a str, &'a str)> {
        match self {
            Separator::Colon => line.split_once(':'),
            Separator::Equals => line.split_once('='),
            Separator::Whitespace => {
                let at = line.find(|c: char| c.is_ascii_whitespace())?;
                Some((&line[..at], &line[at + 1..]))
            }
        }
    }
}

/// Delimiter table for files the generic parser handles, keyed by base
/// file name. Files not listed here (and not covered by a special parser)
/// are dropped from the catalog at build time.
pub fn separator_for(base: &str) -> Option<Separator> {
    match base {
        "meminfo" | "status" | "io" | "sched" | "smaps_rollup" => Some(Separator::Colon),
        "vmstat" | "numastat" | "schedstat" | "loadavg" => Some(Separator::Whitespace),
        _ => None,
    }
}

/// Which file a metric line came from, for prefixing decisions.
pub enum SourceScope {
    GlobalProc,
    Node(u32),
    Pid(i32),
}

pub fn parse_generic(
    contents: &str,
    separator: &Separator,
    scope: &SourceScope,
    base: &str,
    allow: &AllowList,
) -> MetricMap {
    let mut out = MetricMap::new();
    for line in contents.lines() {
        let Some((raw_metric, raw_value)) = separator.split(line) else {
            continue;
        };
        let metric = raw_metric.trim();
        if metric.is_empty() || !allow.allows(metric) {
            continue;
        }
        let name = match scope {
            SourceScope::GlobalProc => metric.to_string(),
            SourceScope::Node(node) if base == "numastat" || base == "vmstat" => {
                format!("Node {} {}", node, metric)
            }
            SourceScope::Node(_) => metric.to_string(),
            SourceScope::Pid(pid) => format!("{} {}", pid, metric),
        };
        out.insert(name, numeric_or_string(raw_value));
    }
    out
}

/// Expand a metric schema to per-cpu field names: the aggregate line first
/// (`CPU user`), then one group per core (`CPU 0 user`, `CPU 1 user`, ...).
pub fn cpu_field_names(metrics: &[&str], cpu_count: usize) -> Vec<String> {
    let mut fields = Vec::with_capacity(metrics.len() * (cpu_count + 1));
    for cpu in 0..=cpu_count {
        for metric in metrics {
            if cpu == 0 {
                fields.push(format!("CPU {}", metric));
            } else {
                fields.push(format!("CPU {} {}", cpu - 1, metric));
            }
        }
    }
    fields
}

/// Parse the leading `cpu` lines of /proc/stat. Values are paired with the
/// precomputed field vector, consuming one name per column actually
/// present, so an old kernel with fewer columns emits fewer metrics.
/// Non-numeric columns are kept as strings.
pub fn parse_proc_stat(
    contents: &str,
    fields: &[String],
    nr_lines: usize,
    allowed: Option<&HashSet<String>>,
) -> MetricMap {
    let mut out = MetricMap::new();
    let mut consumed = 0usize;
    for line in contents.lines().take(nr_lines) {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        let start = consumed;
        consumed += words.len() - 1;
        let names = &fields[start.min(fields.len())..consumed.min(fields.len())];
        for (word, name) in words[1..].iter().zip(names.iter()) {
            let value = match word.parse::<i64>() {
                Ok(value) => MetricValue::Int(value),
                Err(_) => MetricValue::Str(word.to_string()),
            };
            out.insert(name.clone(), value);
        }
    }
    if let Some(allowed) = allowed {
        out.retain(|name, _| allowed.contains(name));
    }
    out
}

/// Positional parser for the single-line /proc/<pid>/stat and statm files.
pub fn parse_positional(
    contents: &str,
    schema: &[&str],
    pid: i32,
    allow: &AllowList,
) -> MetricMap {
    let line = contents.lines().next().unwrap_or("");
    let mut out = MetricMap::new();
    for (token, name) in line.split_whitespace().zip(schema.iter()) {
        if allow.allows(name) {
            out.insert(format!("{} {}", pid, name), numeric_or_string(token));
        }
    }
    out
}

/// Parser dispatch for the whole run: owns the metric spec's allow-lists
/// and the precomputed /proc/stat field vector.
pub struct Parsers {
    spec: MetricSpec,
    cpu_stat_fields: Vec<String>,
    cpu_stat_allowed: Option<HashSet<String>>,
    nr_cpu_lines: usize,
}

impl Parsers {
    pub fn new(spec: &MetricSpec, cpu_count: usize) -> Self {
        let cpu_stat_fields = cpu_field_names(PROC_STAT_CPU_FIELDS, cpu_count);
        let cpu_stat_allowed = match spec.proc_allow("stat") {
            AllowList::All => None,
            AllowList::Metrics(metrics) => {
                let bases: Vec<&str> = metrics.iter().map(String::as_str).collect();
                Some(cpu_field_names(&bases, cpu_count).into_iter().collect())
            }
        };
        Self {
            spec: spec.clone(),
            cpu_stat_fields,
            cpu_stat_allowed,
            nr_cpu_lines: cpu_count + 1,
        }
    }

    pub fn parse_global(&self, source: &GlobalSource, contents: &str) -> MetricMap {
        match &source.kind {
            GlobalKind::ProcStat => parse_proc_stat(
                contents,
                &self.cpu_stat_fields,
                self.nr_cpu_lines,
                self.cpu_stat_allowed.as_ref(),
            ),
            GlobalKind::ProcGeneric { base, separator } => parse_generic(
                contents,
                separator,
                &SourceScope::GlobalProc,
                base,
                self.spec.proc_allow(base),
            ),
            GlobalKind::NodeGeneric {
                node,
                base,
                separator,
            } => parse_generic(
                contents,
                separator,
                &SourceScope::Node(*node),
                base,
                self.spec.sys_allow(base),
            ),
        }
    }

    pub fn parse_pid_file(
        &self,
        kind: &PidKind,
        base: &str,
        pid: i32,
        contents: &str,
    ) -> MetricMap {
        match kind {
            PidKind::Stat => {
                parse_positional(contents, PID_STAT_FIELDS, pid, self.spec.pid_allow("stat"))
            }
            PidKind::Statm => parse_positional(
                contents,
                PID_STATM_FIELDS,
                pid,
                self.spec.pid_allow("statm"),
            ),
            PidKind::Generic(separator) => parse_generic(
                contents,
                separator,
                &SourceScope::Pid(pid),
                base,
                self.spec.pid_allow(base),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rstest::rstest;

    use super::*;

    const MEMINFO: &str = "MemTotal:       16384 kB\nMemFree:        8192 kB\nHugePages_Total:       0\n";

    #[test]
    fn generic_colon_separated() {
        let map = parse_generic(
            MEMINFO,
            &Separator::Colon,
            &SourceScope::GlobalProc,
            "meminfo",
            &AllowList::All,
        );
        assert_eq!(map.get("MemTotal"), Some(&MetricValue::Int(16384)));
        assert_eq!(map.get("MemFree"), Some(&MetricValue::Int(8192)));
        assert_eq!(map.get("HugePages_Total"), Some(&MetricValue::Int(0)));
    }

    #[test]
    fn generic_allow_list_filters_base_names() {
        let allow = AllowList::Metrics(BTreeSet::from(["MemFree".to_string()]));
        let map = parse_generic(
            MEMINFO,
            &Separator::Colon,
            &SourceScope::GlobalProc,
            "meminfo",
            &allow,
        );
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("MemFree"));
    }

    #[test]
    fn generic_whitespace_separated() {
        let vmstat = "nr_free_pages 81904\npgfault 2048\n";
        let map = parse_generic(
            vmstat,
            &Separator::Whitespace,
            &SourceScope::GlobalProc,
            "vmstat",
            &AllowList::All,
        );
        assert_eq!(map.get("pgfault"), Some(&MetricValue::Int(2048)));
    }

    #[test]
    fn generic_equals_separated() {
        let map = parse_generic(
            "key=3\nother=text\n",
            &Separator::Equals,
            &SourceScope::GlobalProc,
            "flags",
            &AllowList::All,
        );
        assert_eq!(map.get("key"), Some(&MetricValue::Int(3)));
        assert_eq!(
            map.get("other"),
            Some(&MetricValue::Str("text".to_string()))
        );
    }

    #[rstest]
    #[case("numastat", true)]
    #[case("vmstat", true)]
    #[case("meminfo", false)]
    fn node_prefix_only_for_colliding_files(#[case] base: &str, #[case] prefixed: bool) {
        let contents = "numa_hit 1000\n";
        let separator = separator_for(base).unwrap();
        let map = parse_generic(
            contents,
            &separator,
            &SourceScope::Node(1),
            base,
            &AllowList::All,
        );
        if prefixed {
            assert!(map.contains_key("Node 1 numa_hit"), "{:?}", map);
        } else {
            // Colon-separated meminfo will not match this line at all; use
            // a matching one to observe the unprefixed name.
            let map = parse_generic(
                "HugePages_Free:      2\n",
                &Separator::Colon,
                &SourceScope::Node(1),
                base,
                &AllowList::All,
            );
            assert!(map.contains_key("HugePages_Free"), "{:?}", map);
        }
    }

    #[test]
    fn pid_scope_prefixes_and_filters_on_base_name() {
        let status = "Name:\tsleep\nVmRSS:\t    640 kB\nVmSize:\t   2480 kB\n";
        let allow = AllowList::Metrics(BTreeSet::from(["VmRSS".to_string()]));
        let map = parse_generic(
            status,
            &Separator::Colon,
            &SourceScope::Pid(4242),
            "status",
            &allow,
        );
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("4242 VmRSS"), Some(&MetricValue::Int(640)));
    }

    const PROC_STAT: &str = "\
cpu  100 0 50 900 5 0 2 0 0 0
cpu0 60 0 30 450 3 0 1 0 0 0
cpu1 40 0 20 450 2 0 1 0 0 0
intr 95400676 0 9795
ctxt 9591503
";

    #[test]
    fn proc_stat_spreads_fields_per_cpu() {
        let fields = cpu_field_names(PROC_STAT_CPU_FIELDS, 2);
        let map = parse_proc_stat(PROC_STAT, &fields, 3, None);
        assert_eq!(map.get("CPU user"), Some(&MetricValue::Int(100)));
        assert_eq!(map.get("CPU 0 user"), Some(&MetricValue::Int(60)));
        assert_eq!(map.get("CPU 1 idle"), Some(&MetricValue::Int(450)));
        // Lines past the cpu block are never read.
        assert_eq!(map.len(), 30);
    }

    #[test]
    fn proc_stat_short_line_consumes_fewer_names() {
        // Old kernels may miss trailing columns; the parser emits whatever
        // columns are present and the next line picks up where it left off.
        let contents = "cpu 100 0 50 900 5 0 2\ncpu0 60 0 30 450 3 0 1 0 0 0\n";
        let fields = cpu_field_names(PROC_STAT_CPU_FIELDS, 1);
        let map = parse_proc_stat(contents, &fields, 2, None);
        assert_eq!(map.get("CPU softirq"), Some(&MetricValue::Int(2)));
        // The short line consumed only 7 names, so the next line starts at
        // "CPU steal" with its own first column.
        assert_eq!(map.get("CPU steal"), Some(&MetricValue::Int(60)));
        assert_eq!(map.len(), 17);
    }

    #[test]
    fn proc_stat_allow_list_expands_to_cpu_fields() {
        let fields = cpu_field_names(PROC_STAT_CPU_FIELDS, 1);
        let allowed: HashSet<String> = cpu_field_names(&["user"], 1).into_iter().collect();
        let map = parse_proc_stat(PROC_STAT, &fields, 2, Some(&allowed));
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("CPU user"));
        assert!(map.contains_key("CPU 0 user"));
    }

    const PID_STAT: &str = "55270 (wit) S 1 55270 55270 0 -1 4194368 825 0 0 0 155 102 0 0 20 0 19 0 18548522 1411293184 4397 18446744073709551615 1 1 0 0 0 0 0 4096 17987 0 0 0 17 7 0 0 0 0 0 0 0 0 0 0 0 0 0";

    #[test]
    fn pid_stat_positional_schema() {
        let map = parse_positional(PID_STAT, PID_STAT_FIELDS, 55270, &AllowList::All);
        assert_eq!(map.get("55270 pid"), Some(&MetricValue::Int(55270)));
        assert_eq!(
            map.get("55270 comm"),
            Some(&MetricValue::Str("(wit)".to_string()))
        );
        assert_eq!(
            map.get("55270 state"),
            Some(&MetricValue::Str("S".to_string()))
        );
        assert_eq!(map.get("55270 utime"), Some(&MetricValue::Int(155)));
        assert_eq!(map.get("55270 stime"), Some(&MetricValue::Int(102)));
        assert_eq!(map.get("55270 num_threads"), Some(&MetricValue::Int(19)));
    }

    #[test]
    fn pid_statm_positional_schema() {
        let map = parse_positional(
            "2500 320 280 12 0 180 0",
            PID_STATM_FIELDS,
            77,
            &AllowList::All,
        );
        assert_eq!(map.get("77 size"), Some(&MetricValue::Int(2500)));
        assert_eq!(map.get("77 resident"), Some(&MetricValue::Int(320)));
        assert_eq!(map.get("77 dt"), Some(&MetricValue::Int(0)));
        assert_eq!(map.len(), 7);
    }

    #[test]
    fn positional_allow_list() {
        let allow = AllowList::Metrics(BTreeSet::from(["utime".to_string(), "stime".to_string()]));
        let map = parse_positional(PID_STAT, PID_STAT_FIELDS, 55270, &allow);
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("55270 utime"));
        assert!(map.contains_key("55270 stime"));
    }

    #[test]
    fn parsers_dispatch_follows_the_catalog() {
        use crate::collector::catalog;

        let spec = MetricSpec::default();
        let parsers = Parsers::new(&spec, 2);
        let catalog = catalog::SourceCatalog::build(&spec, 1);
        let meminfo = catalog
            .global
            .iter()
            .find(|s| s.tag == "proc_meminfo")
            .unwrap();
        let map = parsers.parse_global(meminfo, MEMINFO);
        assert!(map.contains_key("MemTotal"));

        let stat = catalog
            .global
            .iter()
            .find(|s| s.tag == "proc_stat")
            .unwrap();
        let map = parsers.parse_global(stat, PROC_STAT);
        assert!(map.contains_key("CPU 1 user"));
    }
}
