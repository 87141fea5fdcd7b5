//
// SPDX-License-Identifier: MIT
// See LICENSE for details
//! Post-run aggregation: merge the flushed fragments into one canonical,
//! time-aligned result.
//!
//! The pass runs once, at end of run:
//!
//! 1. **Merge** all `tmpresult_<N>.json` fragments in counter order.
//!    Timestamps and `all_pids` concatenate; per-tag sample maps take the
//!    union with last-writer-wins per `(tag, timestamp, metric)`.
//! 2. **Clean** tags that never produced a sample.
//! 3. **Sort**: the timestamp axis becomes `sorted(unique(...))` and tags
//!    are reordered into `[proc, node-sys, per-pid]` category order so any
//!    fragment ordering yields identical output.
//! 4. **Densify** every metric to the full axis: carry interior gaps
//!    forward (bounded back-search), fill outside a tag's sampled window
//!    with the metric's typed placeholder.
//! 5. **Offset** monotonic counters to a zero baseline and record the
//!    subtracted primaries in side-car files.
//!
//! Fragments are deleted only after the consolidated result is on disk.
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use eyre::{eyre, Context, Result};
use itertools::Itertools;
use log::{debug, warn};
use serde_json::{json, Map, Value};

use crate::collector::buffer::{keys, TMP_RESULT_PREFIX};
use crate::collector::catalog::{classify, tag_pid, TagKind};
use crate::metrics::{MetricMap, MetricValue};

mod csv;
mod offset;

/// tag -> timestamp -> parsed sample.
type SeriesTable = BTreeMap<String, BTreeMap<String, MetricMap>>;
/// tag -> metric -> values aligned 1:1 with the sorted timestamp axis.
pub(crate) type DenseTable = BTreeMap<String, BTreeMap<String, Vec<MetricValue>>>;

const OFFSET_PRIMARY_FILE: &str = "offset_primary.json";
const OFFSET_FLAGS_FILE: &str = "offset.json";

#[derive(Default)]
struct RawMerge {
    timestamps: Vec<String>,
    all_pids: Vec<Value>,
    meta: Map<String, Value>,
    series: SeriesTable,
}

struct Merged {
    axis: Vec<String>,
    meta: Map<String, Value>,
    all_pids: Vec<Value>,
    /// Category-ordered: global proc tags, node-sys tags, per-pid tags.
    tags: Vec<String>,
    dense: DenseTable,
    /// First observed value per metric; the placeholder type source and
    /// the offset side-car content.
    primary: BTreeMap<String, MetricMap>,
}

pub struct Aggregator {
    dir: PathBuf,
}

impl Aggregator {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn run(
        &self,
        output_file_name: &str,
        ignore_offset: bool,
        csv_result: bool,
    ) -> Result<PathBuf> {
        let fragments = self.fragment_paths()?;
        if fragments.is_empty() {
            return Err(eyre!("No result fragments in {}", self.dir.display()));
        }
        debug!("Aggregating {} fragments", fragments.len());

        let raw = merge_fragments(&fragments)?;
        let mut merged = reduce(raw);

        let offsets = if ignore_offset {
            None
        } else {
            Some(self.apply_offsets(&mut merged)?)
        };

        let output_path = self.dir.join(format!("{}.json", output_file_name));
        let doc = assemble(&merged, offsets.as_ref());
        fs::write(&output_path, serde_json::to_vec_pretty(&doc)?)
            .wrap_err_with(|| eyre!("Unable to write {}", output_path.display()))?;

        if csv_result {
            let csv_path = self.dir.join(format!("{}.csv", output_file_name));
            csv::write_csv(&csv_path, &merged.axis, &merged.tags, &merged.dense)?;
        }

        self.remove_fragments()?;
        Ok(output_path)
    }

    fn fragment_paths(&self) -> Result<Vec<PathBuf>> {
        let mut indexed: Vec<(u32, PathBuf)> = fs::read_dir(&self.dir)
            .wrap_err_with(|| eyre!("Unable to list {}", self.dir.display()))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                fragment_index(&name).map(|index| (index, entry.path()))
            })
            .collect();
        indexed.sort();
        Ok(indexed.into_iter().map(|(_, path)| path).collect())
    }

    /// Classify every `(tag, metric)` column, subtract the baseline from
    /// the offsetable ones and write both side-car files. Returns the
    /// per-tag map of subtracted primaries for the main output.
    fn apply_offsets(&self, merged: &mut Merged) -> Result<BTreeMap<String, MetricMap>> {
        let mut flags: BTreeMap<String, BTreeMap<String, bool>> = BTreeMap::new();
        let mut applied: BTreeMap<String, MetricMap> = BTreeMap::new();

        for tag in &merged.tags {
            let Some(columns) = merged.dense.get_mut(tag) else {
                continue;
            };
            let primaries = &merged.primary[tag.as_str()];
            let tag_flags = flags.entry(tag.clone()).or_default();
            let tag_applied = applied.entry(tag.clone()).or_default();
            for (metric, column) in columns.iter_mut() {
                let Some(primary) = primaries.get(metric) else {
                    continue;
                };
                let offsetable = offset::is_offsetable(column, primary);
                tag_flags.insert(metric.clone(), offsetable);
                if offsetable && offset::offset_column(column).is_some() {
                    tag_applied.insert(metric.clone(), primary.clone());
                }
            }
        }

        let primary_path = self.dir.join(OFFSET_PRIMARY_FILE);
        fs::write(&primary_path, serde_json::to_vec_pretty(&merged.primary)?)
            .wrap_err_with(|| eyre!("Unable to write {}", primary_path.display()))?;
        let flags_path = self.dir.join(OFFSET_FLAGS_FILE);
        fs::write(&flags_path, serde_json::to_vec_pretty(&flags)?)
            .wrap_err_with(|| eyre!("Unable to write {}", flags_path.display()))?;

        Ok(applied)
    }

    fn remove_fragments(&self) -> Result<()> {
        for path in self.fragment_paths()? {
            fs::remove_file(&path)
                .wrap_err_with(|| eyre!("Unable to remove fragment {}", path.display()))?;
        }
        Ok(())
    }
}

fn fragment_index(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix(TMP_RESULT_PREFIX)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

fn merge_fragments(paths: &[PathBuf]) -> Result<RawMerge> {
    let mut raw = RawMerge::default();
    for path in paths {
        let file =
            File::open(path).wrap_err_with(|| eyre!("Unable to open {}", path.display()))?;
        let doc: Value = serde_json::from_reader(BufReader::new(file))
            .wrap_err_with(|| eyre!("Unable to parse fragment {}", path.display()))?;
        let Value::Object(entries) = doc else {
            warn!("Fragment {} is not an object, skipping", path.display());
            continue;
        };
        for (key, value) in entries {
            if key == keys::TIMESTAMPS {
                if let Value::Array(items) = value {
                    raw.timestamps
                        .extend(items.iter().filter_map(|v| v.as_str().map(str::to_string)));
                }
            } else if key == keys::ALL_PIDS {
                if let Value::Array(items) = value {
                    raw.all_pids.extend(items);
                }
            } else if classify(&key).is_some() {
                merge_series(&mut raw.series, key, value);
            } else {
                // Run metadata and one-shot readings pass through; the
                // first fragment that carries a key wins.
                raw.meta.entry(key).or_insert(value);
            }
        }
    }
    Ok(raw)
}

fn merge_series(series: &mut SeriesTable, tag: String, value: Value) {
    // Stored shape: [ { ts -> [ metric map ] } ].
    let inner = match value {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        _ => {
            warn!("Unexpected container shape for {}, skipping", tag);
            return;
        }
    };
    let Value::Object(by_ts) = inner else {
        warn!("Unexpected sample map for {}, skipping", tag);
        return;
    };
    let target = series.entry(tag).or_default();
    for (ts, cell) in by_ts {
        let cell = match cell {
            Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            _ => continue,
        };
        let Value::Object(metrics) = cell else {
            continue;
        };
        let slot = target.entry(ts).or_default();
        for (metric, value) in metrics {
            match serde_json::from_value::<MetricValue>(value) {
                Ok(parsed) => {
                    slot.insert(metric, parsed);
                }
                Err(e) => debug!("Skipping non-scalar metric {}: {}", metric, e),
            }
        }
    }
}

/// Order tags as `[proc, node-sys, per-pid]`, each category sorted (pid
/// tags numerically by pid) so the output is deterministic regardless of
/// fragment ordering.
fn order_tags(series: &SeriesTable) -> Vec<String> {
    let mut proc_tags = Vec::new();
    let mut node_tags = Vec::new();
    let mut pid_tags: Vec<(i64, String)> = Vec::new();
    for tag in series.keys() {
        match classify(tag) {
            Some(TagKind::Proc) => proc_tags.push(tag.clone()),
            Some(TagKind::NodeSys) => node_tags.push(tag.clone()),
            Some(TagKind::PidProc) => {
                pid_tags.push((tag_pid(tag).unwrap_or(i64::MAX), tag.clone()))
            }
            None => {}
        }
    }
    proc_tags.sort();
    node_tags.sort();
    pid_tags.sort();
    proc_tags
        .into_iter()
        .chain(node_tags)
        .chain(pid_tags.into_iter().map(|(_, tag)| tag))
        .collect()
}

fn reduce(raw: RawMerge) -> Merged {
    let mut series = raw.series;
    series.retain(|_, by_ts| !by_ts.is_empty());

    let axis: Vec<String> = raw.timestamps.iter().cloned().sorted().dedup().collect();
    let tags = order_tags(&series);
    let back_search_limit = axis.len() / 2;

    let mut dense = DenseTable::new();
    let mut primary = BTreeMap::new();

    for (tag, by_ts) in &series {
        // Samples are keyed by canonical timestamps, so BTreeMap order is
        // chronological: first/last keys bound the tag's sampled window.
        let (Some(first_ts), Some(last_ts)) = (by_ts.keys().next(), by_ts.keys().next_back())
        else {
            continue;
        };

        let mut primaries = MetricMap::new();
        for metrics in by_ts.values() {
            for (metric, value) in metrics {
                primaries
                    .entry(metric.clone())
                    .or_insert_with(|| value.clone());
            }
        }

        let mut columns: BTreeMap<String, Vec<MetricValue>> = primaries
            .keys()
            .map(|metric| (metric.clone(), Vec::with_capacity(axis.len())))
            .collect();

        for (index, ts) in axis.iter().enumerate() {
            let sample = by_ts.get(ts);
            for (metric, column) in columns.iter_mut() {
                if let Some(value) = sample.and_then(|s| s.get(metric)) {
                    column.push(value.clone());
                    continue;
                }
                let interior = first_ts.as_str() <= ts.as_str() && ts.as_str() <= last_ts.as_str();
                let carried = if interior {
                    // Interior gap: walk back along the axis for the most
                    // recent sample of this metric. A search that would
                    // step past the axis head just gives up.
                    (1..=back_search_limit).find_map(|steps| {
                        index
                            .checked_sub(steps)
                            .and_then(|at| by_ts.get(&axis[at]))
                            .and_then(|s| s.get(metric))
                            .cloned()
                    })
                } else {
                    None
                };
                match carried {
                    Some(value) => column.push(value),
                    None => column.push(
                        primaries
                            .get(metric)
                            .expect("columns built from primaries")
                            .placeholder(),
                    ),
                }
            }
        }
        dense.insert(tag.clone(), columns);
        primary.insert(tag.clone(), primaries);
    }

    Merged {
        axis,
        meta: raw.meta,
        all_pids: raw.all_pids,
        tags,
        dense,
        primary,
    }
}

/// Build the consolidated document: metadata first, then the sorted axis,
/// then every tag as `[metrics_dense]` or `[metrics_dense, {offset_value}]`.
fn assemble(merged: &Merged, offsets: Option<&BTreeMap<String, MetricMap>>) -> Value {
    let mut doc = Map::new();
    for (key, value) in &merged.meta {
        doc.insert(key.clone(), value.clone());
    }
    doc.insert(keys::TIMESTAMPS.to_string(), json!(merged.axis));
    if !merged.all_pids.is_empty() {
        doc.insert(
            keys::ALL_PIDS.to_string(),
            Value::Array(merged.all_pids.clone()),
        );
    }
    for tag in &merged.tags {
        let columns = &merged.dense[tag.as_str()];
        let value = match offsets {
            Some(applied) => {
                let tag_offsets = applied.get(tag).cloned().unwrap_or_default();
                let mut sidecar = Map::new();
                sidecar.insert(keys::OFFSET_VALUE.to_string(), json!(tag_offsets));
                json!([columns, sidecar])
            }
            None => json!([columns]),
        };
        doc.insert(tag.clone(), value);
    }
    Value::Object(doc)
}
