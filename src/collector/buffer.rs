//
// SPDX-License-Identifier: MIT
// See LICENSE for details
//! In-memory sample buffer and size-bounded fragment flushing.
//!
//! Samples accumulate in a [`BufferSlice`] keyed `(tag, timestamp)`. When
//! the serialized size estimate crosses the flush limit the slice is
//! swapped out wholesale and written to `tmpresult_<N>.json` on a
//! background thread, so flushing never extends inter-tick latency. The
//! aggregator merges the fragments back together after the run.
//!
//! Fragments keep the historical container shape: every per-tag value is a
//! one-element list wrapping the `timestamp -> [metric map]` object. The
//! wrappers are applied here, at the serialization boundary only.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use log::warn;
use serde_json::{json, Map, Value};

use crate::metrics::{MetricMap, MetricValue};

pub const TMP_RESULT_PREFIX: &str = "tmpresult_";

/// Reserved top-level keys of a fragment. Everything else is either a
/// source tag or a hugepage one-shot reading.
pub mod keys {
    pub const TIMESTAMPS: &str = "timestamps";
    pub const ALL_PIDS: &str = "all_pids";
    pub const SYSTEM_CONFIGURATION: &str = "system configuration";
    pub const SAMPLE_PERIOD: &str = "sample_period";
    pub const NR_SAMPLES: &str = "nr_samples";
    pub const OFFSET: &str = "offset";
    pub const OFFSET_VALUE: &str = "offset_value";
    pub const FILE_TYPE: &str = "file_type";
}

/// One in-memory window of collected samples.
#[derive(Default)]
pub struct BufferSlice {
    pub timestamps: Vec<String>,
    /// Run metadata and one-shot readings, in insertion order. Only the
    /// first slice of a run carries metadata; later slices start fresh.
    pub meta: Map<String, Value>,
    pub series: BTreeMap<String, BTreeMap<String, MetricMap>>,
}

impl BufferSlice {
    pub fn to_json(&self) -> Value {
        let mut doc = Map::new();
        for (key, value) in &self.meta {
            doc.insert(key.clone(), value.clone());
        }
        doc.insert(keys::TIMESTAMPS.to_string(), json!(self.timestamps));
        for (tag, by_ts) in &self.series {
            let mut inner = Map::new();
            for (ts, metrics) in by_ts {
                inner.insert(ts.clone(), json!([metrics]));
            }
            doc.insert(tag.clone(), Value::Array(vec![Value::Object(inner)]));
        }
        Value::Object(doc)
    }
}

fn value_weight(value: &MetricValue) -> usize {
    match value {
        MetricValue::Int(_) => 20,
        MetricValue::Float(_) => 24,
        MetricValue::Str(s) => s.len() + 2,
    }
}

/// Buffer with an incrementally maintained serialized-size estimate. The
/// estimate is the sum of key and value byte lengths plus per-entry
/// overhead, recalibrated against a real serialization once enough inserts
/// have accumulated; a full measurement per tick would be quadratic over a
/// long run.
pub struct SampleBuffer {
    slice: BufferSlice,
    estimated_bytes: usize,
    inserts_since_calibration: usize,
}

const ENTRY_OVERHEAD: usize = 8;
const CALIBRATION_INSERTS: usize = 100_000;

impl SampleBuffer {
    pub fn new() -> Self {
        Self {
            slice: BufferSlice::default(),
            estimated_bytes: 0,
            inserts_since_calibration: 0,
        }
    }

    pub fn set_meta(&mut self, key: &str, value: Value) {
        self.estimated_bytes += key.len() + value.to_string().len() + ENTRY_OVERHEAD;
        self.slice.meta.insert(key.to_string(), value);
    }

    pub fn push_timestamp(&mut self, ts: &str) {
        self.estimated_bytes += ts.len() + ENTRY_OVERHEAD;
        self.slice.timestamps.push(ts.to_string());
    }

    pub fn timestamps(&self) -> &[String] {
        &self.slice.timestamps
    }

    /// Register a tag so it appears in the fragment even if no read for it
    /// ever succeeds; the aggregator drops tags that stay empty.
    pub fn ensure_tag(&mut self, tag: &str) {
        if !self.slice.series.contains_key(tag) {
            self.estimated_bytes += tag.len() + ENTRY_OVERHEAD;
            self.slice.series.insert(tag.to_string(), BTreeMap::new());
        }
    }

    /// Store one parsed sample. An empty map means the file vanished for
    /// this tick: the timestamp is left out entirely so the aggregator's
    /// gap-fill sees a missing sample rather than an empty one.
    pub fn insert(&mut self, tag: &str, ts: &str, metrics: MetricMap) {
        self.ensure_tag(tag);
        if metrics.is_empty() {
            return;
        }
        self.estimated_bytes += ts.len() + ENTRY_OVERHEAD;
        for (name, value) in &metrics {
            self.estimated_bytes += name.len() + value_weight(value) + ENTRY_OVERHEAD;
        }
        self.inserts_since_calibration += 1;
        self.slice
            .series
            .get_mut(tag)
            .expect("tag registered above")
            .insert(ts.to_string(), metrics);
    }

    pub fn estimated_bytes(&mut self) -> usize {
        if self.inserts_since_calibration >= CALIBRATION_INSERTS {
            self.inserts_since_calibration = 0;
            if let Ok(exact) = serde_json::to_vec(&self.slice.to_json()) {
                self.estimated_bytes = exact.len();
            }
        }
        self.estimated_bytes
    }

    /// Swap the current slice out for a fresh one; the caller owns the
    /// returned slice (typically to hand it to the fragment writer).
    pub fn take_slice(&mut self) -> BufferSlice {
        self.estimated_bytes = 0;
        self.inserts_since_calibration = 0;
        std::mem::take(&mut self.slice)
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes numbered fragments on background threads. The sampler never
/// waits on a write; the run controller joins all writers before the
/// aggregator reads the fragments back.
pub struct FragmentWriter {
    dir: PathBuf,
    counter: u32,
    writers: Vec<JoinHandle<()>>,
}

impl FragmentWriter {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            counter: 0,
            writers: Vec::new(),
        }
    }

    pub fn flush(&mut self, slice: BufferSlice) {
        let path = self
            .dir
            .join(format!("{}{}.json", TMP_RESULT_PREFIX, self.counter));
        self.counter += 1;
        let writer = thread::Builder::new()
            .name("fragment-writer".to_string())
            .spawn(move || match serde_json::to_vec_pretty(&slice.to_json()) {
                Ok(bytes) => {
                    if let Err(e) = fs::write(&path, bytes) {
                        warn!(
                            "Unable to write fragment {}, samples lost: {}",
                            path.display(),
                            e
                        );
                    }
                }
                Err(e) => warn!("Unable to serialize fragment: {}", e),
            });
        match writer {
            Ok(handle) => self.writers.push(handle),
            Err(e) => warn!("Unable to spawn fragment writer: {}", e),
        }
    }

    /// Wait for all outstanding fragment writes to land on disk.
    pub fn wait(&mut self) {
        for writer in self.writers.drain(..) {
            let _ = writer.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pairs: &[(&str, MetricValue)]) -> MetricMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn fragment_shape_keeps_legacy_wrappers() {
        let mut buffer = SampleBuffer::new();
        buffer.set_meta(keys::SAMPLE_PERIOD, json!(0.5));
        buffer.push_timestamp("2024_05_01_10_00_00_000000");
        buffer.insert(
            "proc_meminfo",
            "2024_05_01_10_00_00_000000",
            sample(&[("MemFree", MetricValue::Int(8192))]),
        );

        let doc = buffer.take_slice().to_json();
        assert_eq!(doc["sample_period"], json!(0.5));
        assert_eq!(doc["timestamps"], json!(["2024_05_01_10_00_00_000000"]));
        // tag -> [ { ts -> [ metric map ] } ]
        assert_eq!(
            doc["proc_meminfo"],
            json!([{"2024_05_01_10_00_00_000000": [{"MemFree": 8192}]}])
        );
    }

    #[test]
    fn empty_samples_leave_no_timestamp_entry() {
        let mut buffer = SampleBuffer::new();
        buffer.insert("proc_vmstat", "ts0", MetricMap::new());
        let doc = buffer.take_slice().to_json();
        assert_eq!(doc["proc_vmstat"], json!([{}]));
    }

    #[test]
    fn estimate_grows_with_inserts() {
        let mut buffer = SampleBuffer::new();
        let before = buffer.estimated_bytes();
        buffer.insert(
            "proc_meminfo",
            "2024_05_01_10_00_00_000000",
            sample(&[("MemFree", MetricValue::Int(8192))]),
        );
        assert!(buffer.estimated_bytes() > before);
    }

    #[test]
    fn take_slice_resets_the_buffer() {
        let mut buffer = SampleBuffer::new();
        buffer.push_timestamp("ts0");
        buffer.insert("proc_meminfo", "ts0", sample(&[("A", MetricValue::Int(1))]));
        let slice = buffer.take_slice();
        assert_eq!(slice.timestamps.len(), 1);
        assert_eq!(buffer.estimated_bytes(), 0);
        assert!(buffer.timestamps().is_empty());
    }

    #[test]
    fn fragments_are_numbered_in_flush_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FragmentWriter::new(dir.path());

        let mut buffer = SampleBuffer::new();
        buffer.push_timestamp("ts0");
        writer.flush(buffer.take_slice());
        buffer.push_timestamp("ts1");
        writer.flush(buffer.take_slice());
        writer.wait();

        let frag0: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("tmpresult_0.json")).unwrap())
                .unwrap();
        let frag1: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("tmpresult_1.json")).unwrap())
                .unwrap();
        assert_eq!(frag0["timestamps"], json!(["ts0"]));
        assert_eq!(frag1["timestamps"], json!(["ts1"]));
    }
}
