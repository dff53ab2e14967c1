//! Run monitoring: phase timings, per-thread counters, cache residency.
//!
//! Threads accumulate into thread-local counters and the driver merges them
//! at join time; there is no synchronization on the hot path. A phase is
//! recorded only once it completes, so a failed run serializes a partial
//! record with exactly the phases that finished.

use std::collections::BTreeMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::worker::WorkerStats;

/// One completed phase: wall-clock endpoints and elapsed seconds.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    /// Seconds since the Unix epoch.
    pub start: f64,
    pub end: f64,
    pub seconds: f64,
}

/// Counters for one thread (readers and the writer).
#[derive(Debug, Clone, Serialize)]
pub struct ThreadRecord {
    pub id: String,
    #[serde(rename = "blocks-read")]
    pub blocks_read: u64,
    #[serde(rename = "bytes-read")]
    pub bytes_read: u64,
    /// Reader time suspended in publish on the look-ahead window.
    #[serde(rename = "wait-on-cache-seconds")]
    pub wait_on_cache_seconds: f64,
    /// Writer time suspended waiting for a block's contributions.
    #[serde(rename = "wait-on-queue-seconds")]
    pub wait_on_queue_seconds: f64,
}

/// Echo of the options the run was invoked with.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigRecord {
    pub numthreads: usize,
    pub blocksize: usize,
    pub driver: String,
    pub nullval: Option<f64>,
    pub resample: String,
    #[serde(rename = "output-epsg")]
    pub output_epsg: u32,
    pub xres: f64,
    pub yres: f64,
    pub bands: usize,
    #[serde(rename = "lookahead-window")]
    pub lookahead_window: usize,
    pub cpus: usize,
}

/// Shape of the static schedule.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanRecord {
    #[serde(rename = "output-blocks")]
    pub output_blocks: usize,
    #[serde(rename = "read-tasks")]
    pub read_tasks: usize,
    pub inputs: usize,
}

/// Cache residency observed over the run.
#[derive(Debug, Clone, Serialize)]
pub struct CacheRecord {
    #[serde(rename = "min-residency")]
    pub min_residency: usize,
    #[serde(rename = "max-residency")]
    pub max_residency: usize,
}

/// Single-pass statistics of one output band.
#[derive(Debug, Clone, Serialize)]
pub struct BandStatsRecord {
    pub band: usize,
    pub minimum: f64,
    pub maximum: f64,
    pub mean: f64,
    pub stddev: f64,
    /// Valid (non-nodata) pixels counted.
    pub count: u64,
}

/// The serialized monitoring record.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorRecord {
    pub phases: BTreeMap<String, PhaseRecord>,
    pub workers: Vec<ThreadRecord>,
    pub config: Option<ConfigRecord>,
    pub plan: PlanRecord,
    pub cache: CacheRecord,
    pub statistics: Vec<BandStatsRecord>,
}

impl MonitorRecord {
    /// Pretty-printed JSON for `--monitorjson`.
    ///
    /// # Errors
    /// Propagates serialization failures.
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Default, Clone)]
struct ThreadAccum {
    blocks_read: u64,
    bytes_read: u64,
    wait_on_cache: Duration,
    wait_on_queue: Duration,
}

/// Driver-owned collector, turned into a [`MonitorRecord`] at shutdown.
#[derive(Debug)]
pub struct Monitor {
    phases: BTreeMap<String, PhaseRecord>,
    open_phase: Option<(String, Instant, SystemTime)>,
    readers: Vec<ThreadAccum>,
    writer: ThreadAccum,
    config: Option<ConfigRecord>,
    plan: PlanRecord,
    /// `None` until the first band pass reports residency.
    cache_min_residency: Option<usize>,
    cache_max_residency: usize,
    statistics: Vec<BandStatsRecord>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phases: BTreeMap::new(),
            open_phase: None,
            readers: Vec::new(),
            writer: ThreadAccum::default(),
            config: None,
            plan: PlanRecord::default(),
            cache_min_residency: None,
            cache_max_residency: 0,
            statistics: Vec::new(),
        }
    }

    /// Start a phase; any phase left open is silently dropped (it did not
    /// complete).
    pub fn begin_phase(&mut self, name: &str) {
        self.open_phase = Some((name.to_string(), Instant::now(), SystemTime::now()));
    }

    /// Complete the open phase and record it.
    pub fn end_phase(&mut self) {
        let Some((name, started, wall_start)) = self.open_phase.take() else {
            return;
        };
        let seconds = started.elapsed().as_secs_f64();
        let start = epoch_seconds(wall_start);
        self.phases.insert(
            name,
            PhaseRecord {
                start,
                end: start + seconds,
                seconds,
            },
        );
    }

    pub fn set_config(&mut self, config: ConfigRecord) {
        self.readers = vec![ThreadAccum::default(); config.numthreads];
        self.config = Some(config);
    }

    pub fn set_plan(&mut self, output_blocks: usize, read_tasks: usize, inputs: usize) {
        self.plan = PlanRecord {
            output_blocks,
            read_tasks,
            inputs,
        };
    }

    /// Merge one band pass's residency into the run-wide min/max.
    pub fn note_cache_residency(&mut self, min_residency: usize, max_residency: usize) {
        self.cache_min_residency =
            Some(self.cache_min_residency.map_or(min_residency, |m| m.min(min_residency)));
        self.cache_max_residency = self.cache_max_residency.max(max_residency);
    }

    /// Merge one reader's per-band counters.
    pub fn record_reader(&mut self, worker_id: usize, stats: &WorkerStats) {
        if worker_id >= self.readers.len() {
            self.readers.resize(worker_id + 1, ThreadAccum::default());
        }
        let accum = &mut self.readers[worker_id];
        accum.blocks_read += stats.blocks_read;
        accum.bytes_read += stats.bytes_read;
        accum.wait_on_cache += stats.wait_on_cache;
    }

    /// Merge one band pass's writer wait.
    pub fn record_writer_wait(&mut self, wait: Duration) {
        self.writer.wait_on_queue += wait;
    }

    pub fn push_band_statistics(&mut self, stats: BandStatsRecord) {
        self.statistics.push(stats);
    }

    /// Freeze into the serializable record.
    #[must_use]
    pub fn into_record(self) -> MonitorRecord {
        let mut workers: Vec<ThreadRecord> = self
            .readers
            .iter()
            .enumerate()
            .map(|(i, accum)| ThreadRecord {
                id: format!("reader-{i}"),
                blocks_read: accum.blocks_read,
                bytes_read: accum.bytes_read,
                wait_on_cache_seconds: accum.wait_on_cache.as_secs_f64(),
                wait_on_queue_seconds: 0.0,
            })
            .collect();
        workers.push(ThreadRecord {
            id: "writer".to_string(),
            blocks_read: 0,
            bytes_read: 0,
            wait_on_cache_seconds: 0.0,
            wait_on_queue_seconds: self.writer.wait_on_queue.as_secs_f64(),
        });

        MonitorRecord {
            phases: self.phases,
            workers,
            config: self.config,
            plan: self.plan,
            cache: CacheRecord {
                min_residency: self.cache_min_residency.unwrap_or(0),
                max_residency: self.cache_max_residency,
            },
            statistics: self.statistics,
        }
    }
}

fn epoch_seconds(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
