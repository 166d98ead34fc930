//! Merges the native samples and the power readings into a single timeline.
//!
//! The timeline is made of contiguous buckets of fixed duration, counted from
//! the beginning of the run. The native counters are cumulative: their value is
//! linearly interpolated at each bucket boundary, and the usage of a bucket is
//! the difference between its two boundaries. Power readings are attributed to
//! the bucket that contains their time.
//!
//! A bucket is closed (and never modified again) once the native samples cover
//! its end and the latest sample is more than `lateness` after its end. Readings
//! that arrive for a closed bucket are dropped and counted as late.
//!
//! The counters are only known within half an interval of a sample. Before the
//! first sample of a sampler and after its last one, the boundaries have no
//! value and the buckets there have no native metrics.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::adapter::reading::Anomaly;
use crate::machine::MachineRecord;
use crate::measurement::{NativeMetric, PowerReading, Timestamp};
use crate::record::{AdapterSession, Degradation, Diagnostics, ReadingStats, Run, RunRecord, Summary, TimeRecord};
use crate::sampler::NativeSample;

mod power;

use power::SourceReadings;

/// Capacity of the channel between the producers and the merger task.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// An input of the merger.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeEvent {
    /// Native counters, from the sampler.
    Sample(NativeSample),
    /// A validated power reading, from the hub.
    Reading(PowerReading),
    /// A reading was dropped or is unusual. `source_id` is `None` when the message
    /// could not be decoded.
    Anomaly {
        source_id: Option<String>,
        anomaly: Anomaly,
    },
    /// A native counter could not be read.
    CounterError(NativeMetric),
    Degraded(Degradation),
    /// Summary of a connection to an adapter, sent when the connection task stops.
    AdapterSession(AdapterSession),
}

/// The result of [`Merger::finalize`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutput {
    pub time_records: Vec<TimeRecord>,
    pub summary: Summary,
    pub power_sources: BTreeSet<String>,
    pub degradations: Vec<Degradation>,
    pub diagnostics: Diagnostics,
}

impl MergeOutput {
    pub fn into_record(self, run: Run, machine: MachineRecord, interval: Duration) -> RunRecord {
        RunRecord {
            run,
            machine,
            interval,
            power_sources: self.power_sources,
            summary: self.summary,
            degradations: self.degradations,
            diagnostics: self.diagnostics,
            time_records: self.time_records,
        }
    }
}

/// Values of the native counters, indexed by `NativeMetric as usize`, followed by
/// the total CPU time of the machine. CPU times are in seconds, memory in bytes.
pub(crate) type Values = [Option<f64>; NativeMetric::ALL.len() + 1];

/// Index of the total CPU time of the machine in [`Values`].
pub(crate) const SYSTEM_CPU_TOTAL: usize = NativeMetric::ALL.len();

pub(crate) const NO_VALUES: Values = [None; NativeMetric::ALL.len() + 1];

#[derive(Default)]
struct PendingBucket {
    /// Highest resident memory in the samples taken during the bucket.
    resident: Option<f64>,
    power: BTreeMap<String, SourceReadings>,
}

pub struct Merger {
    start: Timestamp,
    interval: Duration,
    lateness: Duration,
    power_sources: BTreeSet<String>,

    /// Values of the counters at the boundaries that have been reached but not closed.
    boundaries: BTreeMap<u64, Values>,
    next_boundary: u64,
    last_sample: Option<(Duration, Values)>,

    pending: BTreeMap<u64, PendingBucket>,
    closed: Vec<TimeRecord>,
    /// Last value of each cumulative energy counter, in the closed buckets.
    energy_counters: FxHashMap<String, f64>,

    degradations: Vec<Degradation>,
    diagnostics: Diagnostics,
}

impl Merger {
    /// Creates a merger for a run that started at `start`.
    ///
    /// `expected_sources` are the power sources that should appear in the record;
    /// they are reported as unavailable if they send nothing.
    pub fn new(start: Timestamp, interval: Duration, lateness: Duration, expected_sources: BTreeSet<String>) -> Self {
        debug_assert!(!interval.is_zero(), "the interval must not be zero");
        Self {
            start,
            interval: interval.max(Duration::from_nanos(1)),
            lateness,
            power_sources: expected_sources,
            boundaries: BTreeMap::new(),
            next_boundary: 0,
            last_sample: None,
            pending: BTreeMap::new(),
            closed: Vec::new(),
            energy_counters: FxHashMap::default(),
            degradations: Vec::new(),
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The buckets that have been closed so far.
    pub fn closed(&self) -> &[TimeRecord] {
        &self.closed
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn degradations(&self) -> &[Degradation] {
        &self.degradations
    }

    /// The record of the buckets closed so far, leaving the merger untouched.
    pub fn snapshot(&self) -> MergeOutput {
        let time_records = self.closed.clone();
        let summary = Summary::compute(&time_records, &self.power_sources);
        MergeOutput {
            time_records,
            summary,
            power_sources: self.power_sources.clone(),
            degradations: self.degradations.clone(),
            diagnostics: self.diagnostics.clone(),
        }
    }

    pub fn apply(&mut self, event: MergeEvent) {
        match event {
            MergeEvent::Sample(sample) => self.push_sample(sample),
            MergeEvent::Reading(reading) => self.push_reading(reading),
            MergeEvent::Anomaly { source_id, anomaly } => self.push_anomaly(source_id, anomaly),
            MergeEvent::CounterError(metric) => {
                *self
                    .diagnostics
                    .counter_errors
                    .entry(metric.as_str().to_owned())
                    .or_default() += 1;
            }
            MergeEvent::Degraded(degradation) => self.degrade(degradation),
            MergeEvent::AdapterSession(session) => {
                self.power_sources.extend(session.sources.iter().cloned());
                self.diagnostics.adapters.push(session);
            }
        }
    }

    /// Records a degradation (once).
    pub fn degrade(&mut self, degradation: Degradation) {
        if let Degradation::AdapterUnavailable { sources, .. } = &degradation {
            self.power_sources.extend(sources.iter().cloned());
        }
        if !self.degradations.contains(&degradation) {
            self.degradations.push(degradation);
        }
    }

    fn stats(&mut self, source_id: &str) -> &mut ReadingStats {
        self.diagnostics.readings.entry(source_id.to_owned()).or_default()
    }

    fn push_anomaly(&mut self, source_id: Option<String>, anomaly: Anomaly) {
        let Some(source_id) = source_id else {
            self.diagnostics.malformed_messages += 1;
            return;
        };
        let stats = self.stats(&source_id);
        match anomaly {
            Anomaly::Duplicate => stats.duplicates += 1,
            Anomaly::Reordered => stats.reordered += 1,
            Anomaly::Missing(n) => stats.missing += n,
            Anomaly::Malformed(_) => stats.malformed += 1,
        }
    }

    fn push_sample(&mut self, sample: NativeSample) {
        let offset = sample.offset;
        let observed = sample.values();
        let values = match self.last_sample {
            Some((last_offset, _)) if offset < last_offset => {
                log::debug!(
                    "ignoring a native sample that is older than the previous one: {offset:?} < {last_offset:?}"
                );
                return;
            }
            Some((last_offset, last)) if !sample.baseline => {
                // a counter that could not be read keeps its last value
                let mut held = observed;
                for (v, prev) in held.iter_mut().zip(last) {
                    *v = v.or(prev);
                }
                while self.boundary(self.next_boundary) <= offset {
                    let at = self.boundary(self.next_boundary);
                    let interpolated = interpolate((last_offset, &last), (offset, &held), at);
                    self.boundaries.insert(self.next_boundary, interpolated);
                    self.next_boundary += 1;
                }
                held
            }
            previous => {
                // first sample of a sampler: nothing is known between the previous sampler and this one
                let grace = self.grace();
                while self.boundary(self.next_boundary) <= offset {
                    let at = self.boundary(self.next_boundary);
                    let values = match previous {
                        _ if offset - at <= grace => observed,
                        Some((last_offset, last)) if at.saturating_sub(last_offset) <= grace => last,
                        _ => NO_VALUES,
                    };
                    self.boundaries.insert(self.next_boundary, values);
                    self.next_boundary += 1;
                }
                observed
            }
        };

        let index = self.index_of(offset);
        if index >= self.closed.len() as u64 {
            if let Some(resident) = observed[NativeMetric::Resident as usize] {
                let bucket = self.pending.entry(index).or_default();
                bucket.resident = max_value(bucket.resident, Some(resident));
            }
        }
        self.last_sample = Some((offset, values));
        self.close_ready();
    }

    fn push_reading(&mut self, reading: PowerReading) {
        self.power_sources.insert(reading.source_id.clone());
        let Some(offset) = reading.time.duration_since(self.start) else {
            self.stats(&reading.source_id).dropped_before_start += 1;
            return;
        };
        let index = self.index_of(offset);
        if index < self.closed.len() as u64 {
            log::debug!(
                "dropping a late reading of {} at {offset:?}: bucket {index} is closed",
                reading.source_id
            );
            self.stats(&reading.source_id).dropped_late += 1;
            return;
        }
        let kind = reading.measure.kind();
        let readings = self
            .pending
            .entry(index)
            .or_default()
            .power
            .entry(reading.source_id.clone())
            .or_insert_with(|| SourceReadings::new(kind));
        if readings.kind != kind {
            self.stats(&reading.source_id).malformed += 1;
            return;
        }
        readings.values.push((offset, reading.measure.value()));
    }

    /// Closes the buckets that are complete.
    fn close_ready(&mut self) {
        let Some((watermark, _)) = self.last_sample else {
            return;
        };
        loop {
            let k = self.closed.len() as u64;
            let end = self.boundary(k + 1);
            let Some(end_values) = self.boundaries.get(&(k + 1)).copied() else {
                break;
            };
            if watermark < end + self.lateness {
                break;
            }
            self.close_bucket(k, end, end_values);
        }
    }

    /// Closes bucket `k`, which ends at offset `end`.
    fn close_bucket(&mut self, k: u64, end: Duration, end_values: Values) {
        let start = self.boundary(k);
        let duration = end - start;
        let start_values = self.boundaries.remove(&k).unwrap_or_else(|| self.trailing_values(start));
        let pending = self.pending.remove(&k).unwrap_or_default();

        let delta = |i: usize| match (start_values[i], end_values[i]) {
            (Some(a), Some(b)) => Some(b - a),
            _ => None,
        };
        let cpu = |metric: NativeMetric| delta(metric as usize);
        let resident = [
            pending.resident,
            start_values[NativeMetric::Resident as usize],
            end_values[NativeMetric::Resident as usize],
        ]
        .into_iter()
        .fold(None, max_value);
        let peak_resident = end_values[NativeMetric::PeakResident as usize];
        let system_utilization = match (cpu(NativeMetric::SystemCpu), delta(SYSTEM_CPU_TOTAL)) {
            (Some(busy), Some(total)) if total > 0.0 => Some((busy / total).clamp(0.0, 1.0)),
            _ => None,
        };

        let mut power = BTreeMap::new();
        for (source_id, mut readings) in pending.power {
            let after_end = readings.truncate_at(end);
            let n = readings.values.len() as u64;
            let counter = self.energy_counters.get(&source_id).copied();
            let mut updated = counter;
            let energy = readings.energy(duration, &mut updated);
            if let Some(value) = updated {
                self.energy_counters.insert(source_id.clone(), value);
            }
            let stats = self.stats(&source_id);
            stats.dropped_after_end += after_end;
            stats.accepted += n;
            if let Some(energy) = energy {
                stats.counter_resets += energy.counter_resets;
                power.insert(source_id, energy.sample);
            }
        }

        self.closed.push(TimeRecord {
            index: k,
            start,
            duration,
            timestamp: self.start.offset_by(start),
            cpu_user: cpu(NativeMetric::CpuUser),
            cpu_system: cpu(NativeMetric::CpuSystem),
            resident: resident.map(to_bytes),
            peak_resident: peak_resident.map(to_bytes),
            system_utilization,
            power,
        });
    }

    /// Closes every remaining bucket of a run that lasted `elapsed`.
    ///
    /// The last bucket is shorter than the interval if `elapsed` is not a multiple of it.
    /// Readings at or after `elapsed` are dropped. The merger is left empty.
    pub fn finalize(&mut self, elapsed: Duration) -> Result<MergeOutput, String> {
        let n = bucket_count(elapsed, self.interval);
        let closed = self.closed.len() as u64;
        if closed > n {
            return Err(format!("{closed} buckets have been closed but the run only lasted {elapsed:?}"));
        }
        for k in closed..n {
            let full_end = self.boundary(k + 1);
            let end = full_end.min(elapsed);
            let end_values = match self.boundaries.get(&(k + 1)) {
                Some(values) if full_end <= elapsed => *values,
                _ => self.trailing_values(end),
            };
            self.close_bucket(k, end, end_values);
        }

        for (_, bucket) in std::mem::take(&mut self.pending) {
            for (source_id, readings) in bucket.power {
                self.stats(&source_id).dropped_after_end += readings.values.len() as u64;
            }
        }
        self.boundaries.clear();

        let time_records = std::mem::take(&mut self.closed);
        let summary = Summary::compute(&time_records, &self.power_sources);
        Ok(MergeOutput {
            time_records,
            summary,
            power_sources: std::mem::take(&mut self.power_sources),
            degradations: std::mem::take(&mut self.degradations),
            diagnostics: std::mem::take(&mut self.diagnostics),
        })
    }

    /// Offset of the beginning of bucket `k`.
    fn boundary(&self, k: u64) -> Duration {
        duration_from_nanos(self.interval.as_nanos() * u128::from(k))
    }

    fn index_of(&self, offset: Duration) -> u64 {
        (offset.as_nanos() / self.interval.as_nanos()) as u64
    }

    /// How far from a sample the counters are still considered known.
    fn grace(&self) -> Duration {
        self.interval / 2
    }

    /// The values of the counters at offset `at`, after the last sample.
    fn trailing_values(&self, at: Duration) -> Values {
        match self.last_sample {
            Some((offset, values)) if at.saturating_sub(offset) <= self.grace() => values,
            _ => NO_VALUES,
        }
    }
}

/// Number of buckets of a run that lasted `elapsed`.
pub fn bucket_count(elapsed: Duration, interval: Duration) -> u64 {
    elapsed.as_nanos().div_ceil(interval.as_nanos()) as u64
}

fn duration_from_nanos(nanos: u128) -> Duration {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    Duration::new((nanos / NANOS_PER_SEC) as u64, (nanos % NANOS_PER_SEC) as u32)
}

/// Linear interpolation of each counter at time `t`, between two samples.
fn interpolate(a: (Duration, &Values), b: (Duration, &Values), t: Duration) -> Values {
    let (t0, v0) = a;
    let (t1, v1) = b;
    let span = t1.saturating_sub(t0).as_secs_f64();
    let ratio = if span > 0.0 {
        t.saturating_sub(t0).as_secs_f64() / span
    } else {
        1.0
    };
    let mut res = NO_VALUES;
    for (i, out) in res.iter_mut().enumerate() {
        *out = match (v0[i], v1[i]) {
            (Some(x), Some(y)) => Some(x + (y - x) * ratio),
            _ => None,
        };
    }
    res
}

fn max_value(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn to_bytes(value: f64) -> u64 {
    value.round() as u64
}

/// Locks a mutex, even if another thread panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receives the events of the producers and applies them to the merger, until
/// every sender has been dropped.
pub async fn merge_loop(merger: Arc<Mutex<Merger>>, mut rx: mpsc::Receiver<MergeEvent>) {
    let mut events = Vec::with_capacity(64);
    while rx.recv_many(&mut events, 64).await > 0 {
        let mut merger = lock(&merger);
        for event in events.drain(..) {
            merger.apply(event);
        }
    }
    log::debug!("merge loop finished");
}
