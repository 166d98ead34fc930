//! Records produced by a run.
//!
//! A [`RunRecord`] is created once, when the run ends, and is never modified
//! afterwards. Its [`Summary`] is a pure reduction over its [`TimeRecord`]s:
//! [`RunRecord::verify`] recomputes it and checks the shape of the timeline.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::machine::MachineRecord;
use crate::measurement::{NativeMetric, PowerKind, Timestamp};

/// The unique identifier of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A run's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run is in progress.
    Active,
    Completed,
    Failed,
    /// The run was interrupted, for instance by a panic in the monitored code.
    Aborted,
}

/// Run metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    /// The run's tags, to enable search or querying later.
    pub tags: BTreeSet<String>,
    /// Additional client-specified metadata.
    pub meta: BTreeMap<String, String>,
    pub start_time: Timestamp,
    pub end_time: Option<Timestamp>,
    pub status: RunStatus,
}

/// One time bucket of resource usage.
///
/// Bucket `i` covers the half-open interval `[start, start + duration)`, where
/// `start` is `i * interval` after the beginning of the run. All the buckets
/// have the same duration, except the last one, which may be shorter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRecord {
    pub index: u64,
    /// Offset of the bucket from the beginning of the run.
    pub start: Duration,
    pub duration: Duration,
    /// Wall-clock time at the beginning of the bucket.
    pub timestamp: Timestamp,
    /// User CPU time consumed during the bucket, in seconds.
    pub cpu_user: Option<f64>,
    /// System CPU time consumed during the bucket, in seconds.
    pub cpu_system: Option<f64>,
    /// Highest resident memory observed during the bucket, in bytes.
    pub resident: Option<u64>,
    /// Peak resident memory of the process at the end of the bucket, in bytes.
    pub peak_resident: Option<u64>,
    /// Share of the machine's CPU time that was busy during the bucket, from 0 to 1.
    pub system_utilization: Option<f64>,
    /// Power measurements attributed to this bucket, by source id.
    pub power: BTreeMap<String, PowerSample>,
}

/// The power measurements of one source in one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSample {
    pub kind: PowerKind,
    /// Number of readings attributed to the bucket.
    pub readings: u32,
    /// Energy consumed during the bucket, in joules.
    pub energy: f64,
    /// Average power over the bucket, in watts.
    pub average_power: f64,
}

/// Whether a metric or a source has been measured during the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// Present in every bucket.
    Full,
    /// Present in some buckets.
    Partial,
    /// Never measured.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricAvailability {
    pub cpu_user: Availability,
    pub cpu_system: Availability,
    pub resident: Availability,
    pub peak_resident: Availability,
    pub system_cpu: Availability,
}

/// Total energy of a power source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEnergy {
    pub kind: PowerKind,
    /// Total energy, in joules.
    pub energy: f64,
    /// Number of buckets with at least one reading.
    pub buckets: u64,
}

/// Summary statistics of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub elapsed: Duration,
    pub cpu_user: Option<f64>,
    pub cpu_system: Option<f64>,
    /// Total CPU time (user + system), in seconds.
    pub cpu_seconds: Option<f64>,
    /// Average CPU utilization (1.0 = one CPU fully used).
    pub cpu_utilization: Option<f64>,
    /// Highest memory use, in bytes.
    pub peak_memory: Option<u64>,
    /// Average busy share of the machine's CPUs, weighted by the duration of the buckets.
    pub avg_system_utilization: Option<f64>,
    /// Total energy per power source.
    pub energy: BTreeMap<String, SourceEnergy>,
    pub metrics: MetricAvailability,
    pub sources: BTreeMap<String, Availability>,
}

/// A non-fatal problem that made the record incomplete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    /// A power adapter could not be reached, its sources are missing.
    AdapterUnavailable {
        address: String,
        sources: Vec<String>,
        reason: String,
    },
    /// A native counter could not be read.
    CounterUnavailable { metric: NativeMetric, reason: String },
    /// A background task did not stop in time and was aborted.
    ShutdownTimeout { task: String, timeout: Duration },
}

/// Liveness of a connection to an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Connecting,
    Live,
    /// Connected, but nothing has been received for a while.
    Stale,
    Unavailable,
}

/// Counters about the power readings of a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingStats {
    /// Readings attributed to a bucket.
    pub accepted: u64,
    pub duplicates: u64,
    pub reordered: u64,
    /// Number of sequence numbers that were skipped.
    pub missing: u64,
    pub malformed: u64,
    pub dropped_before_start: u64,
    pub dropped_after_end: u64,
    /// Readings that arrived after their bucket was closed.
    pub dropped_late: u64,
    /// Number of times a cumulative energy counter went backwards.
    pub counter_resets: u64,
}

/// Summary of the session with an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterSession {
    pub address: String,
    /// Name announced by the adapter.
    pub name: Option<String>,
    /// Sources announced by the adapter.
    pub sources: Vec<String>,
    pub reconnects: u32,
    pub liveness: Liveness,
}

/// Everything that went wrong (or right) with the inputs of the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub readings: BTreeMap<String, ReadingStats>,
    /// Messages that could not be decoded, and thus not attributed to a source.
    pub malformed_messages: u64,
    /// Failed counter reads, by metric name.
    pub counter_errors: BTreeMap<String, u64>,
    pub adapters: Vec<AdapterSession>,
}

/// The finalized record of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run: Run,
    pub machine: MachineRecord,
    /// Duration of the time buckets.
    pub interval: Duration,
    /// All the power sources that were expected or seen during the run.
    pub power_sources: BTreeSet<String>,
    pub summary: Summary,
    pub degradations: Vec<Degradation>,
    pub diagnostics: Diagnostics,
    pub time_records: Vec<TimeRecord>,
}

impl TimeRecord {
    /// Offset of the end of the bucket (exclusive).
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }

    /// CPU time (user + system) consumed during the bucket, in seconds.
    pub fn cpu_seconds(&self) -> Option<f64> {
        match (self.cpu_user, self.cpu_system) {
            (None, None) => None,
            (user, system) => Some(user.unwrap_or(0.0) + system.unwrap_or(0.0)),
        }
    }

    fn native(&self, metric: NativeMetric) -> bool {
        match metric {
            NativeMetric::CpuUser => self.cpu_user.is_some(),
            NativeMetric::CpuSystem => self.cpu_system.is_some(),
            NativeMetric::Resident => self.resident.is_some(),
            NativeMetric::PeakResident => self.peak_resident.is_some(),
            NativeMetric::SystemCpu => self.system_utilization.is_some(),
        }
    }
}

impl Availability {
    fn from_counts(present: usize, total: usize) -> Self {
        if present == 0 {
            Availability::Unavailable
        } else if present == total {
            Availability::Full
        } else {
            Availability::Partial
        }
    }
}

/// Sums the values that are present, `None` if there is none.
fn sum_present(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    values.flatten().fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}

impl Summary {
    /// Computes the summary statistics of a sequence of buckets.
    ///
    /// `sources` lists the power sources that are expected, in addition to the ones
    /// that appear in the buckets.
    pub fn compute<'a>(records: &[TimeRecord], sources: impl IntoIterator<Item = &'a String>) -> Summary {
        let elapsed = records.iter().map(|r| r.duration).sum::<Duration>();
        let cpu_user = sum_present(records.iter().map(|r| r.cpu_user));
        let cpu_system = sum_present(records.iter().map(|r| r.cpu_system));
        let cpu_seconds = sum_present(records.iter().map(|r| r.cpu_seconds()));
        let cpu_utilization = match cpu_seconds {
            Some(cpu) if !elapsed.is_zero() => Some(cpu / elapsed.as_secs_f64()),
            _ => None,
        };
        let peak_memory = records
            .iter()
            .flat_map(|r| [r.resident, r.peak_resident])
            .flatten()
            .max();
        let (busy, measured) = records
            .iter()
            .filter_map(|r| Some((r.system_utilization?, r.duration.as_secs_f64())))
            .fold((0.0, 0.0), |(busy, total), (u, d)| (busy + u * d, total + d));
        let avg_system_utilization = (measured > 0.0).then(|| busy / measured);

        let mut energy: BTreeMap<String, SourceEnergy> = BTreeMap::new();
        for record in records {
            for (source, sample) in &record.power {
                let total = energy.entry(source.clone()).or_insert(SourceEnergy {
                    kind: sample.kind,
                    energy: 0.0,
                    buckets: 0,
                });
                total.energy += sample.energy;
                total.buckets += 1;
            }
        }

        let n = records.len();
        let availability = |metric| Availability::from_counts(records.iter().filter(|r| r.native(metric)).count(), n);
        let metrics = MetricAvailability {
            cpu_user: availability(NativeMetric::CpuUser),
            cpu_system: availability(NativeMetric::CpuSystem),
            resident: availability(NativeMetric::Resident),
            peak_resident: availability(NativeMetric::PeakResident),
            system_cpu: availability(NativeMetric::SystemCpu),
        };

        let mut all_sources: BTreeSet<&String> = sources.into_iter().collect();
        all_sources.extend(energy.keys());
        let sources = all_sources
            .into_iter()
            .map(|s| {
                let present = energy.get(s).map(|e| e.buckets as usize).unwrap_or(0);
                (s.clone(), Availability::from_counts(present, n))
            })
            .collect();

        Summary {
            elapsed,
            cpu_user,
            cpu_system,
            cpu_seconds,
            cpu_utilization,
            peak_memory,
            avg_system_utilization,
            energy,
            metrics,
            sources,
        }
    }
}

impl RunRecord {
    /// Returns `true` if some inputs were missing or some tasks misbehaved.
    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }

    /// Returns the degradations related to a given power source.
    pub fn source_degradations<'a>(&'a self, source_id: &'a str) -> impl Iterator<Item = &'a Degradation> + 'a {
        self.degradations.iter().filter(move |d| match d {
            Degradation::AdapterUnavailable { sources, .. } => sources.iter().any(|s| s == source_id),
            _ => false,
        })
    }

    /// Checks that the timeline is contiguous and that the summary matches the buckets.
    pub fn verify(&self) -> Result<(), String> {
        verify_timeline(&self.time_records, self.interval)?;
        let recomputed = Summary::compute(&self.time_records, &self.power_sources);
        if recomputed != self.summary {
            return Err(String::from("summary does not match the time records"));
        }
        Ok(())
    }
}

/// Checks that the buckets are contiguous, strictly increasing, and that only the
/// last one is partial.
pub fn verify_timeline(records: &[TimeRecord], interval: Duration) -> Result<(), String> {
    let mut expected_start = Duration::ZERO;
    for (i, record) in records.iter().enumerate() {
        if record.index != i as u64 {
            return Err(format!("bucket {i} has index {}", record.index));
        }
        if record.start != expected_start {
            return Err(format!(
                "bucket {i} starts at {:?}, expected {expected_start:?}",
                record.start
            ));
        }
        let is_last = i + 1 == records.len();
        if record.duration.is_zero() || record.duration > interval || (!is_last && record.duration != interval) {
            return Err(format!("bucket {i} has an invalid duration {:?}", record.duration));
        }
        expected_start = record.end();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    fn bucket(index: u64, duration_ms: u64, cpu: Option<f64>) -> TimeRecord {
        let start = Duration::from_millis(1000 * index);
        TimeRecord {
            index,
            start,
            duration: Duration::from_millis(duration_ms),
            timestamp: Timestamp::from_unix_micros(start.as_micros() as u64),
            cpu_user: cpu,
            cpu_system: cpu.map(|c| c / 2.0),
            resident: Some(1000 + index),
            peak_resident: None,
            system_utilization: cpu.map(|c| c / 4.0),
            power: BTreeMap::new(),
        }
    }

    #[test]
    fn summary_reductions() {
        let mut records = vec![bucket(0, 1000, Some(0.5)), bucket(1, 1000, None), bucket(2, 400, Some(0.25))];
        records[0].power.insert(
            String::from("gpu"),
            PowerSample {
                kind: PowerKind::Watts,
                readings: 3,
                energy: 30.0,
                average_power: 30.0,
            },
        );
        records[2].power.insert(
            String::from("gpu"),
            PowerSample {
                kind: PowerKind::Watts,
                readings: 1,
                energy: 4.0,
                average_power: 10.0,
            },
        );
        let expected_sources = [String::from("gpu"), String::from("psu")];
        let summary = Summary::compute(&records, &expected_sources);

        assert_eq!(summary.elapsed, Duration::from_millis(2400));
        assert_eq!(summary.cpu_user, Some(0.75));
        assert_eq!(summary.cpu_seconds, Some(0.75 + 0.375));
        assert_eq!(summary.peak_memory, Some(1002));
        assert_eq!(summary.metrics.cpu_user, Availability::Partial);
        assert_eq!(summary.metrics.resident, Availability::Full);
        assert_eq!(summary.metrics.peak_resident, Availability::Unavailable);
        assert_eq!(summary.metrics.system_cpu, Availability::Partial);
        assert_eq!(summary.energy["gpu"].energy, 34.0);
        assert_eq!(summary.energy["gpu"].buckets, 2);
        assert_eq!(summary.sources["gpu"], Availability::Partial);
        assert_eq!(summary.sources["psu"], Availability::Unavailable);
    }

    #[test]
    fn system_utilization_is_weighted() {
        // 0.2 during 1s, 0.1 during 0.5s, unknown during 1s
        let records = vec![bucket(0, 1000, Some(0.8)), bucket(1, 1000, None), bucket(2, 500, Some(0.4))];
        let summary = Summary::compute(&records, []);
        let avg = summary.avg_system_utilization.unwrap();
        assert!((avg - 0.25 / 1.5).abs() < 1e-9, "unexpected average {avg}");

        let none = vec![bucket(0, 1000, None)];
        assert_eq!(Summary::compute(&none, []).avg_system_utilization, None);
    }

    #[test]
    fn cpu_sum_is_exact() {
        let records: Vec<_> = (0..10).map(|i| bucket(i, 1000, Some(0.1 * i as f64))).collect();
        let summary = Summary::compute(&records, []);
        let manual = records.iter().filter_map(|r| r.cpu_seconds()).fold(0.0, |a, b| a + b);
        assert_eq!(summary.cpu_seconds, Some(manual));
    }

    #[test]
    fn timeline_checks() {
        let interval = Duration::from_secs(1);
        let ok = vec![bucket(0, 1000, None), bucket(1, 1000, None), bucket(2, 400, None)];
        assert_eq!(verify_timeline(&ok, interval), Ok(()));

        let partial_in_middle = vec![bucket(0, 500, None), bucket(1, 1000, None)];
        assert!(verify_timeline(&partial_in_middle, interval).is_err());

        let gap = vec![bucket(0, 1000, None), bucket(2, 1000, None)];
        assert!(verify_timeline(&gap, interval).is_err());

        assert_eq!(verify_timeline(&[], interval), Ok(()));
    }
}
