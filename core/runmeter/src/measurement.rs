//! Basic measurement types shared by the producers and the merger.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A measurement of the wall clock.
///
/// This opaque type is currently a wrapper around [`SystemTime`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(SystemTime);

impl Timestamp {
    /// Returns a `Timestamp` representing the current system time.
    pub fn now() -> Self {
        Self(SystemTime::now())
    }

    /// Creates a timestamp from a number of microseconds since the Unix epoch.
    pub fn from_unix_micros(micros: u64) -> Self {
        Self(UNIX_EPOCH + Duration::from_micros(micros))
    }

    /// Returns the number of microseconds since the Unix epoch (0 for earlier times).
    pub fn to_unix_micros(&self) -> u64 {
        self.0
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros().min(u64::MAX as u128) as u64)
            .unwrap_or(0)
    }

    /// Returns the amount of time elapsed from `earlier` to `self`,
    /// or `None` if `earlier` is later than `self`.
    pub fn duration_since(&self, earlier: Timestamp) -> Option<Duration> {
        self.0.duration_since(earlier.0).ok()
    }

    /// Returns `self + offset`.
    pub fn offset_by(&self, offset: Duration) -> Timestamp {
        Self(self.0 + offset)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(value: SystemTime) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for SystemTime {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A native resource metric, measured by the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeMetric {
    /// CPU time spent in user mode.
    CpuUser,
    /// CPU time spent in kernel mode.
    CpuSystem,
    /// Current resident set size.
    Resident,
    /// Highest resident set size reached by the process.
    PeakResident,
    /// Busy and total CPU time of the whole machine.
    SystemCpu,
}

impl NativeMetric {
    pub const ALL: [NativeMetric; 5] = [
        NativeMetric::CpuUser,
        NativeMetric::CpuSystem,
        NativeMetric::Resident,
        NativeMetric::PeakResident,
        NativeMetric::SystemCpu,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NativeMetric::CpuUser => "cpu_user",
            NativeMetric::CpuSystem => "cpu_system",
            NativeMetric::Resident => "resident",
            NativeMetric::PeakResident => "peak_resident",
            NativeMetric::SystemCpu => "system_cpu",
        }
    }
}

impl fmt::Display for NativeMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of value reported by a power source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerKind {
    /// Instantaneous power, in watts.
    Watts,
    /// Cumulative energy counter, in joules.
    Joules,
}

impl fmt::Display for PowerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerKind::Watts => f.write_str("watts"),
            PowerKind::Joules => f.write_str("joules"),
        }
    }
}

/// A validated power measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Measure {
    /// Instantaneous power, in watts.
    Watts(f64),
    /// Value of a cumulative energy counter, in joules.
    Joules(f64),
}

impl Measure {
    pub fn kind(&self) -> PowerKind {
        match self {
            Measure::Watts(_) => PowerKind::Watts,
            Measure::Joules(_) => PowerKind::Joules,
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            Measure::Watts(v) | Measure::Joules(v) => *v,
        }
    }
}

/// The stamp that orders the readings of a power source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stamp {
    /// Sequence number, incremented by one for each reading.
    Sequence(u64),
    /// Time of the reading, in microseconds since the Unix epoch.
    Timestamp(u64),
}

/// A power reading, received from an adapter and validated by the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerReading {
    /// Identifier of the power source, unique across adapters.
    pub source_id: String,
    /// Ordering stamp, as sent by the adapter.
    pub stamp: Stamp,
    /// Time of the reading (from the stamp, or the time of receipt for sequence numbers).
    pub time: Timestamp,
    pub measure: Measure,
}
