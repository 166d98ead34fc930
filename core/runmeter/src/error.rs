//! Error types.
//!
//! Fatal errors ([`ConflictError`], [`FinalizeError`]) are returned to the caller.
//! Non-fatal ones ([`AdapterUnavailableError`], [`CounterUnavailableError`],
//! [`ShutdownTimeoutError`]) degrade a single source or metric: they are logged
//! and recorded as [`Degradation`](crate::record::Degradation)s on the run record.

use std::time::Duration;

use crate::lifecycle::RunId;
use crate::measurement::NativeMetric;
use crate::record::Degradation;

/// A run cannot be started because another one is in progress.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot begin a new run: run {active} is {state}")]
pub struct ConflictError {
    /// The run that occupies the run slot.
    pub active: RunId,
    /// The state of that run (`"active"` or `"finalizing"`).
    pub state: &'static str,
}

/// A power adapter could not be reached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("power adapter {address} is unavailable, missing sources {sources:?}: {reason}")]
pub struct AdapterUnavailableError {
    pub address: String,
    /// The sources that will be missing from the record.
    pub sources: Vec<String>,
    pub reason: String,
}

impl From<AdapterUnavailableError> for Degradation {
    fn from(err: AdapterUnavailableError) -> Self {
        Degradation::AdapterUnavailable {
            address: err.address,
            sources: err.sources,
            reason: err.reason,
        }
    }
}

/// A native counter cannot be read on this platform.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("counter {metric} is unavailable: {reason}")]
pub struct CounterUnavailableError {
    pub metric: NativeMetric,
    pub reason: String,
}

impl CounterUnavailableError {
    pub fn new(metric: NativeMetric, reason: impl Into<String>) -> Self {
        Self {
            metric,
            reason: reason.into(),
        }
    }

    pub fn unsupported(metric: NativeMetric) -> Self {
        Self::new(metric, "not supported on this platform")
    }
}

impl From<CounterUnavailableError> for Degradation {
    fn from(err: CounterUnavailableError) -> Self {
        Degradation::CounterUnavailable {
            metric: err.metric,
            reason: err.reason,
        }
    }
}

/// A background task did not stop before the shutdown timeout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{task} did not stop within {timeout:?}")]
pub struct ShutdownTimeoutError {
    pub task: String,
    pub timeout: Duration,
}

impl From<ShutdownTimeoutError> for Degradation {
    fn from(err: ShutdownTimeoutError) -> Self {
        Degradation::ShutdownTimeout {
            task: err.task,
            timeout: err.timeout,
        }
    }
}

/// The run record could not be built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to finalize run {run}: {reason}")]
pub struct FinalizeError {
    pub run: RunId,
    pub reason: String,
}

/// Error returned by [`RunContext::end`](crate::lifecycle::RunContext::end).
#[derive(Debug, thiserror::Error)]
pub enum EndError {
    /// The run has already been ended, its record is still available.
    #[error("run {0} is already closed")]
    AlreadyClosed(RunId),
    /// The handle does not refer to the active run.
    #[error("run {0} is not the active run")]
    NotActive(RunId),
    /// Aggregation failed, the run has been recorded as failed.
    #[error(transparent)]
    Finalize(#[from] FinalizeError),
    /// The run has been closed but a sink rejected its record.
    #[error("run {run} is closed but its record was rejected by a sink")]
    Sink {
        run: RunId,
        #[source]
        source: anyhow::Error,
    },
}

/// Error returned when starting or running a [`Monitor`](crate::monitor::Monitor).
///
/// `E` is the error type of the monitored body, if any.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError<E = std::convert::Infallible> {
    /// There is no active run to attach the monitor to.
    #[error("no active run to monitor")]
    NoActiveRun,
    /// A monitor is already attached to the active run.
    #[error("run {0} is already monitored")]
    AlreadyMonitored(RunId),
    /// The background runtime could not be created.
    #[error("failed to start the monitor runtime")]
    Runtime(#[source] std::io::Error),
    /// The monitored body failed. The monitor has been stopped.
    #[error("monitored computation failed")]
    Body(#[source] E),
}

/// Error returned by [`RunContext::scope`](crate::lifecycle::RunContext::scope).
#[derive(Debug, thiserror::Error)]
pub enum ScopeError<E> {
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error(transparent)]
    End(#[from] EndError),
    /// The body failed. The run has been ended with the `Failed` status.
    #[error("run body failed")]
    Body(#[source] E),
}

/// Invalid configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
