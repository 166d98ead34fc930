//! Runmeter records the resource consumption of monitored runs.
//!
//! A run is one execution of a unit of computation, delimited by
//! [`RunContext::begin`] and [`RunContext::end`]. While a run is active, a
//! [`Monitor`](monitor::Monitor) can be attached to it: it samples the native
//! counters of the process (CPU time, memory) and subscribes to external power
//! adapters. Everything is merged into a gapless sequence of
//! [`TimeRecord`](record::TimeRecord)s, which is finalized into an immutable
//! [`RunRecord`](record::RunRecord) when the run ends.
//!
//! # Example
//! ```no_run
//! use runmeter::{config::Config, lifecycle::RunContext, monitor, record::RunStatus};
//!
//! # fn main() -> anyhow::Result<()> {
//! let ctx = RunContext::new(Config::default())?;
//! let run = ctx.begin(["training"])?;
//! let total = monitor::monitor(&ctx, |_run| Ok::<_, std::io::Error>((0..1_000_000u64).sum::<u64>()))?;
//! let record = ctx.end(&run, RunStatus::Completed)?;
//! println!("{total}: {} buckets, {:?} cpu-seconds", record.time_records.len(), record.summary.cpu_seconds);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod machine;
pub mod measurement;
pub mod merger;
pub mod monitor;
pub mod record;
pub mod sampler;
pub mod sink;

pub use lifecycle::{RunContext, RunHandle, current};

/// The version of the runmeter core.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
