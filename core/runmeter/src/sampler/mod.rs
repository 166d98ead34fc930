//! Periodic sampling of the native resource counters.
//!
//! The sampler takes a first sample as soon as it starts, then one sample at
//! each multiple of the interval after the beginning of the run, and a last
//! one when it is cancelled. A sample can also be requested at any time with
//! a refresh request.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::{
    mpsc::{self, error::SendError},
    oneshot,
};
use tokio_util::sync::CancellationToken;

use crate::measurement::NativeMetric;
use crate::merger::{MergeEvent, NO_VALUES, SYSTEM_CPU_TOTAL, Values};

pub mod counters;

pub use counters::{CounterSnapshot, CounterSource, ProcessCounters, ScriptedCounters, SystemCpuTime};

/// A request for an immediate sample. The sender is notified once the sample has been sent.
pub type RefreshRequest = oneshot::Sender<()>;

/// The values of the native counters, taken at some offset from the beginning of the run.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeSample {
    pub offset: Duration,
    /// `true` for the first sample of a sampler. The counters are not assumed to
    /// be continuous with the samples of a previous sampler.
    pub baseline: bool,
    pub cpu_user: Option<Duration>,
    pub cpu_system: Option<Duration>,
    pub resident: Option<u64>,
    pub peak_resident: Option<u64>,
    pub system_cpu: Option<SystemCpuTime>,
}

impl NativeSample {
    pub fn from_snapshot(offset: Duration, snapshot: &CounterSnapshot) -> Self {
        Self {
            offset,
            baseline: false,
            cpu_user: snapshot.cpu_user.as_ref().ok().copied(),
            cpu_system: snapshot.cpu_system.as_ref().ok().copied(),
            resident: snapshot.resident.as_ref().ok().copied(),
            peak_resident: snapshot.peak_resident.as_ref().ok().copied(),
            system_cpu: snapshot.system_cpu.as_ref().ok().copied(),
        }
    }

    /// The values indexed by `NativeMetric as usize`, CPU times in seconds.
    ///
    /// The busy CPU time of the machine is at `NativeMetric::SystemCpu`, its total
    /// CPU time at `SYSTEM_CPU_TOTAL`.
    pub(crate) fn values(&self) -> Values {
        let mut values = NO_VALUES;
        values[NativeMetric::CpuUser as usize] = self.cpu_user.map(|d| d.as_secs_f64());
        values[NativeMetric::CpuSystem as usize] = self.cpu_system.map(|d| d.as_secs_f64());
        values[NativeMetric::Resident as usize] = self.resident.map(|b| b as f64);
        values[NativeMetric::PeakResident as usize] = self.peak_resident.map(|b| b as f64);
        values[NativeMetric::SystemCpu as usize] = self.system_cpu.map(|t| t.busy.as_secs_f64());
        values[SYSTEM_CPU_TOTAL] = self.system_cpu.map(|t| t.total.as_secs_f64());
        values
    }
}

/// Polls a [`CounterSource`] at a fixed interval and sends the samples to the merger.
pub struct SamplerLoop {
    counters: Box<dyn CounterSource>,
    origin: Instant,
    interval: Duration,
    tx: mpsc::Sender<MergeEvent>,
    cancel_token: CancellationToken,
    refresh: Option<mpsc::Receiver<RefreshRequest>>,
    /// Counters whose failure has already been reported.
    reported: [bool; NativeMetric::ALL.len()],
    baseline: bool,
}

impl SamplerLoop {
    /// Creates a sampler for a run that started at `origin`.
    pub fn new(
        counters: Box<dyn CounterSource>,
        origin: Instant,
        interval: Duration,
        tx: mpsc::Sender<MergeEvent>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            counters,
            origin,
            interval,
            tx,
            cancel_token,
            refresh: None,
            reported: [false; NativeMetric::ALL.len()],
            baseline: true,
        }
    }

    /// Takes a sample on each request received on `requests`.
    pub fn with_refresh(mut self, requests: mpsc::Receiver<RefreshRequest>) -> Self {
        self.refresh = Some(requests);
        self
    }

    pub fn run(mut self) -> impl Future<Output = ()> + Send {
        async move {
            // baseline
            if self.sample().await.is_err() {
                return;
            }

            let mut ticker = tokio::time::interval_at(self.next_tick(), self.interval);
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel_token.cancelled() => {
                        break;
                    }
                    Some(done) = next_request(&mut self.refresh) => {
                        if self.sample().await.is_err() {
                            log::debug!("the merger is gone, stopping the sampler");
                            return;
                        }
                        let _ = done.send(());
                    }
                    _ = ticker.tick() => {
                        if self.sample().await.is_err() {
                            log::debug!("the merger is gone, stopping the sampler");
                            return;
                        }
                    }
                }
            }

            // flush the last partial interval
            if self.sample().await.is_err() {
                log::debug!("the merger is gone, the last sample is lost");
            }
        }
    }

    /// The next multiple of the interval after the beginning of the run.
    fn next_tick(&self) -> tokio::time::Instant {
        let elapsed = self.origin.elapsed().as_nanos();
        let k = elapsed / self.interval.as_nanos() + 1;
        let next = self.origin + self.interval * u32::try_from(k).unwrap_or(u32::MAX);
        tokio::time::Instant::from_std(next)
    }

    async fn sample(&mut self) -> Result<(), SendError<MergeEvent>> {
        let snapshot = self.counters.read();
        let offset = self.origin.elapsed();

        let errors: Vec<_> = snapshot.errors().cloned().collect();
        for err in errors {
            let metric = err.metric;
            if !self.reported[metric as usize] {
                self.reported[metric as usize] = true;
                log::warn!("{err}");
                self.tx.send(MergeEvent::Degraded(err.into())).await?;
            }
            self.tx.send(MergeEvent::CounterError(metric)).await?;
        }
        let mut sample = NativeSample::from_snapshot(offset, &snapshot);
        sample.baseline = std::mem::take(&mut self.baseline);
        self.tx.send(MergeEvent::Sample(sample)).await
    }
}

/// Waits for the next refresh request, forever if there is no request channel.
async fn next_request(requests: &mut Option<mpsc::Receiver<RefreshRequest>>) -> Option<RefreshRequest> {
    match requests {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
