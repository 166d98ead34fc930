//! Background monitoring of the active run.
//!
//! A monitor runs on its own tokio runtime, so that it can be used from
//! synchronous code. It spawns:
//! - the sampler of the native counters,
//! - one connection task per power adapter,
//! - the merge task, which receives the events of all the others,
//! - if the context has a log directory, a task that regularly saves the record
//!   of the active run to the lobby.
//!
//! The monitor stops when its [`MonitorGuard`] is dropped or when the run ends,
//! whichever comes first. The tasks that do not stop within the shutdown timeout
//! are aborted, and recorded as degradations of the run.
//!
//! The functions of this module block the current thread: they must not be
//! called from an async context.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapter::{AdapterConnection, HubSettings, PowerAdapterHub};
use crate::config::{AdapterConfig, Config};
use crate::error::{MonitorError, ShutdownTimeoutError};
use crate::lifecycle::{AttachError, Attachment, RunContext, RunHandle, SnapshotTarget};
use crate::merger::{EVENT_CHANNEL_CAPACITY, Merger, lock, merge_loop};
use crate::record::Degradation;
use crate::sampler::counters::{CounterSource, ProcessCounters};
use crate::sampler::{RefreshRequest, SamplerLoop};
use crate::sink::RecordSink;

/// Name of the sampler task, as it appears in the degradations.
pub const SAMPLER_TASK: &str = "sampler";

/// Name of the task that saves the record of the active run.
pub const SAVER_TASK: &str = "saver";

/// Entry point of the monitoring API.
pub struct Monitor;

impl Monitor {
    /// Prepares a monitor for the active run of `ctx`.
    pub fn builder(ctx: &RunContext) -> MonitorBuilder<'_> {
        MonitorBuilder {
            ctx,
            counters: None,
            adapters: None,
        }
    }
}

pub struct MonitorBuilder<'a> {
    ctx: &'a RunContext,
    counters: Option<Box<dyn CounterSource>>,
    adapters: Option<Vec<AdapterConfig>>,
}

impl MonitorBuilder<'_> {
    /// Reads the native counters from `counters` instead of the current process.
    pub fn counters(mut self, counters: impl CounterSource + 'static) -> Self {
        self.counters = Some(Box::new(counters));
        self
    }

    /// Subscribes to these adapters instead of the ones of the configuration.
    pub fn adapters(mut self, adapters: Vec<AdapterConfig>) -> Self {
        self.adapters = Some(adapters);
        self
    }

    /// Starts the monitor and attaches it to the active run.
    pub fn start(self) -> Result<MonitorGuard, MonitorError> {
        let config = self.ctx.config();
        let settings = MonitorSettings::from_config(config);
        let adapters = self.adapters.unwrap_or_else(|| config.adapters.clone());
        let counters = self.counters.unwrap_or_else(|| Box::new(ProcessCounters::new()));

        let attached = self
            .ctx
            .attach_monitor(|attachment| Teardown::start(attachment, counters, adapters, settings));
        match attached {
            Ok((run, teardown)) => {
                log::debug!("monitor attached to run {}", run.id());
                Ok(MonitorGuard {
                    ctx: self.ctx.clone(),
                    run,
                    teardown,
                })
            }
            Err(AttachError::NoActiveRun) => Err(MonitorError::NoActiveRun),
            Err(AttachError::AlreadyMonitored(id)) => Err(MonitorError::AlreadyMonitored(id)),
            Err(AttachError::Start(e)) => Err(MonitorError::Runtime(e)),
        }
    }
}

/// Keeps a monitor running. Dropping the guard stops the monitor.
pub struct MonitorGuard {
    ctx: RunContext,
    run: RunHandle,
    teardown: Arc<Teardown>,
}

impl MonitorGuard {
    /// The run that is being monitored.
    pub fn run(&self) -> &RunHandle {
        &self.run
    }

    /// Returns the state of the connections to the power adapters.
    pub fn connections(&self) -> Vec<AdapterConnection> {
        self.teardown.hub.connections()
    }

    /// Samples the native counters now, without waiting for the next tick.
    ///
    /// Blocks until the sample has been given to the merger. Returns `false` if the
    /// monitor has been stopped.
    pub fn refresh(&self) -> bool {
        let Some(requests) = lock(&self.teardown.state).as_ref().map(|r| r.refresh.clone()) else {
            return false;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if requests.blocking_send(done_tx).is_err() {
            return false;
        }
        done_rx.blocking_recv().is_ok()
    }

    /// Stops the monitor and waits for its tasks to finish (or to time out).
    pub fn stop(self) {
        // see Drop
    }
}

impl Drop for MonitorGuard {
    fn drop(&mut self) {
        self.teardown.stop();
        self.ctx.detach_monitor(self.run.id(), &self.teardown);
    }
}

/// Monitors the active run of `ctx` while `body` executes.
///
/// The monitor is stopped before returning, even if `body` fails.
pub fn monitor<T, E>(ctx: &RunContext, body: impl FnOnce(&RunHandle) -> Result<T, E>) -> Result<T, MonitorError<E>> {
    let guard = Monitor::builder(ctx).start().map_err(widen)?;
    let result = body(guard.run());
    guard.stop();
    result.map_err(MonitorError::Body)
}

fn widen<E>(err: MonitorError) -> MonitorError<E> {
    match err {
        MonitorError::NoActiveRun => MonitorError::NoActiveRun,
        MonitorError::AlreadyMonitored(id) => MonitorError::AlreadyMonitored(id),
        MonitorError::Runtime(e) => MonitorError::Runtime(e),
        MonitorError::Body(never) => match never {},
    }
}

/// The part of the configuration that a monitor uses.
struct MonitorSettings {
    hub: HubSettings,
    interval: Duration,
    save_interval: Duration,
    shutdown_timeout: Duration,
}

impl MonitorSettings {
    fn from_config(config: &Config) -> Self {
        Self {
            hub: HubSettings::from_config(config),
            interval: config.interval,
            save_interval: config.save_interval,
            shutdown_timeout: config.shutdown_timeout,
        }
    }
}

/// Stops the tasks of a monitor, once.
pub(crate) struct Teardown {
    hub: PowerAdapterHub,
    state: Mutex<Option<Running>>,
}

struct Running {
    runtime: Runtime,
    cancel_token: CancellationToken,
    /// Producers of merge events, with their names.
    tasks: Vec<(String, JoinHandle<()>)>,
    merge_task: JoinHandle<()>,
    merger: Arc<Mutex<Merger>>,
    refresh: mpsc::Sender<RefreshRequest>,
    shutdown_timeout: Duration,
}

impl Teardown {
    fn start(
        attachment: Attachment,
        counters: Box<dyn CounterSource>,
        adapters: Vec<AdapterConfig>,
        settings: MonitorSettings,
    ) -> io::Result<Arc<Teardown>> {
        let runtime = build_runtime(1 + adapters.len())?;
        let cancel_token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let merge_task = runtime.spawn(merge_loop(attachment.merger.clone(), rx));

        let (refresh, refresh_rx) = mpsc::channel(1);
        let sampler = SamplerLoop::new(
            counters,
            attachment.origin,
            settings.interval,
            tx.clone(),
            cancel_token.child_token(),
        )
        .with_refresh(refresh_rx);
        let mut tasks = vec![(String::from(SAMPLER_TASK), runtime.spawn(sampler.run()))];

        let hub = PowerAdapterHub::new(settings.hub, adapters);
        tasks.extend(hub.spawn(runtime.handle(), &tx, &cancel_token));
        // the merge loop stops once every producer has dropped its sender
        drop(tx);

        if let Some(target) = attachment.snapshots {
            let saver = save_loop(
                attachment.merger.clone(),
                target,
                settings.save_interval,
                cancel_token.child_token(),
            );
            tasks.push((String::from(SAVER_TASK), runtime.spawn(saver)));
        }

        let running = Running {
            runtime,
            cancel_token,
            tasks,
            merge_task,
            merger: attachment.merger,
            refresh,
            shutdown_timeout: settings.shutdown_timeout,
        };
        Ok(Arc::new(Teardown {
            hub,
            state: Mutex::new(Some(running)),
        }))
    }

    /// Stops the monitor. Does nothing if it is already stopped.
    ///
    /// Blocks until every task has stopped or has been aborted.
    pub(crate) fn stop(&self) {
        let mut state = lock(&self.state);
        if let Some(running) = state.take() {
            running.shutdown();
        }
    }
}

impl Running {
    fn shutdown(self) {
        let Running {
            runtime,
            cancel_token,
            tasks,
            merge_task,
            merger,
            refresh,
            shutdown_timeout,
        } = self;
        drop(refresh);

        log::debug!("stopping the monitor, timeout {shutdown_timeout:?}");
        cancel_token.cancel();
        let degradations = runtime.block_on(async move {
            let deadline = deadline_after(shutdown_timeout);
            let mut degradations: Vec<Degradation> = Vec::new();
            for (task, handle) in tasks {
                let abort = handle.abort_handle();
                match tokio::time::timeout_at(deadline, handle).await {
                    Ok(Ok(())) => (),
                    Ok(Err(e)) => log::error!("Task '{task}' failed: {e}"),
                    Err(_elapsed) => {
                        abort.abort();
                        let err = ShutdownTimeoutError {
                            task,
                            timeout: shutdown_timeout,
                        };
                        log::error!("{err}");
                        degradations.push(err.into());
                    }
                }
            }

            // The aborted tasks drop their senders when they are cancelled by the runtime,
            // which ends the merge loop.
            let abort = merge_task.abort_handle();
            match tokio::time::timeout(shutdown_timeout, merge_task).await {
                Ok(Ok(())) => (),
                Ok(Err(e)) => log::error!("The merge task failed: {e}"),
                Err(_elapsed) => {
                    abort.abort();
                    log::error!("The merge task did not stop within {shutdown_timeout:?}, pending events are lost");
                }
            }
            degradations
        });

        let mut merger = lock(&merger);
        for degradation in degradations {
            merger.degrade(degradation);
        }
        drop(merger);
        runtime.shutdown_background();
        log::debug!("monitor stopped");
    }
}

/// Saves the record of the active run to the lobby every `every`, until cancelled.
///
/// The saved record only contains the buckets closed so far.
async fn save_loop(
    merger: Arc<Mutex<Merger>>,
    target: SnapshotTarget,
    every: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(deadline_after(every), every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                let record = {
                    let merger = lock(&merger);
                    let interval = merger.interval();
                    merger
                        .snapshot()
                        .into_record(target.run.clone(), target.machine.clone(), interval)
                };
                let id = target.run.id;
                match target.lobby.accept(&record) {
                    Ok(()) => log::trace!("record of run {id} saved, {} buckets", record.time_records.len()),
                    Err(e) => log::warn!("could not save the record of run {id}: {e:#}"),
                }
            }
        }
    }
}

/// Tokio panics if the deadline overflows its clock, for instance with `Duration::MAX`.
fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365);
    let now = tokio::time::Instant::now();
    now.checked_add(timeout.min(FAR_FUTURE)).unwrap_or(now)
}

fn build_runtime(worker_threads: usize) -> io::Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .thread_name_fn(|| {
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
            format!("runmeter-monitor-{id}")
        })
        .build()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::{Duration, Instant};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::Config;
    use crate::measurement::{NativeMetric, Timestamp};
    use crate::record::RunStatus;
    use crate::sampler::counters::ScriptedCounters;

    fn ctx(interval: Duration) -> RunContext {
        RunContext::new(Config::default().with_interval(interval)).unwrap()
    }

    #[test]
    fn no_active_run() {
        let ctx = ctx(Duration::from_millis(10));
        assert!(matches!(Monitor::builder(&ctx).start(), Err(MonitorError::NoActiveRun)));
    }

    #[test]
    fn one_monitor_per_run() {
        let _ = env_logger::builder().is_test(true).try_init();
        let ctx = ctx(Duration::from_millis(10));
        let run = ctx.begin(["monitored"]).unwrap();
        let guard = Monitor::builder(&ctx).counters(ScriptedCounters::new()).start().unwrap();
        assert_eq!(guard.run(), &run);
        assert!(matches!(
            Monitor::builder(&ctx).counters(ScriptedCounters::new()).start(),
            Err(MonitorError::AlreadyMonitored(id)) if id == run.id()
        ));

        // once stopped, another monitor can be attached
        guard.stop();
        let guard = Monitor::builder(&ctx).counters(ScriptedCounters::new()).start().unwrap();
        ctx.end(&run, RunStatus::Completed).unwrap();
        // the monitor has been stopped by the end of the run
        drop(guard);
    }

    #[test]
    fn cpu_time_is_recorded() {
        let _ = env_logger::builder().is_test(true).try_init();
        let ctx = ctx(Duration::from_millis(20));
        let run = ctx.begin(["cpu"]).unwrap();
        let counters = ScriptedCounters::new()
            .with_cpu_step(Duration::from_millis(5), Duration::from_millis(1))
            .with_resident(4096);
        let guard = Monitor::builder(&ctx).counters(counters).start().unwrap();
        std::thread::sleep(Duration::from_millis(150));
        drop(guard);

        let record = ctx.end(&run, RunStatus::Completed).unwrap();
        record.verify().unwrap();
        assert!(record.time_records.len() >= 7);
        let cpu_user = record.summary.cpu_user.expect("cpu time should be available");
        assert!(cpu_user > 0.0);
        assert!(record.summary.cpu_system.is_some());
        assert!(!record.is_degraded(), "unexpected degradations: {:?}", record.degradations);
    }

    #[test]
    fn monitored_body() {
        let ctx = ctx(Duration::from_millis(10));
        let run = ctx.begin(["body"]).unwrap();
        let value = monitor(&ctx, |handle| {
            assert_eq!(handle.id(), run.id());
            std::thread::sleep(Duration::from_millis(30));
            Ok::<_, std::io::Error>(7)
        });
        assert!(matches!(value, Ok(7)));
        let record = ctx.end(&run, RunStatus::Completed).unwrap();
        assert!(record.time_records.len() >= 3);
    }

    #[test]
    fn body_error() {
        let ctx = ctx(Duration::from_millis(10));
        let run = ctx.begin(["failing"]).unwrap();
        let result: Result<(), _> = monitor(&ctx, |_| Err(std::io::Error::other("boom")));
        assert!(matches!(result, Err(MonitorError::Body(_))));
        // the monitor is detached
        assert!(Monitor::builder(&ctx).counters(ScriptedCounters::new()).start().is_ok());
        ctx.end(&run, RunStatus::Failed).unwrap();
    }

    #[test]
    fn stuck_task_is_aborted() {
        let runtime = build_runtime(1).unwrap();
        let merger = Arc::new(Mutex::new(Merger::new(
            Timestamp::now(),
            Duration::from_millis(10),
            Duration::from_millis(10),
            BTreeSet::new(),
        )));
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let merge_task = runtime.spawn(merge_loop(merger.clone(), rx));
        // ignores the cancellation token
        let stuck = runtime.spawn(async move {
            let _tx = tx;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let running = Running {
            runtime,
            cancel_token: CancellationToken::new(),
            tasks: vec![(String::from("stuck"), stuck)],
            merge_task,
            merger: merger.clone(),
            refresh: mpsc::channel(1).0,
            shutdown_timeout: Duration::from_millis(50),
        };

        let t0 = Instant::now();
        running.shutdown();
        assert!(t0.elapsed() < Duration::from_secs(5));
        assert_eq!(
            lock(&merger).degradations(),
            &[Degradation::ShutdownTimeout {
                task: String::from("stuck"),
                timeout: Duration::from_millis(50),
            }]
        );
    }

    #[test]
    fn refresh_samples_now() {
        let _ = env_logger::builder().is_test(true).try_init();
        let ctx = ctx(Duration::from_secs(3600));
        let run = ctx.begin(["refresh"]).unwrap();
        let counters = ScriptedCounters::new().with_unavailable(NativeMetric::Resident);
        let guard = Monitor::builder(&ctx).counters(counters).start().unwrap();
        for _ in 0..3 {
            assert!(guard.refresh());
        }
        drop(guard);
        let record = ctx.end(&run, RunStatus::Completed).unwrap();
        // baseline, 3 refreshes and the last sample
        assert_eq!(record.diagnostics.counter_errors["resident"], 5);
    }

    #[test]
    fn refresh_after_stop() {
        let ctx = ctx(Duration::from_millis(10));
        let run = ctx.begin(["stopped"]).unwrap();
        let guard = Monitor::builder(&ctx).counters(ScriptedCounters::new()).start().unwrap();
        ctx.end(&run, RunStatus::Completed).unwrap();
        assert!(!guard.refresh());
    }

    #[test]
    fn active_run_is_saved() {
        let _ = env_logger::builder().is_test(true).try_init();
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default().with_interval(Duration::from_millis(10));
        config.log_dir = Some(tmp.path().to_path_buf());
        config.save_interval = Duration::from_millis(30);
        let ctx = RunContext::new(config).unwrap();
        let lobby = crate::sink::LobbySink::new(tmp.path());

        let run = ctx.begin(["saved"]).unwrap();
        let guard = Monitor::builder(&ctx)
            .counters(ScriptedCounters::new().with_cpu_step(Duration::from_millis(1), Duration::ZERO))
            .start()
            .unwrap();
        let path = tmp.path().join(crate::sink::LOBBY_DIR).join(format!("{}.toml", run.id()));
        let t0 = Instant::now();
        while !path.exists() {
            assert!(t0.elapsed() < Duration::from_secs(5), "the active run was never saved");
            std::thread::sleep(Duration::from_millis(5));
        }
        let saved: crate::record::RunRecord = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.run.status, RunStatus::Active);
        assert_eq!(saved.run.end_time, None);
        drop(guard);

        let record = ctx.end(&run, RunStatus::Completed).unwrap();
        assert_eq!(lobby.record_path(&record), path);
        let saved: crate::record::RunRecord = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.run.status, RunStatus::Completed);
        assert_eq!(saved.time_records.len(), record.time_records.len());
    }
}
