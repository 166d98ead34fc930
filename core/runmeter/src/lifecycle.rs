//! Lifecycle of the runs.
//!
//! A [`RunContext`] holds a single run slot. The slot goes from `Idle` to
//! `Active` when a run begins, then to `Finalizing` while the run's record is
//! built, and back to `Idle` once the record is stored. Only one run can occupy
//! the slot at a time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::config::Config;
use crate::error::{ConfigError, ConflictError, EndError, FinalizeError, ScopeError};
use crate::machine::MachineRecord;
use crate::measurement::Timestamp;
use crate::merger::{Merger, lock};
use crate::monitor::Teardown;
use crate::record::{Diagnostics, Run, RunRecord, RunStatus, Summary};
use crate::sink::{LobbySink, RecordSink};

pub use crate::record::RunId;

/// A reference to a run, returned by [`RunContext::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    id: RunId,
    tags: BTreeSet<String>,
    start_time: Timestamp,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }
}

/// Holds the run slot, the records of the closed runs and the record sinks.
///
/// Cloning a `RunContext` gives another reference to the same slot.
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<Shared>,
}

struct Shared {
    config: Config,
    slot: Mutex<Slot>,
    closed: Mutex<FxHashMap<RunId, Arc<RunRecord>>>,
    sinks: Vec<Box<dyn RecordSink>>,
    lobby: Option<LobbySink>,
}

enum Slot {
    Idle,
    Active(ActiveRun),
    Finalizing(RunId),
}

struct ActiveRun {
    run: Run,
    machine: MachineRecord,
    origin: Instant,
    merger: Arc<Mutex<Merger>>,
    monitor: Option<Arc<Teardown>>,
}

impl ActiveRun {
    fn handle(&self) -> RunHandle {
        RunHandle {
            id: self.run.id,
            tags: self.run.tags.clone(),
            start_time: self.run.start_time,
        }
    }
}

/// What a monitor needs to know about the run that it is attached to.
pub(crate) struct Attachment {
    pub run: RunHandle,
    pub origin: Instant,
    pub merger: Arc<Mutex<Merger>>,
    /// Set if the record of the run must be saved to the lobby while it is active.
    pub snapshots: Option<SnapshotTarget>,
}

/// Where the periodic snapshots of an active run are written.
pub(crate) struct SnapshotTarget {
    pub lobby: LobbySink,
    pub run: Run,
    pub machine: MachineRecord,
}

/// Error of [`RunContext::attach_monitor`].
pub(crate) enum AttachError<E> {
    NoActiveRun,
    AlreadyMonitored(RunId),
    Start(E),
}

static GLOBAL: OnceLock<RunContext> = OnceLock::new();

impl RunContext {
    /// Creates a new context, after checking the configuration.
    ///
    /// If `config.log_dir` is set, the records are written to its lobby.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        Self::with_sinks(config, Vec::new())
    }

    /// Creates a new context that gives the records to `sinks`, in addition to the lobby.
    pub fn with_sinks(config: Config, sinks: Vec<Box<dyn RecordSink>>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new_unchecked(config, sinks))
    }

    fn new_unchecked(config: Config, mut sinks: Vec<Box<dyn RecordSink>>) -> Self {
        let lobby = config.log_dir.as_ref().map(LobbySink::new);
        if let Some(lobby) = &lobby {
            sinks.push(Box::new(lobby.clone()));
        }
        Self {
            inner: Arc::new(Shared {
                config,
                slot: Mutex::new(Slot::Idle),
                closed: Mutex::new(FxHashMap::default()),
                sinks,
                lobby,
            }),
        }
    }

    /// Returns the process-wide context, created with the default configuration
    /// unless [`RunContext::init_global`] has been called before.
    pub fn global() -> &'static RunContext {
        GLOBAL.get_or_init(|| RunContext::new_unchecked(Config::default(), Vec::new()))
    }

    /// Initializes the process-wide context. Returns `Ok(false)` if it already exists.
    pub fn init_global(config: Config) -> Result<bool, ConfigError> {
        let ctx = RunContext::new(config)?;
        Ok(GLOBAL.set(ctx).is_ok())
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Begins a new run.
    ///
    /// Fails if another run is active or finalizing; that run is not affected.
    pub fn begin<S: Into<String>>(&self, tags: impl IntoIterator<Item = S>) -> Result<RunHandle, ConflictError> {
        self.begin_with(tags, BTreeMap::new())
    }

    /// Begins a new run with some metadata.
    pub fn begin_with<S: Into<String>>(
        &self,
        tags: impl IntoIterator<Item = S>,
        meta: BTreeMap<String, String>,
    ) -> Result<RunHandle, ConflictError> {
        let config = &self.inner.config;
        let mut all_tags = config.tags.clone();
        all_tags.extend(tags.into_iter().map(Into::into));
        let machine = MachineRecord::capture();

        let mut slot = lock(&self.inner.slot);
        match &*slot {
            Slot::Active(active) => {
                return Err(ConflictError {
                    active: active.run.id,
                    state: "active",
                });
            }
            Slot::Finalizing(id) => {
                return Err(ConflictError {
                    active: *id,
                    state: "finalizing",
                });
            }
            Slot::Idle => (),
        }

        let origin = Instant::now();
        let start_time = Timestamp::now();
        let run = Run {
            id: RunId::new_v4(),
            tags: all_tags,
            meta,
            start_time,
            end_time: None,
            status: RunStatus::Active,
        };
        let expected_sources = config.adapters.iter().flat_map(|a| a.sources.iter().cloned()).collect();
        let merger = Merger::new(start_time, config.interval, config.lateness(), expected_sources);
        let active = ActiveRun {
            run,
            machine,
            origin,
            merger: Arc::new(Mutex::new(merger)),
            monitor: None,
        };
        let handle = active.handle();
        *slot = Slot::Active(active);
        log::debug!("run {} begins, tags: {:?}", handle.id, handle.tags);
        Ok(handle)
    }

    /// Ends a run and returns its record.
    ///
    /// Stops the monitor that is attached to the run, if any, then builds the
    /// record, stores it and gives it to the sinks. The record can later be
    /// retrieved with [`RunContext::record`], even if this function fails.
    pub fn end(&self, run: &RunHandle, status: RunStatus) -> Result<Arc<RunRecord>, EndError> {
        let mut active = {
            let mut slot = lock(&self.inner.slot);
            match std::mem::replace(&mut *slot, Slot::Idle) {
                Slot::Active(active) if active.run.id == run.id => {
                    *slot = Slot::Finalizing(run.id);
                    active
                }
                other => {
                    let closing = matches!(other, Slot::Finalizing(id) if id == run.id);
                    *slot = other;
                    drop(slot);
                    if closing || self.record(run.id).is_some() {
                        return Err(EndError::AlreadyClosed(run.id));
                    }
                    return Err(EndError::NotActive(run.id));
                }
            }
        };
        log::debug!("run {} is finalizing", run.id);

        if let Some(monitor) = active.monitor.take() {
            monitor.stop();
        }
        let elapsed = active.origin.elapsed();
        let status = match status {
            RunStatus::Active => {
                log::warn!("run {} cannot end with the status {status:?}, using Completed", run.id);
                RunStatus::Completed
            }
            s => s,
        };
        let (record, error) = build_record(active, elapsed, status);
        let record = Arc::new(record);

        lock(&self.inner.closed).insert(run.id, record.clone());
        *lock(&self.inner.slot) = Slot::Idle;
        log::debug!(
            "run {} is closed: {:?}, {} buckets",
            run.id,
            record.run.status,
            record.time_records.len()
        );
        if let Some(err) = error {
            return Err(err.into());
        }

        let mut rejected = None;
        for sink in &self.inner.sinks {
            if let Err(e) = sink.accept(&record) {
                log::error!("A sink rejected the record of run {}: {e:#}", run.id);
                rejected.get_or_insert(e);
            }
        }
        match rejected {
            Some(source) => Err(EndError::Sink { run: run.id, source }),
            None => Ok(record),
        }
    }

    /// Returns the active run, if any.
    pub fn current(&self) -> Option<RunHandle> {
        match &*lock(&self.inner.slot) {
            Slot::Active(active) => Some(active.handle()),
            _ => None,
        }
    }

    /// Returns the record of a closed run.
    pub fn record(&self, id: RunId) -> Option<Arc<RunRecord>> {
        lock(&self.inner.closed).get(&id).cloned()
    }

    /// Runs `body` in a new run.
    ///
    /// The run ends with the status `Completed` if `body` succeeds, `Failed` if it
    /// returns an error and `Aborted` if it panics. The error of `body` is returned
    /// after the run has ended.
    pub fn scope<S, T, E, F>(&self, tags: impl IntoIterator<Item = S>, body: F) -> Result<T, ScopeError<E>>
    where
        S: Into<String>,
        F: FnOnce(&RunHandle) -> Result<T, E>,
    {
        let run = self.begin(tags)?;
        let guard = AbortOnUnwind { ctx: self, run: &run };
        let result = body(&run);
        drop(guard);
        match result {
            Ok(value) => {
                self.end(&run, RunStatus::Completed)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(end_err) = self.end(&run, RunStatus::Failed) {
                    log::error!("failed to end run {}: {end_err}", run.id);
                }
                Err(ScopeError::Body(e))
            }
        }
    }

    /// Attaches a monitor to the active run.
    ///
    /// `start` is called with the slot locked, it must not use the context.
    pub(crate) fn attach_monitor<E>(
        &self,
        start: impl FnOnce(Attachment) -> Result<Arc<Teardown>, E>,
    ) -> Result<(RunHandle, Arc<Teardown>), AttachError<E>> {
        let mut slot = lock(&self.inner.slot);
        let Slot::Active(active) = &mut *slot else {
            return Err(AttachError::NoActiveRun);
        };
        if active.monitor.is_some() {
            return Err(AttachError::AlreadyMonitored(active.run.id));
        }
        let snapshots = self.inner.lobby.clone().map(|lobby| SnapshotTarget {
            lobby,
            run: active.run.clone(),
            machine: active.machine.clone(),
        });
        let attachment = Attachment {
            run: active.handle(),
            origin: active.origin,
            merger: active.merger.clone(),
            snapshots,
        };
        let handle = attachment.run.clone();
        let teardown = start(attachment).map_err(AttachError::Start)?;
        active.monitor = Some(teardown.clone());
        Ok((handle, teardown))
    }

    /// Detaches a monitor that has been stopped.
    pub(crate) fn detach_monitor(&self, run: RunId, teardown: &Arc<Teardown>) {
        if let Slot::Active(active) = &mut *lock(&self.inner.slot) {
            let attached = active.monitor.as_ref().is_some_and(|m| Arc::ptr_eq(m, teardown));
            if active.run.id == run && attached {
                active.monitor = None;
            }
        }
    }
}

/// Returns the active run of the process-wide context.
pub fn current() -> Option<RunHandle> {
    RunContext::global().current()
}

/// Ends the run as `Aborted` if the scope unwinds.
struct AbortOnUnwind<'a> {
    ctx: &'a RunContext,
    run: &'a RunHandle,
}

impl Drop for AbortOnUnwind<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            if let Err(e) = self.ctx.end(self.run, RunStatus::Aborted) {
                log::error!("failed to abort run {}: {e}", self.run.id);
            }
        }
    }
}

/// Finalizes the merger and builds the record of the run.
///
/// If the timeline cannot be built, the returned record is marked as failed and has no bucket.
fn build_record(active: ActiveRun, elapsed: Duration, status: RunStatus) -> (RunRecord, Option<FinalizeError>) {
    let ActiveRun {
        mut run,
        machine,
        merger,
        ..
    } = active;
    run.end_time = Some(run.start_time.offset_by(elapsed));
    run.status = status;

    let mut merger = lock(&merger);
    let interval = merger.interval();
    let built = merger.finalize(elapsed).and_then(|output| {
        let record = output.into_record(run.clone(), machine.clone(), interval);
        record.verify().map(|()| record)
    });

    match built {
        Ok(record) => (record, None),
        Err(reason) => {
            log::error!("failed to finalize run {}: {reason}", run.id);
            let error = FinalizeError { run: run.id, reason };
            run.status = RunStatus::Failed;
            let record = RunRecord {
                run,
                machine,
                interval,
                power_sources: BTreeSet::new(),
                summary: Summary::compute(&[], []),
                degradations: Vec::new(),
                diagnostics: Diagnostics::default(),
                time_records: Vec::new(),
            };
            (record, Some(error))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::EndError;

    fn ctx() -> RunContext {
        RunContext::new(Config::default().with_interval(Duration::from_millis(10))).unwrap()
    }

    #[test]
    fn single_active_run() {
        let ctx = ctx();
        assert_eq!(ctx.current(), None);
        let run = ctx.begin(["a"]).unwrap();
        assert_eq!(ctx.current().as_ref(), Some(&run));

        let conflict = ctx.begin(["b"]).unwrap_err();
        assert_eq!(conflict.active, run.id());
        assert_eq!(ctx.current().as_ref(), Some(&run));

        let record = ctx.end(&run, RunStatus::Completed).unwrap();
        assert_eq!(record.run.status, RunStatus::Completed);
        assert_eq!(ctx.current(), None);
        assert!(ctx.begin(["c"]).is_ok());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = RunContext::new(Config::default().with_interval(Duration::ZERO)).err();
        assert!(matches!(err, Some(ConfigError::Invalid(_))), "unexpected result: {err:?}");
        assert!(RunContext::with_sinks(Config::default(), Vec::new()).is_ok());
    }

    #[test]
    fn end_twice() {
        let ctx = ctx();
        let run = ctx.begin(["twice"]).unwrap();
        std::thread::sleep(Duration::from_millis(25));
        let first = ctx.end(&run, RunStatus::Completed).unwrap();
        assert!(matches!(ctx.end(&run, RunStatus::Failed), Err(EndError::AlreadyClosed(id)) if id == run.id()));
        let stored = ctx.record(run.id()).unwrap();
        assert!(Arc::ptr_eq(&first, &stored));
        assert_eq!(stored.run.status, RunStatus::Completed);
    }

    #[test]
    fn unknown_handle() {
        let ctx = ctx();
        let other = RunContext::new(Config::default()).unwrap();
        let foreign = other.begin(Vec::<String>::new()).unwrap();
        assert!(matches!(ctx.end(&foreign, RunStatus::Completed), Err(EndError::NotActive(_))));
    }

    #[test]
    fn record_without_monitor() {
        let ctx = ctx();
        let mut meta = BTreeMap::new();
        meta.insert(String::from("commit"), String::from("abc123"));
        let run = ctx.begin_with(["meta"], meta.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(35));
        let record = ctx.end(&run, RunStatus::Completed).unwrap();

        assert_eq!(record.run.meta, meta);
        assert!(record.time_records.len() >= 4);
        assert!(record.time_records.iter().all(|r| r.cpu_user.is_none()));
        assert!(record.run.end_time.is_some());
        record.verify().unwrap();
    }

    #[test]
    fn scope_statuses() {
        let ctx = ctx();
        let value = ctx.scope(["ok"], |_| Ok::<_, std::io::Error>(42)).unwrap();
        assert_eq!(value, 42);

        let err = ctx
            .scope(["err"], |_| Err::<(), _>(std::io::Error::other("boom")))
            .unwrap_err();
        assert!(matches!(err, ScopeError::Body(_)));

        let ctx2 = ctx.clone();
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<(), ScopeError<std::io::Error>> = ctx2.scope(["panic"], |_| panic!("expected panic"));
        }));
        assert!(panicked.is_err());
        assert_eq!(ctx.current(), None);

        let mut statuses: Vec<_> = lock(&ctx.inner.closed)
            .values()
            .map(|r| (r.run.tags.clone(), r.run.status))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0));
        let tag = |t: &str| BTreeSet::from([String::from(t)]);
        assert_eq!(
            statuses,
            vec![
                (tag("err"), RunStatus::Failed),
                (tag("ok"), RunStatus::Completed),
                (tag("panic"), RunStatus::Aborted),
            ]
        );
    }
}
