use std::{fs, sync::Arc, thread, time::Duration};

use pretty_assertions::assert_eq;
use runmeter::{
    RunContext,
    config::Config,
    error::{EndError, ScopeError},
    record::{RunRecord, RunStatus},
    sink::{LOBBY_DIR, LobbySink, MemorySink, RecordSink, init_log_dir},
};
use serial_test::serial;

const INTERVAL: Duration = Duration::from_millis(20);

fn config() -> Config {
    Config::default().with_interval(INTERVAL)
}

#[test]
fn conflicting_runs() {
    let ctx = RunContext::new(config()).unwrap();
    let first = ctx.begin(["first"]).unwrap();

    let err = ctx.begin(["second"]).unwrap_err();
    assert_eq!(err.active, first.id());
    assert_eq!(ctx.current().map(|r| r.id()), Some(first.id()));

    // the conflict did not disturb the active run
    let record = ctx.end(&first, RunStatus::Completed).unwrap();
    assert_eq!(record.run.tags.iter().collect::<Vec<_>>(), vec!["first"]);
    assert_eq!(record.run.status, RunStatus::Completed);
}

#[test]
fn ending_twice_keeps_the_first_record() {
    let ctx = RunContext::new(config()).unwrap();
    let run = ctx.begin(["twice"]).unwrap();
    thread::sleep(INTERVAL * 2);
    let record = ctx.end(&run, RunStatus::Completed).unwrap();

    match ctx.end(&run, RunStatus::Aborted) {
        Err(EndError::AlreadyClosed(id)) => assert_eq!(id, run.id()),
        other => panic!("unexpected result {other:?}"),
    }
    let stored = ctx.record(run.id()).unwrap();
    assert!(Arc::ptr_eq(&record, &stored));
    assert_eq!(stored.run.status, RunStatus::Completed);
}

#[test]
fn consecutive_runs_have_distinct_records() {
    let sink = MemorySink::new();
    let ctx = RunContext::with_sinks(config(), vec![Box::new(sink.clone())]).unwrap();
    let mut ids = Vec::new();
    for i in 0..3 {
        let run = ctx.begin([format!("run-{i}")]).unwrap();
        thread::sleep(INTERVAL);
        ctx.end(&run, RunStatus::Completed).unwrap();
        ids.push(run.id());
    }
    let records = sink.records();
    assert_eq!(records.iter().map(|r| r.run.id).collect::<Vec<_>>(), ids);
    for record in records {
        record.verify().unwrap();
        let end = record.run.end_time.unwrap();
        assert!(end.duration_since(record.run.start_time).is_some());
    }
}

#[test]
fn scope_ends_the_run() {
    let sink = MemorySink::new();
    let ctx = RunContext::with_sinks(config(), vec![Box::new(sink.clone())]).unwrap();

    let n = ctx
        .scope(["ok"], |run| {
            assert_eq!(run.tags().len(), 1);
            Ok::<_, std::io::Error>(3)
        })
        .unwrap();
    assert_eq!(n, 3);

    let err = ctx
        .scope(["failed"], |_| Err::<(), _>(std::io::Error::other("bad input")))
        .unwrap_err();
    match err {
        ScopeError::Body(e) => assert_eq!(e.to_string(), "bad input"),
        other => panic!("unexpected error {other:?}"),
    }

    let statuses: Vec<_> = sink.records().iter().map(|r| r.run.status).collect();
    assert_eq!(statuses, vec![RunStatus::Completed, RunStatus::Failed]);
    assert!(ctx.current().is_none());
}

#[test]
fn scope_conflict() {
    let ctx = RunContext::new(config()).unwrap();
    let outer = ctx.begin(["outer"]).unwrap();
    let err = ctx.scope(["inner"], |_| Ok::<_, std::io::Error>(())).unwrap_err();
    assert!(matches!(err, ScopeError::Conflict(c) if c.active == outer.id()));
    ctx.end(&outer, RunStatus::Completed).unwrap();
}

#[test]
fn records_are_dropped_in_the_lobby() {
    let tmp = tempfile::tempdir().unwrap();
    let log_dir = tmp.path().join("runs");
    init_log_dir(&log_dir).unwrap();

    let mut config = config();
    config.log_dir = Some(log_dir.clone());
    config.tags.insert(String::from("lobby-test"));
    let ctx = RunContext::new(config).unwrap();
    let run = ctx.begin(["training"]).unwrap();
    thread::sleep(INTERVAL * 3);
    let record = ctx.end(&run, RunStatus::Completed).unwrap();

    let path = log_dir.join(LOBBY_DIR).join(format!("{}.toml", run.id()));
    assert_eq!(LobbySink::new(&log_dir).record_path(&record), path);
    let content = fs::read_to_string(&path).unwrap();
    let parsed: RunRecord = toml::from_str(&content).unwrap();
    assert_eq!(&parsed, record.as_ref());
    assert!(parsed.run.tags.contains("lobby-test"));
    assert!(parsed.run.tags.contains("training"));

    // no temporary file is left behind
    let files: Vec<_> = fs::read_dir(log_dir.join(LOBBY_DIR)).unwrap().collect();
    assert_eq!(files.len(), 1);
}

struct FailingSink;

impl RecordSink for FailingSink {
    fn accept(&self, _record: &RunRecord) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("disk full"))
    }
}

#[test]
fn rejected_record_is_still_stored() {
    let ctx = RunContext::with_sinks(config(), vec![Box::new(FailingSink)]).unwrap();
    let run = ctx.begin(["sink"]).unwrap();
    match ctx.end(&run, RunStatus::Completed) {
        Err(EndError::Sink { run: id, source }) => {
            assert_eq!(id, run.id());
            assert_eq!(source.to_string(), "disk full");
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert!(ctx.record(run.id()).is_some());
    // the slot is free again
    assert!(ctx.begin(["next"]).is_ok());
}

#[test]
#[serial]
fn global_context() {
    let run = RunContext::global().begin(["global"]).unwrap();
    assert_eq!(runmeter::current(), Some(run.clone()));
    RunContext::global().end(&run, RunStatus::Completed).unwrap();
    assert_eq!(runmeter::current(), None);
    assert!(!RunContext::init_global(Config::default()).unwrap());
    assert!(RunContext::init_global(Config::default().with_interval(Duration::ZERO)).is_err());
}
