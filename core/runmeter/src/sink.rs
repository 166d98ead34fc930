//! Destinations of the finalized run records.
//!
//! Every record is given to the sinks of its [`RunContext`](crate::RunContext)
//! once, right after the run has ended.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;

use crate::merger::lock;
use crate::record::RunRecord;

/// Name of the directory, inside the log directory, where the records are dropped.
pub const LOBBY_DIR: &str = "lobby";

/// Accepts the finalized run records.
pub trait RecordSink: Send + Sync {
    fn accept(&self, record: &RunRecord) -> anyhow::Result<()>;
}

/// Keeps the records in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<Arc<RunRecord>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the records received so far.
    pub fn records(&self) -> Vec<Arc<RunRecord>> {
        lock(&self.records).clone()
    }
}

impl RecordSink for MemorySink {
    fn accept(&self, record: &RunRecord) -> anyhow::Result<()> {
        lock(&self.records).push(Arc::new(record.clone()));
        Ok(())
    }
}

/// Writes each record to `<log_dir>/lobby/<run id>.toml`, for later ingestion.
///
/// The record of an active run can be written several times, the last write wins.
#[derive(Debug, Clone)]
pub struct LobbySink {
    lobby: PathBuf,
}

impl LobbySink {
    pub fn new(log_dir: impl AsRef<Path>) -> Self {
        Self {
            lobby: log_dir.as_ref().join(LOBBY_DIR),
        }
    }

    /// Path of the file that contains the record of a run.
    pub fn record_path(&self, record: &RunRecord) -> PathBuf {
        self.lobby.join(format!("{}.toml", record.run.id))
    }
}

impl RecordSink for LobbySink {
    fn accept(&self, record: &RunRecord) -> anyhow::Result<()> {
        fs::create_dir_all(&self.lobby).with_context(|| format!("could not create the lobby {:?}", self.lobby))?;
        let content = toml::to_string(record).context("could not serialize the run record")?;

        // write then rename, so that readers never see a partial record
        let path = self.record_path(record);
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, content).with_context(|| format!("could not write {tmp:?}"))?;
        fs::rename(&tmp, &path).with_context(|| format!("could not move the record to {path:?}"))?;
        log::debug!("run record written to {path:?}");
        Ok(())
    }
}

/// Prepares a log directory: creates it, with its lobby and a `.gitignore` that excludes the lobby.
pub fn init_log_dir(log_dir: impl AsRef<Path>) -> anyhow::Result<()> {
    let log_dir = log_dir.as_ref();
    fs::create_dir_all(log_dir.join(LOBBY_DIR)).with_context(|| format!("could not create {log_dir:?}"))?;
    let gitignore = log_dir.join(".gitignore");
    if !gitignore.exists() {
        fs::write(&gitignore, format!("/{LOBBY_DIR}/\n")).with_context(|| format!("could not write {gitignore:?}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn log_dir_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let log_dir = tmp.path().join("runs");
        init_log_dir(&log_dir).unwrap();
        assert!(log_dir.join(LOBBY_DIR).is_dir());
        assert_eq!(fs::read_to_string(log_dir.join(".gitignore")).unwrap(), "/lobby/\n");

        // an existing .gitignore is kept
        fs::write(log_dir.join(".gitignore"), "custom\n").unwrap();
        init_log_dir(&log_dir).unwrap();
        assert_eq!(fs::read_to_string(log_dir.join(".gitignore")).unwrap(), "custom\n");
    }
}
