pub mod store;

use crate::code_addr::CodeAddr;
use crate::gdb::{ThreadId, MAIN_THREAD};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

/// What a checkpoint observed.
///
/// The on-disk tag is a string: the empty tag is an untracked shared access,
/// and unknown tags load as `SharedAccess` too, so logs written by newer
/// recorders stay replayable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CheckpointAction {
    /// A read or write of a declared shared variable.
    SharedAccess,
    /// The instruction that executed the thread-creation syscall.
    CreatorThread,
    /// The first recorded instruction of a freshly born thread.
    CreatedThread,
}

impl Default for CheckpointAction {
    fn default() -> Self {
        CheckpointAction::SharedAccess
    }
}

impl CheckpointAction {
    fn tag(self) -> &'static str {
        match self {
            CheckpointAction::SharedAccess => "",
            CheckpointAction::CreatorThread => "creator_thread",
            CheckpointAction::CreatedThread => "created_thread",
        }
    }
}

impl Serialize for CheckpointAction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.tag())
    }
}

impl<'de> Deserialize<'de> for CheckpointAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<CheckpointAction, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(match tag.as_str() {
            "creator_thread" => CheckpointAction::CreatorThread,
            "created_thread" => CheckpointAction::CreatedThread,
            _ => CheckpointAction::SharedAccess,
        })
    }
}

/// A single observed event: which thread stopped where, and why the location
/// was interesting. Immutable once the log is written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: u64,
    /// Global thread numbering of the debugger; 1 is the primary thread.
    pub thread: ThreadId,
    pub location: CodeAddr,
    #[serde(default)]
    pub action: CheckpointAction,
}

/// The recorded interleaving: an ordered sequence of checkpoint records plus
/// the thread start-routine symbols that seeded breakpoints during recording.
/// Round-trips to the checkpoint JSON file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointLog {
    pub checkpoints: Vec<CheckpointRecord>,
    #[serde(default)]
    pub thread_start_routines: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LogFileError {
    #[error("could not open checkpoint file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse checkpoint file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed checkpoint log: {0}")]
    Malformed(String),
}

impl CheckpointLog {
    pub fn load(path: &Path) -> Result<CheckpointLog, LogFileError> {
        let file = File::open(path)?;
        let log: CheckpointLog = serde_json::from_reader(BufReader::new(file))?;
        Ok(log)
    }

    pub fn save(&self, path: &Path) -> Result<(), LogFileError> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Checks the well-formedness invariants a replay relies on: ids are
    /// `0..N-1` in sequence order, the first record belongs to the main
    /// thread, and every created-thread record immediately follows a
    /// creator-thread record.
    pub fn validate(&self) -> Result<(), LogFileError> {
        for (index, record) in self.checkpoints.iter().enumerate() {
            if record.id != index as u64 {
                return Err(LogFileError::Malformed(format!(
                    "record at position {} has id {}",
                    index, record.id
                )));
            }
            if record.action == CheckpointAction::CreatedThread {
                let preceded_by_creator = index > 0
                    && self.checkpoints[index - 1].action == CheckpointAction::CreatorThread;
                if !preceded_by_creator {
                    return Err(LogFileError::Malformed(format!(
                        "created-thread record {} is not preceded by its creator",
                        record.id
                    )));
                }
            }
        }
        if let Some(first) = self.checkpoints.first() {
            if first.thread != MAIN_THREAD {
                return Err(LogFileError::Malformed(format!(
                    "first record belongs to thread {}, not the main thread",
                    first.thread
                )));
            }
        }
        Ok(())
    }

    /// Distinct locations of `thread`'s records in first-seen order, skipping
    /// records of the excluded action kind.
    pub fn locations_for(&self, thread: ThreadId, exclude: CheckpointAction) -> Vec<CodeAddr> {
        let mut locations: Vec<CodeAddr> = Vec::new();
        for record in &self.checkpoints {
            if record.thread != thread || record.action == exclude {
                continue;
            }
            if !locations.contains(&record.location) {
                locations.push(record.location);
            }
        }
        locations
    }
}
