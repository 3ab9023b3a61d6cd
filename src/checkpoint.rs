//! Append-only record of task outcomes, replayed on restart.
//!
//! Records are CBOR values written back to back. Each append is synced
//! before the scheduler acts on it, so a crash loses at most the record being
//! written, which replay drops.

use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Write};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::engine::{Stored, TaskId, TaskRecord, TaskState};
use crate::error::FlowError;

pub(crate) const LOG_FILE: &str = "checkpoint.log";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum LogEntry {
    /// First record of every log.
    Start { root: TaskRecord },
    /// A task attached from outside any running body.
    Attach { record: TaskRecord },
    /// Terminal outcome of one task attempt, with the tasks its body created.
    Checkpoint {
        task: TaskId,
        state: TaskState,
        result: Option<Stored>,
        spawned: Vec<TaskRecord>,
    },
}

#[derive(Debug)]
pub(crate) struct CheckpointLog {
    file: File,
}

impl CheckpointLog {
    /// Starts a fresh log, refusing to overwrite an existing one.
    pub fn create(path: &Utf8Path) -> Result<Self, FlowError> {
        if path.exists() {
            let dir = path.parent().unwrap_or(path).to_owned();
            return Err(FlowError::AlreadyStarted(dir));
        }

        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(path)?;

        Ok(Self { file })
    }

    /// Reopens an existing log for appending, cutting it at `valid_len` so
    /// new records follow the last intact one.
    pub fn reopen(path: &Utf8Path, valid_len: u64) -> Result<Self, FlowError> {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_len)?;
        drop(file);

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self { file })
    }

    pub fn append(&mut self, entry: &LogEntry) -> Result<(), FlowError> {
        let mut buffer = Vec::new();
        ciborium::into_writer(entry, &mut buffer).map_err(FlowError::codec)?;

        self.file.write_all(&buffer)?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Reads every intact record, returning them with the length of the
    /// intact prefix.
    pub fn replay(path: &Utf8Path) -> Result<(Vec<LogEntry>, u64), FlowError> {
        let bytes = fs::read(path)?;
        let mut cursor = Cursor::new(bytes.as_slice());
        let mut entries = Vec::new();

        while (cursor.position() as usize) < bytes.len() {
            let at = cursor.position();
            match ciborium::from_reader::<LogEntry, _>(&mut cursor) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    tracing::warn!(
                        "ignoring {} trailing bytes of {path} after byte {at}: {err}",
                        bytes.len() as u64 - at
                    );
                    return Ok((entries, at));
                }
            }
        }

        Ok((entries, bytes.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use ciborium::Value;

    use super::*;
    use crate::engine::Link;
    use crate::testing::utf8;

    fn record(id: u64) -> TaskRecord {
        TaskRecord {
            id: TaskId(id),
            link: Link::Root,
            kind: "emit".into(),
            name: "emit".into(),
            args: Value::Integer(id.into()),
            inputs: Vec::new(),
            resources: None,
            stagger: None,
        }
    }

    #[test]
    fn test_entries_replay_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = utf8(dir.path()).join(LOG_FILE);

        let mut log = CheckpointLog::create(&path).unwrap();
        log.append(&LogEntry::Start { root: record(0) }).unwrap();
        log.append(&LogEntry::Checkpoint {
            task: TaskId(0),
            state: TaskState::Succeeded,
            result: Some(Stored::Value(Value::Text("done".into()))),
            spawned: vec![record(1)],
        })
        .unwrap();

        let (entries, len) = CheckpointLog::replay(&path).unwrap();
        assert_eq!(len, fs::metadata(&path).unwrap().len());
        assert!(matches!(&entries[0], LogEntry::Start { root } if root.id == TaskId(0)));
        assert!(matches!(
            &entries[1],
            LogEntry::Checkpoint { task: TaskId(0), spawned, .. } if spawned.len() == 1
        ));
    }

    #[test]
    fn test_torn_tail_is_dropped_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = utf8(dir.path()).join(LOG_FILE);

        let mut log = CheckpointLog::create(&path).unwrap();
        log.append(&LogEntry::Start { root: record(0) }).unwrap();
        drop(log);

        let intact = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        // Start of a map header with nothing after it.
        file.write_all(&[0xa1, 0x6a]).unwrap();
        drop(file);

        let (entries, valid) = CheckpointLog::replay(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(valid, intact);

        let mut log = CheckpointLog::reopen(&path, valid).unwrap();
        log.append(&LogEntry::Attach { record: record(1) }).unwrap();

        let (entries, _) = CheckpointLog::replay(&path).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_create_refuses_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = utf8(dir.path()).join(LOG_FILE);

        CheckpointLog::create(&path).unwrap();
        assert!(matches!(
            CheckpointLog::create(&path),
            Err(FlowError::AlreadyStarted(_))
        ));
    }
}
