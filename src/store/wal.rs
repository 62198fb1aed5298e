//! Write-ahead log of job record mutations.
//!
//! One JSON object per line: `{"seq":…,"op":{…},"crc":…}`, where `crc` is
//! the CRC-32 of the serialised op. Replay stops at the first line that
//! fails to parse or verify; everything from there on is cut off.
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::types::job::{JobId, JobRecord, QueueName};

pub const WAL_FILE: &str = "jobs.wal";

/// A single mutation of the record set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WalOp {
    /// Written first by a compacted log so ids are never reused.
    Checkpoint { next_id: JobId },
    Enqueue { record: JobRecord },
    Retry {
        id: JobId,
        attempt: u32,
        last_error: String,
        retry_after: DateTime<Utc>,
    },
    Complete { id: JobId },
    Drop {
        id: JobId,
        error: String,
        at: DateTime<Utc>,
    },
    Clear { queue: QueueName, ids: Vec<JobId> },
}

impl WalOp {
    fn checksum(&self) -> Result<u32, serde_json::Error> {
        Ok(crc32fast::hash(serde_json::to_string(self)?.as_bytes()))
    }
}

#[derive(Serialize)]
struct EntryOut<'a> {
    seq: u64,
    op: &'a WalOp,
    crc: u32,
}

#[derive(Deserialize)]
struct EntryIn {
    seq: u64,
    op: WalOp,
    crc: u32,
}

/// Appends to `jobs.wal` inside the store directory.
#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    file: File,
    /// Bytes of whole, acknowledged entries.
    len: u64,
    /// A failed write may have left a fragment past `len`.
    torn: bool,
    next_seq: u64,
    fsync: bool,
}

impl Wal {
    /// Opens (or creates) the log in `dir` and returns the ops it holds.
    /// A corrupt tail is truncated away.
    pub fn open(dir: &Path, fsync: bool) -> Result<(Self, Vec<WalOp>), StoreError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(WAL_FILE);

        let replay = read_valid(&path)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        if len > replay.valid_len {
            warn!(
                path = %path.display(),
                discarded_bytes = len - replay.valid_len,
                "truncating corrupt log tail"
            );
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }

        debug!(path = %path.display(), entries = replay.ops.len(), "log opened");

        Ok((
            Self {
                path,
                file,
                len: replay.valid_len,
                torn: false,
                next_seq: replay.last_seq + 1,
                fsync,
            },
            replay.ops,
        ))
    }

    /// Appends one entry. On failure the log is cut back to the last good
    /// entry, so a fragment can't swallow the entries written after it.
    pub fn append(&mut self, op: &WalOp) -> Result<(), StoreError> {
        let line = encode(self.next_seq, op)?;
        if self.torn {
            self.cut_back()?;
        }

        if let Err(error) = self.write_line(line.as_bytes()) {
            self.torn = true;
            if let Err(cut) = self.cut_back() {
                warn!(error = %cut, len = self.len, "could not cut back a failed log write");
            }
            return Err(error.into());
        }

        self.len += line.len() as u64;
        self.next_seq += 1;
        Ok(())
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.file.write_all(line)?;
        if self.fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn cut_back(&mut self) -> io::Result<()> {
        self.file.set_len(self.len)?;
        self.torn = false;
        Ok(())
    }

    /// Replaces the whole log with `ops`: written to a temp file, synced,
    /// then renamed over the old one. Until the rename succeeds the old log
    /// stays in use.
    pub fn rewrite(&mut self, ops: &[WalOp]) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("wal.tmp");

        let mut out = BufWriter::new(File::create(&tmp)?);
        let mut len = 0;
        for (i, op) in ops.iter().enumerate() {
            let line = encode(i as u64 + 1, op)?;
            out.write_all(line.as_bytes())?;
            len += line.len() as u64;
        }
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        // Opened before the rename; the handle follows the file.
        let file = OpenOptions::new().append(true).open(&tmp)?;
        fs::rename(&tmp, &self.path)?;

        self.file = file;
        self.len = len;
        self.torn = false;
        self.next_seq = ops.len() as u64 + 1;

        debug!(path = %self.path.display(), entries = ops.len(), "log rewritten");
        Ok(())
    }
}

fn encode(seq: u64, op: &WalOp) -> Result<String, StoreError> {
    let entry = EntryOut {
        seq,
        op,
        crc: op.checksum()?,
    };
    let mut line = serde_json::to_string(&entry)?;
    line.push('\n');
    Ok(line)
}

struct Replay {
    ops: Vec<WalOp>,
    valid_len: u64,
    last_seq: u64,
}

fn read_valid(path: &Path) -> Result<Replay, StoreError> {
    let mut replay = Replay {
        ops: Vec::new(),
        valid_len: 0,
        last_seq: 0,
    };

    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(replay),
        Err(e) => return Err(e.into()),
    };

    let mut reader = BufReader::new(file);
    let mut line = String::new();
    loop {
        line.clear();
        let n = match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(offset = replay.valid_len, "log entry is not valid UTF-8");
                break;
            },
            Err(e) => return Err(e.into()),
        };

        if !line.ends_with('\n') {
            warn!(offset = replay.valid_len, "torn write at the end of the log");
            break;
        }

        let entry: EntryIn = match serde_json::from_str(line.trim_end()) {
            Ok(entry) => entry,
            Err(error) => {
                warn!(%error, offset = replay.valid_len, "corrupt log entry");
                break;
            },
        };

        if entry.op.checksum()? != entry.crc {
            warn!(seq = entry.seq, "log entry checksum mismatch");
            break;
        }

        replay.last_seq = entry.seq;
        replay.ops.push(entry.op);
        replay.valid_len += n as u64;
    }

    Ok(replay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::job::NewJob;

    fn enqueue(id: JobId) -> WalOp {
        WalOp::Enqueue {
            record: JobRecord::from_new(
                id,
                NewJob::new(QueueName::General, "udp-command", format!("{{\"n\":{id}}}"))
                    .with_created_at(DateTime::from_timestamp(1_700_000_000, 0).unwrap()),
            ),
        }
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();

        let (mut wal, ops) = Wal::open(dir.path(), true).unwrap();
        assert!(ops.is_empty());
        wal.append(&enqueue(1)).unwrap();
        wal.append(&WalOp::Complete { id: 1 }).unwrap();
        drop(wal);

        let (mut wal, ops) = Wal::open(dir.path(), true).unwrap();
        assert_eq!(ops, vec![enqueue(1), WalOp::Complete { id: 1 }]);

        // Sequence numbers carry on after a reopen.
        wal.append(&enqueue(2)).unwrap();
        drop(wal);
        let text = fs::read_to_string(dir.path().join(WAL_FILE)).unwrap();
        assert!(text.lines().last().unwrap().starts_with("{\"seq\":3,"));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();

        let (mut wal, _) = Wal::open(dir.path(), false).unwrap();
        wal.append(&enqueue(1)).unwrap();
        wal.append(&enqueue(2)).unwrap();
        drop(wal);

        let path = dir.path().join(WAL_FILE);
        let good_len = fs::metadata(&path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\":3,\"op\":{\"kind\":\"comp").unwrap();
        drop(file);

        let (_, ops) = Wal::open(dir.path(), false).unwrap();
        assert_eq!(ops, vec![enqueue(1), enqueue(2)]);
        assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
    }

    #[test]
    fn test_checksum_mismatch_stops_replay() {
        let dir = tempfile::tempdir().unwrap();

        let (mut wal, _) = Wal::open(dir.path(), false).unwrap();
        wal.append(&enqueue(1)).unwrap();
        wal.append(&enqueue(2)).unwrap();
        wal.append(&enqueue(3)).unwrap();
        drop(wal);

        let path = dir.path().join(WAL_FILE);
        let text = fs::read_to_string(&path).unwrap();
        let tampered = text.replacen("{\\\"n\\\":2}", "{\\\"n\\\":9}", 1);
        assert_ne!(text, tampered);
        fs::write(&path, tampered).unwrap();

        let (_, ops) = Wal::open(dir.path(), false).unwrap();
        assert_eq!(ops, vec![enqueue(1)]);
    }

    #[test]
    fn test_rewrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();

        let (mut wal, _) = Wal::open(dir.path(), true).unwrap();
        for id in 1..=5 {
            wal.append(&enqueue(id)).unwrap();
        }
        wal.rewrite(&[WalOp::Checkpoint { next_id: 6 }, enqueue(4)])
            .unwrap();
        wal.append(&WalOp::Complete { id: 4 }).unwrap();
        drop(wal);

        let (_, ops) = Wal::open(dir.path(), true).unwrap();
        assert_eq!(
            ops,
            vec![
                WalOp::Checkpoint { next_id: 6 },
                enqueue(4),
                WalOp::Complete { id: 4 },
            ]
        );
        assert!(!dir.path().join("jobs.wal.tmp").exists());
    }

    #[test]
    fn test_failed_write_does_not_hide_later_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(WAL_FILE);

        let (mut wal, _) = Wal::open(dir.path(), false).unwrap();
        wal.append(&enqueue(1)).unwrap();

        // A write that died halfway through its line.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"seq\":2,\"op\":{\"kind\":\"enq").unwrap();
        drop(file);
        wal.torn = true;

        wal.append(&enqueue(2)).unwrap();
        wal.append(&WalOp::Complete { id: 1 }).unwrap();
        drop(wal);

        let (_, ops) = Wal::open(dir.path(), false).unwrap();
        assert_eq!(ops, vec![enqueue(1), enqueue(2), WalOp::Complete { id: 1 }]);
    }

    #[test]
    fn test_appends_after_rewrite_land_in_the_new_log() {
        let dir = tempfile::tempdir().unwrap();

        let (mut wal, _) = Wal::open(dir.path(), false).unwrap();
        wal.append(&enqueue(1)).unwrap();
        wal.append(&enqueue(2)).unwrap();
        wal.rewrite(&[enqueue(2)]).unwrap();

        // Cutting back uses the rewritten length, not the old one.
        wal.torn = true;
        wal.append(&enqueue(3)).unwrap();
        drop(wal);

        let (_, ops) = Wal::open(dir.path(), false).unwrap();
        assert_eq!(ops, vec![enqueue(2), enqueue(3)]);
    }
}
