//! Durable Raft log
//!
//! Three files live in the node's data directory:
//!
//! - `raft.log`: append-only entry records
//! - `raft.state`: term, vote and commit index, replaced atomically
//! - `snapshot.bin`: the latest metadata snapshot, replaced atomically
//!
//! Every record is framed as `[MAGIC][LEN u32][PAYLOAD][CRC32]` with a
//! bincode payload. A torn or corrupt tail of `raft.log` is dropped on open.
//!
//! The log is driven from the Raft actor task. File rewrites and fsyncs go
//! through [`blocking`] so a slow disk parks only the actor, not the other
//! tasks sharing its runtime worker.

use crate::common::raft::{LogEntry, Members, NodeId};
use crate::common::{crc32, Error, Result, WalSyncPolicy};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tokio::runtime::{Handle, RuntimeFlavor};

const LOG_MAGIC: [u8; 4] = *b"RLG1";
const STATE_MAGIC: [u8; 4] = *b"RHS1";
const SNAPSHOT_MAGIC: [u8; 4] = *b"RSN1";

const LOG_FILE: &str = "raft.log";
const STATE_FILE: &str = "raft.state";
const SNAPSHOT_FILE: &str = "snapshot.bin";

/// Raft state that must survive restarts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub commit_index: u64,
}

/// State machine image covering every entry up to `last_included_index`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub members: Members,
    pub data: Vec<u8>,
}

pub struct RaftLog {
    dir: PathBuf,
    writer: BufWriter<File>,
    sync_policy: WalSyncPolicy,
    /// `entries[i].index == snapshot_index() + 1 + i`
    entries: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
}

impl RaftLog {
    /// Open or create the log in `dir`, returning it with the persisted hard state
    pub fn open(dir: impl AsRef<Path>, sync_policy: WalSyncPolicy) -> Result<(Self, HardState)> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let snapshot: Option<Snapshot> = read_record_file(&dir.join(SNAPSHOT_FILE), SNAPSHOT_MAGIC)?;
        let hard_state: HardState =
            read_record_file(&dir.join(STATE_FILE), STATE_MAGIC)?.unwrap_or_default();

        let snapshot_index = snapshot.as_ref().map_or(0, |s| s.last_included_index);
        let (entries, clean) = Self::load_entries(&dir.join(LOG_FILE), snapshot_index)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))?;

        let mut log = Self {
            dir,
            writer: BufWriter::new(file),
            sync_policy,
            entries,
            snapshot,
        };
        if !clean {
            log.rewrite()?;
        }

        tracing::debug!(
            "Opened raft log: snapshot_index={}, last_index={}, term={}",
            log.snapshot_index(),
            log.last_index(),
            hard_state.term
        );
        Ok((log, hard_state))
    }

    /// Read entries following the snapshot. The flag is false when the file
    /// held anything that has to be rewritten away.
    fn load_entries(path: &Path, snapshot_index: u64) -> Result<(Vec<LogEntry>, bool)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), true)),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);
        let mut entries: Vec<LogEntry> = Vec::new();
        let mut clean = true;

        loop {
            let payload = match read_frame(&mut reader, LOG_MAGIC) {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Raft log replay stopped at corrupted record: {}", e);
                    clean = false;
                    break;
                }
            };
            let entry: LogEntry = match bincode::deserialize(&payload) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Raft log replay stopped at undecodable entry: {}", e);
                    clean = false;
                    break;
                }
            };
            if entry.index <= snapshot_index {
                // Covered by the snapshot; compaction was interrupted
                clean = false;
                continue;
            }
            let expected = entries.last().map_or(snapshot_index + 1, |e| e.index + 1);
            if entry.index != expected {
                tracing::warn!(
                    "Raft log gap: expected index {}, found {}; dropping the rest",
                    expected,
                    entry.index
                );
                clean = false;
                break;
            }
            entries.push(entry);
        }
        Ok((entries, clean))
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot.as_ref().map_or(0, |s| s.last_included_index)
    }

    pub fn snapshot_term(&self) -> u64 {
        self.snapshot.as_ref().map_or(0, |s| s.last_included_term)
    }

    pub fn last_index(&self) -> u64 {
        self.entries
            .last()
            .map_or(self.snapshot_index(), |e| e.index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map_or(self.snapshot_term(), |e| e.term)
    }

    /// Term of the entry at `index`; None when compacted away or beyond the log
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index() {
            return Some(self.snapshot_term());
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: u64) -> Option<&LogEntry> {
        let snapshot_index = self.snapshot_index();
        if index <= snapshot_index {
            return None;
        }
        self.entries.get((index - snapshot_index - 1) as usize)
    }

    /// Up to `max` entries starting at `index`
    pub fn entries_from(&self, index: u64, max: usize) -> Vec<LogEntry> {
        let start = index.max(self.snapshot_index() + 1);
        let offset = (start - self.snapshot_index() - 1) as usize;
        self.entries
            .iter()
            .skip(offset)
            .take(max)
            .cloned()
            .collect()
    }

    /// First index of the run of entries sharing the term of `index`
    pub fn first_index_of_term(&self, index: u64) -> u64 {
        let Some(term) = self.term_at(index) else {
            return self.snapshot_index() + 1;
        };
        let mut first = index;
        while first > self.snapshot_index() + 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    /// Append entries that directly follow the current last index
    pub fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let expected = self.last_index() + 1;
        if entries[0].index != expected {
            return Err(Error::Raft(format!(
                "non-contiguous append: expected index {}, got {}",
                expected, entries[0].index
            )));
        }
        for entry in entries {
            let payload = bincode::serialize(entry)?;
            write_frame(&mut self.writer, LOG_MAGIC, &payload)?;
        }
        self.sync()?;
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    /// Drop every entry at or after `index`
    pub fn truncate_from(&mut self, index: u64) -> Result<()> {
        if index > self.last_index() {
            return Ok(());
        }
        if index <= self.snapshot_index() {
            return Err(Error::Raft(format!(
                "cannot truncate at {}: entries up to {} are in the snapshot",
                index,
                self.snapshot_index()
            )));
        }
        let keep = (index - self.snapshot_index() - 1) as usize;
        self.entries.truncate(keep);
        self.rewrite()
    }

    /// Persist a snapshot and drop the log prefix it covers.
    ///
    /// Entries after the snapshot are kept only when the log agrees with the
    /// snapshot's last entry; otherwise the whole log is discarded.
    pub fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        write_record_file(
            &self.dir.join(SNAPSHOT_FILE),
            SNAPSHOT_MAGIC,
            &snapshot,
            self.sync_policy,
        )?;

        let keep_suffix =
            self.term_at(snapshot.last_included_index) == Some(snapshot.last_included_term);
        let last_included = snapshot.last_included_index;
        if keep_suffix {
            self.entries.retain(|e| e.index > last_included);
        } else {
            self.entries.clear();
        }
        self.snapshot = Some(snapshot);
        self.rewrite()
    }

    pub fn save_hard_state(&self, state: &HardState) -> Result<()> {
        write_record_file(&self.dir.join(STATE_FILE), STATE_MAGIC, state, self.sync_policy)
    }

    /// Replace the log file with the in-memory entries
    fn rewrite(&mut self) -> Result<()> {
        let path = self.dir.join(LOG_FILE);
        let tmp = self.dir.join(format!("{}.tmp", LOG_FILE));
        let file = blocking(|| -> Result<File> {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for entry in &self.entries {
                let payload = bincode::serialize(entry)?;
                write_frame(&mut writer, LOG_MAGIC, &payload)?;
            }
            writer.flush()?;
            if self.sync_policy != WalSyncPolicy::Never {
                writer.get_ref().sync_all()?;
            }
            drop(writer);
            fs::rename(&tmp, &path)?;
            Ok(OpenOptions::new().create(true).append(true).open(&path)?)
        })?;
        self.writer = BufWriter::new(file);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        match self.sync_policy {
            WalSyncPolicy::Always => {
                let writer = &mut self.writer;
                blocking(|| -> Result<()> {
                    writer.flush()?;
                    writer.get_ref().sync_data()?;
                    Ok(())
                })?;
            }
            WalSyncPolicy::Interval => {
                self.writer.flush()?;
            }
            WalSyncPolicy::Never => {}
        }
        Ok(())
    }
}

fn write_frame<W: Write>(writer: &mut W, magic: [u8; 4], payload: &[u8]) -> Result<()> {
    writer.write_all(&magic)?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(payload)?;
    writer.write_all(&crc32(payload).to_le_bytes())?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean end of file
fn read_frame<R: Read>(reader: &mut R, magic: [u8; 4]) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if header != magic {
        return Err(Error::Corrupted("bad record magic".into()));
    }

    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|_| Error::Corrupted("truncated record length".into()))?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|_| Error::Corrupted("truncated record payload".into()))?;

    let mut crc_bytes = [0u8; 4];
    reader
        .read_exact(&mut crc_bytes)
        .map_err(|_| Error::Corrupted("truncated record checksum".into()))?;
    let expected = u32::from_le_bytes(crc_bytes);
    let actual = crc32(&payload);
    if expected != actual {
        return Err(Error::Corrupted(format!(
            "checksum mismatch: expected {:08x}, got {:08x}",
            expected, actual
        )));
    }
    Ok(Some(payload))
}

fn read_record_file<T: DeserializeOwned>(path: &Path, magic: [u8; 4]) -> Result<Option<T>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    match read_frame(&mut reader, magic)? {
        Some(payload) => Ok(Some(bincode::deserialize(&payload)?)),
        None => Err(Error::Corrupted(format!("{} is empty", path.display()))),
    }
}

/// Write a single-record file through a temp file and rename
fn write_record_file<T: Serialize>(
    path: &Path,
    magic: [u8; 4],
    value: &T,
    sync_policy: WalSyncPolicy,
) -> Result<()> {
    let payload = bincode::serialize(value)?;
    let tmp = path.with_extension("tmp");
    blocking(|| -> Result<()> {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        write_frame(&mut writer, magic, &payload)?;
        writer.flush()?;
        if sync_policy != WalSyncPolicy::Never {
            writer.get_ref().sync_all()?;
        }
        drop(writer);
        fs::rename(&tmp, path)?;
        Ok(())
    })
}

/// Run disk work that may block for a while.
///
/// On a multi-threaded runtime the worker hands its other tasks off first.
/// Current-thread runtimes and plain threads run it inline.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::raft::Operation;
    use tempfile::tempdir;

    fn noop(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            op: Operation::Noop,
        }
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let (mut log, state) = RaftLog::open(dir.path(), WalSyncPolicy::Always).unwrap();
            assert_eq!(state, HardState::default());
            log.append(&[noop(1, 1), noop(1, 2), noop(2, 3)]).unwrap();
            log.save_hard_state(&HardState {
                term: 2,
                voted_for: Some("n1".into()),
                commit_index: 2,
            })
            .unwrap();
        }

        let (log, state) = RaftLog::open(dir.path(), WalSyncPolicy::Always).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(state.term, 2);
        assert_eq!(state.voted_for.as_deref(), Some("n1"));
        assert_eq!(state.commit_index, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_synced_writes_from_runtime_worker() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();
        tokio::spawn(async move {
            let (mut log, _) = RaftLog::open(&path, WalSyncPolicy::Always).unwrap();
            log.append(&[noop(1, 1), noop(1, 2), noop(1, 3)]).unwrap();
            log.truncate_from(3).unwrap();
            log.save_hard_state(&HardState {
                term: 1,
                voted_for: None,
                commit_index: 2,
            })
            .unwrap();
        })
        .await
        .unwrap();

        let (log, state) = RaftLog::open(dir.path(), WalSyncPolicy::Always).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(state.commit_index, 2);
    }

    #[test]
    fn test_non_contiguous_append_is_rejected() {
        let dir = tempdir().unwrap();
        let (mut log, _) = RaftLog::open(dir.path(), WalSyncPolicy::Never).unwrap();
        log.append(&[noop(1, 1)]).unwrap();
        assert!(log.append(&[noop(1, 3)]).is_err());
    }

    #[test]
    fn test_truncate_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let (mut log, _) = RaftLog::open(dir.path(), WalSyncPolicy::Always).unwrap();
            log.append(&[noop(1, 1), noop(1, 2), noop(1, 3)]).unwrap();
            log.truncate_from(2).unwrap();
            log.append(&[noop(3, 2)]).unwrap();
        }
        let (log, _) = RaftLog::open(dir.path(), WalSyncPolicy::Always).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(2), Some(3));
    }

    #[test]
    fn test_corrupted_tail_is_dropped() {
        let dir = tempdir().unwrap();
        {
            let (mut log, _) = RaftLog::open(dir.path(), WalSyncPolicy::Always).unwrap();
            log.append(&[noop(1, 1), noop(1, 2)]).unwrap();
        }
        // Simulate a torn write
        let path = dir.path().join(LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&LOG_MAGIC).unwrap();
        file.write_all(&[0xff, 0x00]).unwrap();
        drop(file);

        {
            let (mut log, _) = RaftLog::open(dir.path(), WalSyncPolicy::Always).unwrap();
            assert_eq!(log.last_index(), 2);
            log.append(&[noop(1, 3)]).unwrap();
        }
        let (log, _) = RaftLog::open(dir.path(), WalSyncPolicy::Always).unwrap();
        assert_eq!(log.last_index(), 3);
    }

    #[test]
    fn test_snapshot_compacts_prefix() {
        let dir = tempdir().unwrap();
        {
            let (mut log, _) = RaftLog::open(dir.path(), WalSyncPolicy::Always).unwrap();
            log.append(&[noop(1, 1), noop(1, 2), noop(2, 3), noop(2, 4)])
                .unwrap();
            log.install_snapshot(Snapshot {
                last_included_index: 3,
                last_included_term: 2,
                members: Members::new(),
                data: b"state".to_vec(),
            })
            .unwrap();
            assert_eq!(log.snapshot_index(), 3);
            assert_eq!(log.entry(3), None);
            assert_eq!(log.term_at(3), Some(2));
            assert_eq!(log.entry(4).map(|e| e.term), Some(2));
        }
        let (log, _) = RaftLog::open(dir.path(), WalSyncPolicy::Always).unwrap();
        assert_eq!(log.snapshot().unwrap().data, b"state".to_vec());
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.entries_from(1, 10).len(), 1);
    }

    #[test]
    fn test_conflicting_snapshot_discards_log() {
        let dir = tempdir().unwrap();
        let (mut log, _) = RaftLog::open(dir.path(), WalSyncPolicy::Never).unwrap();
        log.append(&[noop(1, 1), noop(1, 2)]).unwrap();
        log.install_snapshot(Snapshot {
            last_included_index: 5,
            last_included_term: 4,
            members: Members::new(),
            data: Vec::new(),
        })
        .unwrap();
        assert_eq!(log.last_index(), 5);
        assert_eq!(log.last_term(), 4);
        assert!(log.entries_from(1, 10).is_empty());
    }

    #[test]
    fn test_first_index_of_term() {
        let dir = tempdir().unwrap();
        let (mut log, _) = RaftLog::open(dir.path(), WalSyncPolicy::Never).unwrap();
        log.append(&[noop(1, 1), noop(2, 2), noop(2, 3), noop(2, 4)])
            .unwrap();
        assert_eq!(log.first_index_of_term(4), 2);
        assert_eq!(log.first_index_of_term(1), 1);
    }
}
