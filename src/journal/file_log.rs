//! File-backed edit log
//!
//! Record format: [MAGIC][SEQUENCE][OP][META_VERSION][PAYLOAD_LEN][PAYLOAD][CRC32]
//!
//! Records are only ever appended. On open the last sequence is recovered by
//! scanning the file; replay stops at the first torn or corrupted record.

use crate::common::{crc32, Error, JournalSyncPolicy, Result};
use crate::journal::{EditLog, JournalEntry, JournalOp, CURRENT_META_VERSION};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const LOG_MAGIC: [u8; 4] = [0x53, 0x43, 0x4A, 0x31]; // "SCJ1"

/// Upper bound on a single record payload
const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

struct Writer {
    writer: BufWriter<File>,
    next_sequence: u64,
}

pub struct FileEditLog {
    path: PathBuf,
    sync_policy: JournalSyncPolicy,
    inner: Mutex<Writer>,
}

impl FileEditLog {
    /// Open or create the log file, resuming after its last valid record.
    pub fn open(path: impl AsRef<Path>, sync_policy: JournalSyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (next_sequence, valid_len) = Self::scan(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        // drop a torn tail so new records stay reachable on replay
        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                "truncating edit log {} to {} bytes",
                path.display(),
                valid_len
            );
            file.set_len(valid_len)?;
        }
        tracing::info!(
            "opened edit log {} (next sequence {})",
            path.display(),
            next_sequence
        );

        Ok(Self {
            path,
            sync_policy,
            inner: Mutex::new(Writer {
                writer: BufWriter::new(file),
                next_sequence,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_sequence(&self) -> u64 {
        self.inner
            .lock()
            .map(|w| w.next_sequence)
            .unwrap_or_else(|e| e.into_inner().next_sequence)
    }

    /// Returns the next sequence and the byte length of the valid prefix.
    fn scan(path: &Path) -> Result<(u64, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut max_seq = None;
        let mut valid_len = 0u64;

        while let Ok(Some(entry)) = Self::read_entry(&mut reader) {
            max_seq = Some(max_seq.unwrap_or(0).max(entry.sequence));
            valid_len += record_len(entry.payload.len());
        }

        Ok((max_seq.map(|s| s + 1).unwrap_or(0), valid_len))
    }

    fn write_entry(
        writer: &mut BufWriter<File>,
        sequence: u64,
        op: JournalOp,
        payload: &[u8],
    ) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::Journal(format!(
                "record payload too large: {} bytes",
                payload.len()
            )));
        }

        let mut header = Vec::with_capacity(17);
        header.extend_from_slice(&sequence.to_le_bytes());
        header.push(op.code());
        header.extend_from_slice(&CURRENT_META_VERSION.to_le_bytes());
        header.extend_from_slice(&(payload.len() as u32).to_le_bytes());

        let mut checksum_data = header.clone();
        checksum_data.extend_from_slice(payload);
        let checksum = crc32(&checksum_data);

        writer.write_all(&LOG_MAGIC)?;
        writer.write_all(&header)?;
        writer.write_all(payload)?;
        writer.write_all(&checksum.to_le_bytes())?;
        Ok(())
    }

    fn maybe_sync(&self, writer: &mut BufWriter<File>) -> Result<()> {
        match self.sync_policy {
            JournalSyncPolicy::Always => {
                writer.flush()?;
                writer.get_ref().sync_all()?;
            }
            JournalSyncPolicy::Interval => {
                writer.flush()?;
            }
            JournalSyncPolicy::Never => {}
        }
        Ok(())
    }

    /// Replay every valid record in order
    pub fn replay<F>(path: impl AsRef<Path>, mut callback: F) -> Result<()>
    where
        F: FnMut(JournalEntry) -> Result<()>,
    {
        let file = match File::open(path.as_ref()) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);

        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some(entry)) => callback(entry)?,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("edit log replay stopped at corrupted record: {}", e);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Collect every valid record
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<JournalEntry>> {
        let mut entries = Vec::new();
        Self::replay(path, |entry| {
            entries.push(entry);
            Ok(())
        })?;
        Ok(entries)
    }

    fn read_entry<R: Read>(reader: &mut R) -> Result<Option<JournalEntry>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if magic != LOG_MAGIC {
            return Err(Error::Journal("Invalid record magic".into()));
        }

        let mut header = [0u8; 17];
        reader.read_exact(&mut header)?;
        let sequence = u64::from_le_bytes(read_array(&header[0..8]));
        let op_code = header[8];
        let meta_version = u32::from_le_bytes(read_array(&header[9..13]));
        let payload_len = u32::from_le_bytes(read_array(&header[13..17])) as usize;

        if payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::Journal(format!(
                "record payload length {} exceeds limit",
                payload_len
            )));
        }

        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let mut checksum_data = header.to_vec();
        checksum_data.extend_from_slice(&payload);
        if crc32(&checksum_data) != stored_checksum {
            return Err(Error::Journal("Checksum mismatch".into()));
        }

        Ok(Some(JournalEntry {
            sequence,
            op: JournalOp::from_code(op_code)?,
            meta_version,
            payload,
        }))
    }

    /// Sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Internal("edit log lock poisoned".into()))?;
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        Ok(())
    }
}

/// On-disk size of a record: magic + header + payload + checksum
fn record_len(payload_len: usize) -> u64 {
    (4 + 17 + payload_len + 4) as u64
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

impl EditLog for FileEditLog {
    fn append(&self, op: JournalOp, payload: &[u8]) -> Result<u64> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| Error::Internal("edit log lock poisoned".into()))?;
        let sequence = inner.next_sequence;
        Self::write_entry(&mut inner.writer, sequence, op, payload)?;
        self.maybe_sync(&mut inner.writer)?;
        inner.next_sequence += 1;
        Ok(sequence)
    }
}

impl std::fmt::Debug for FileEditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEditLog")
            .field("path", &self.path)
            .field("sync_policy", &self.sync_policy)
            .finish()
    }
}
