//! Per-object write journal.
//!
//! Every journaled write appends one record describing it to
//! `<shard>/<hex id>.history`, next to the object itself.
//!
//! On-disk format:
//! ```text
//! [4 bytes: payload length (little-endian u32)]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [N bytes: payload (bincode-serialized JournalRecord)]
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use cairn_protocol::IoAttr;
use cairn_types::ObjectId;

use crate::error::{StoreError, StoreResult};

const HEADER_SIZE: usize = 8;

/// One journaled write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Identifier carried by the IO attribute (usually the content id).
    pub id: ObjectId,
    pub offset: u64,
    pub size: u64,
    pub flags: u64,
}

impl From<&IoAttr> for JournalRecord {
    fn from(io: &IoAttr) -> Self {
        Self {
            id: io.id,
            offset: io.offset,
            size: io.size,
            flags: io.flags.bits(),
        }
    }
}

/// Append handle on a single journal file.
pub struct Journal {
    path: PathBuf,
    file: File,
    sync: bool,
}

impl Journal {
    /// Open (or create) the journal at `path` for appending.
    pub fn open(path: &Path, sync: bool) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;
        Ok(Self { path: path.to_path_buf(), file, sync })
    }

    /// Append one record. The record is written with a single `write_all`
    /// so concurrent appenders never interleave within a record.
    pub fn append(&mut self, record: &JournalRecord) -> StoreResult<()> {
        let payload = bincode::serialize(record)
            .map_err(|e| StoreError::Journal(e.to_string()))?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);

        self.file
            .write_all(&buf)
            .map_err(|e| StoreError::io(&self.path, e))?;
        if self.sync {
            self.file
                .sync_data()
                .map_err(|e| StoreError::io(&self.path, e))?;
        }
        trace!(path = %self.path.display(), offset = record.offset, size = record.size, "journal record appended");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every intact record from the journal at `path`.
///
/// Reading stops at the first torn or corrupt record; everything before it
/// is returned. A missing journal yields no records.
pub fn read_records(path: &Path) -> StoreResult<Vec<JournalRecord>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();

    loop {
        let mut header = [0u8; HEADER_SIZE];
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(StoreError::io(path, e)),
        }
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let mut payload = vec![0u8; len];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                warn!(path = %path.display(), "torn journal record; stopping");
                break;
            }
            Err(e) => return Err(StoreError::io(path, e)),
        }
        if crc32fast::hash(&payload) != crc {
            warn!(path = %path.display(), record = records.len(), "journal CRC mismatch; stopping");
            break;
        }
        match bincode::deserialize(&payload) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "undecodable journal record; stopping");
                break;
            }
        }
    }
    Ok(records)
}
