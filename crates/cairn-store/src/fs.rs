use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use cairn_protocol::{IoAttr, IoFlags};
use cairn_types::ObjectId;

use crate::error::{StoreError, StoreResult};
use crate::journal::{self, Journal, JournalRecord};
use crate::traits::ObjectStore;

const JOURNAL_SUFFIX: &str = "history";

/// Filesystem-backed object store.
///
/// Objects live at `<root>/<hex(id[0])>/<hex(id)>` with their journal at
/// `<hex(id)>.history` in the same shard directory. Files are opened per
/// operation, so concurrent writers to the same object interleave at write
/// granularity.
pub struct FsObjectStore {
    root: PathBuf,
    sync_journal: bool,
}

impl FsObjectStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        debug!(root = %root.display(), "object store opened");
        Ok(Self { root, sync_journal: false })
    }

    /// Flush journal records to disk before a write is acknowledged.
    pub fn with_journal_sync(mut self, sync: bool) -> Self {
        self.sync_journal = sync;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard_dir(&self, id: &ObjectId) -> PathBuf {
        self.root.join(id.shard())
    }

    /// Path of the stored object.
    pub fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.shard_dir(id).join(id.to_hex())
    }

    /// Path of the object's journal.
    pub fn journal_path(&self, id: &ObjectId) -> PathBuf {
        self.shard_dir(id)
            .join(format!("{}.{JOURNAL_SUFFIX}", id.to_hex()))
    }

    /// Records journaled for `id`, oldest first.
    pub fn history(&self, id: &ObjectId) -> StoreResult<Vec<JournalRecord>> {
        journal::read_records(&self.journal_path(id))
    }

    fn ensure_shard(&self, id: &ObjectId) -> StoreResult<()> {
        let dir = self.shard_dir(id);
        match fs::create_dir(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(StoreError::io(dir, e)),
        }
    }

    fn open_existing(&self, id: &ObjectId) -> StoreResult<(File, PathBuf)> {
        let path = self.object_path(id);
        match File::open(&path) {
            Ok(file) => Ok((file, path)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(*id)),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, id: &ObjectId, io: &IoAttr, data: &[u8]) -> StoreResult<()> {
        self.ensure_shard(id)?;
        let path = self.object_path(id);
        let append = io.flags.contains(IoFlags::APPEND);

        let write = || -> std::io::Result<()> {
            let mut options = OpenOptions::new();
            options.create(true);
            if append {
                options.append(true);
            } else {
                options.write(true);
            }
            let mut file = options.open(&path)?;
            if !append {
                file.seek(SeekFrom::Start(io.offset))?;
            }
            file.write_all(data)
        };
        if let Err(e) = write() {
            warn!(id = %id, path = %path.display(), error = %e, "object write failed");
            return Err(StoreError::io(path, e));
        }

        if io.flags.journaled() {
            let mut journal = Journal::open(&self.journal_path(id), self.sync_journal)?;
            if let Err(e) = journal.append(&JournalRecord::from(io)) {
                warn!(id = %id, path = %journal.path().display(), error = %e, "journal append failed");
                return Err(e);
            }
        }

        debug!(id = %id, offset = io.offset, size = data.len(), append, "object written");
        Ok(())
    }

    fn get(&self, id: &ObjectId, offset: u64, len: u64) -> StoreResult<Vec<u8>> {
        let (mut file, path) = self.open_existing(id)?;
        let total = file.metadata().map_err(|e| StoreError::io(&path, e))?.len();
        if offset > total {
            return Err(StoreError::OutOfRange { id: *id, offset, size: len, len: total });
        }
        let size = if len == 0 { total - offset } else { len };
        if offset.checked_add(size).map_or(true, |end| end > total) {
            return Err(StoreError::OutOfRange { id: *id, offset, size, len: total });
        }

        let mut buf = vec![0u8; size as usize];
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut buf))
            .map_err(|e| {
                warn!(id = %id, path = %path.display(), error = %e, "object read failed");
                StoreError::io(&path, e)
            })?;
        Ok(buf)
    }

    fn size(&self, id: &ObjectId) -> StoreResult<u64> {
        let path = self.object_path(id);
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(*id)),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn exists(&self, id: &ObjectId) -> StoreResult<bool> {
        match self.size(id) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list(&self) -> StoreResult<Vec<ObjectId>> {
        let mut ids = Vec::new();
        let shards = fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        for shard in shards {
            let shard = shard.map_err(|e| StoreError::io(&self.root, e))?;
            let shard_path = shard.path();
            if !shard_path.is_dir() {
                continue;
            }
            let entries = fs::read_dir(&shard_path).map_err(|e| StoreError::io(&shard_path, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| StoreError::io(&shard_path, e))?;
                let name = entry.file_name();
                // Journals and stray files fail to parse and are skipped.
                if let Some(id) = name.to_str().and_then(|n| ObjectId::from_hex(n).ok()) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
