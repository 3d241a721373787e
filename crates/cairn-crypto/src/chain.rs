use std::fs::File;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{debug, trace};

use cairn_types::ObjectId;

use crate::error::{TransformError, TransformResult};
use crate::hasher::{Blake3Transform, Sha256Transform, Transform};

/// Identifier produced by the chain together with the position to resume from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Computed {
    pub id: ObjectId,
    /// Position just past the transform that produced `id`. Passing it back
    /// as `start` yields an identifier from the next transform.
    pub next: usize,
}

struct Entry {
    name: String,
    transform: Arc<dyn Transform>,
}

/// Ordered registry of named transforms.
///
/// Transforms are tried in registration order; the first one whose full
/// `init` → `update` → `finalize` pipeline succeeds wins.
pub struct TransformChain {
    entries: RwLock<Vec<Entry>>,
}

impl TransformChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Chain with the built-in transforms: `blake3`, then `sha256`.
    pub fn with_defaults() -> Self {
        let chain = Self::new();
        let builtins: [(&str, Arc<dyn Transform>); 2] = [
            ("blake3", Arc::new(Blake3Transform::DEFAULT)),
            ("sha256", Arc::new(Sha256Transform)),
        ];
        for (name, transform) in builtins {
            chain
                .entries
                .write()
                .expect("transform lock poisoned")
                .push(Entry { name: name.into(), transform });
        }
        chain
    }

    /// Append a named transform. Fails if the name is taken.
    pub fn register(&self, name: &str, transform: Arc<dyn Transform>) -> TransformResult<()> {
        let mut entries = self.entries.write().expect("transform lock poisoned");
        if entries.iter().any(|e| e.name == name) {
            return Err(TransformError::AlreadyExists(name.into()));
        }
        entries.push(Entry { name: name.into(), transform });
        debug!(name, position = entries.len() - 1, "transform registered");
        Ok(())
    }

    /// Remove a named transform.
    pub fn unregister(&self, name: &str) -> TransformResult<()> {
        let mut entries = self.entries.write().expect("transform lock poisoned");
        let pos = entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| TransformError::NotFound(name.into()))?;
        entries.remove(pos);
        debug!(name, "transform removed");
        Ok(())
    }

    /// Registered names in chain order.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .expect("transform lock poisoned")
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("transform lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute an identifier over `data`, trying transforms from `start`.
    pub fn compute(&self, data: &[u8], start: usize) -> TransformResult<Computed> {
        // Run outside the lock: transforms may be slow on large inputs.
        let snapshot: Vec<(String, Arc<dyn Transform>)> = self
            .entries
            .read()
            .expect("transform lock poisoned")
            .iter()
            .skip(start)
            .map(|e| (e.name.clone(), Arc::clone(&e.transform)))
            .collect();

        for (i, (name, transform)) in snapshot.iter().enumerate() {
            match run(transform.as_ref(), data) {
                Ok(id) => {
                    trace!(name = %name, id = %id, "transform computed");
                    return Ok(Computed { id, next: start + i + 1 });
                }
                Err(e) => {
                    debug!(name = %name, error = %e, "transform failed; trying next");
                }
            }
        }
        Err(TransformError::Exhausted { start })
    }

    /// Compute an identifier over a file region, memory-mapping it.
    ///
    /// `size == 0` hashes from `offset` to the end of the file.
    pub fn compute_file(
        &self,
        path: &Path,
        offset: u64,
        size: u64,
        start: usize,
    ) -> TransformResult<Computed> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if offset > len {
            return Err(TransformError::InvalidRegion { offset, size, len });
        }
        let size = if size == 0 { len - offset } else { size };
        if offset.checked_add(size).map_or(true, |end| end > len) {
            return Err(TransformError::InvalidRegion { offset, size, len });
        }
        if size == 0 {
            return self.compute(&[], start);
        }

        // Safety: the mapping is read-only and dropped before returning.
        let map = unsafe {
            memmap2::MmapOptions::new()
                .offset(offset)
                .len(size as usize)
                .map(&file)
        }?;
        self.compute(&map, start)
    }
}

impl Default for TransformChain {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformChain")
            .field("transforms", &self.names())
            .finish()
    }
}

fn run(transform: &dyn Transform, data: &[u8]) -> TransformResult<ObjectId> {
    let mut state = transform.init()?;
    state.update(data)?;
    state.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::{digest, TransformState};
    use std::io::Write;

    /// Transform whose `init` always fails.
    struct Broken;

    impl Transform for Broken {
        fn init(&self) -> TransformResult<Box<dyn TransformState>> {
            Err(TransformError::Failed {
                name: "broken".into(),
                reason: "init refused".into(),
            })
        }
    }

    #[test]
    fn register_rejects_duplicates() {
        let chain = TransformChain::new();
        chain.register("blake3", Arc::new(Blake3Transform::DEFAULT)).unwrap();
        let err = chain
            .register("blake3", Arc::new(Sha256Transform))
            .unwrap_err();
        assert!(matches!(err, TransformError::AlreadyExists(_)));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn unregister_unknown_is_not_found() {
        let chain = TransformChain::with_defaults();
        assert!(matches!(chain.unregister("md5"), Err(TransformError::NotFound(_))));
        chain.unregister("blake3").unwrap();
        assert_eq!(chain.names(), vec!["sha256".to_string()]);
    }

    #[test]
    fn compute_reports_next_position() {
        let chain = TransformChain::with_defaults();
        let first = chain.compute(b"content", 0).unwrap();
        assert_eq!(first.next, 1);
        assert_eq!(first.id, digest(&Blake3Transform::DEFAULT, b"content").unwrap());

        let second = chain.compute(b"content", first.next).unwrap();
        assert_eq!(second.next, 2);
        assert_eq!(second.id, digest(&Sha256Transform, b"content").unwrap());
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn failed_transform_is_skipped() {
        let chain = TransformChain::new();
        chain.register("broken", Arc::new(Broken)).unwrap();
        chain.register("sha256", Arc::new(Sha256Transform)).unwrap();
        let computed = chain.compute(b"x", 0).unwrap();
        assert_eq!(computed.next, 2);
    }

    #[test]
    fn exhaustion_is_reported() {
        let chain = TransformChain::with_defaults();
        let err = chain.compute(b"x", 2).unwrap_err();
        assert!(matches!(err, TransformError::Exhausted { start: 2 }));
        assert_eq!(err.status(), cairn_types::Status::ENOENT);

        let empty = TransformChain::new();
        assert!(matches!(empty.compute(b"x", 0), Err(TransformError::Exhausted { .. })));
    }

    #[test]
    fn file_region_matches_buffer() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.flush().unwrap();

        let chain = TransformChain::with_defaults();
        let whole = chain.compute_file(file.path(), 0, 0, 0).unwrap();
        assert_eq!(whole, chain.compute(b"0123456789", 0).unwrap());

        let region = chain.compute_file(file.path(), 2, 3, 0).unwrap();
        assert_eq!(region.id, chain.compute(b"234", 0).unwrap().id);
    }

    #[test]
    fn file_region_out_of_bounds() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        file.flush().unwrap();

        let chain = TransformChain::with_defaults();
        let err = chain.compute_file(file.path(), 2, 5, 0).unwrap_err();
        assert!(matches!(err, TransformError::InvalidRegion { .. }));
    }

    #[test]
    fn file_region_size_overflow_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        file.flush().unwrap();

        let chain = TransformChain::with_defaults();
        let err = chain.compute_file(file.path(), 1, u64::MAX, 0).unwrap_err();
        assert!(matches!(err, TransformError::InvalidRegion { size: u64::MAX, len: 3, .. }));
    }

    #[test]
    fn empty_file_hashes_as_empty_buffer() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let chain = TransformChain::with_defaults();
        let computed = chain.compute_file(file.path(), 0, 0, 0).unwrap();
        assert_eq!(computed, chain.compute(&[], 0).unwrap());
    }
}
