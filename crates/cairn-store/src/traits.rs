use cairn_protocol::IoAttr;
use cairn_types::ObjectId;

use crate::error::StoreResult;

/// Identifier-keyed blob storage backing the command handlers.
///
/// Implementations must satisfy these invariants:
/// - Writes are positioned: bytes land at `io.offset` and overwrite what was
///   there, unless `io.flags` requests an append.
/// - Re-applying the same write yields the same stored bytes.
/// - A write whose flags ask for journaling appends exactly one record
///   describing it to the object's journal.
/// - All I/O errors are propagated, never silently ignored.
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `id` as described by `io` (offset, flags).
    fn put(&self, id: &ObjectId, io: &IoAttr, data: &[u8]) -> StoreResult<()>;

    /// Read `len` bytes at `offset`. `len == 0` reads to the end.
    fn get(&self, id: &ObjectId, offset: u64, len: u64) -> StoreResult<Vec<u8>>;

    /// Current size of a stored object.
    fn size(&self, id: &ObjectId) -> StoreResult<u64>;

    /// Whether an object exists.
    fn exists(&self, id: &ObjectId) -> StoreResult<bool>;

    /// Every stored identifier, sorted.
    fn list(&self) -> StoreResult<Vec<ObjectId>>;
}
