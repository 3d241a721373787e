//! Sharded on-disk object storage with per-object write journals.

pub mod error;
pub mod fs;
pub mod journal;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use fs::FsObjectStore;
pub use journal::{read_records, Journal, JournalRecord};
pub use traits::ObjectStore;
