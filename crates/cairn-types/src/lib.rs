//! Foundation types for the Cairn storage cluster.
//!
//! Every other Cairn crate depends on `cairn-types`.
//!
//! # Key Types
//!
//! - [`ObjectId`]: fixed-size identifier for objects and nodes
//! - [`Status`]: errno-style result code carried on the wire

pub mod error;
pub mod object;
pub mod status;

pub use error::TypeError;
pub use object::{ObjectId, ID_SIZE};
pub use status::Status;
