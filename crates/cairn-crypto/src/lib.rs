//! Transform chain for the Cairn storage cluster.
//!
//! Identifiers are computed by an ordered list of pluggable hash functions.
//! The write path asks the chain twice: once at position 0 for the object's
//! name, and once from the position after that for its content, which gives
//! two independent keys for the same bytes.

pub mod chain;
pub mod error;
pub mod hasher;

pub use chain::{Computed, TransformChain};
pub use error::{TransformError, TransformResult};
pub use hasher::{digest, Blake3Transform, Sha256Transform, Transform, TransformState};
