use sha2::{Digest, Sha256};

use cairn_types::ObjectId;

use crate::error::{TransformError, TransformResult};

/// A pluggable hash function that turns bytes into an [`ObjectId`].
///
/// Each computation runs `init` → `update`* → `finalize`; any stage may fail,
/// in which case the chain moves on to the next registered transform.
pub trait Transform: Send + Sync {
    /// Start a fresh computation.
    fn init(&self) -> TransformResult<Box<dyn TransformState>>;
}

/// In-progress state of a single transform computation.
pub trait TransformState {
    /// Feed more bytes.
    fn update(&mut self, data: &[u8]) -> TransformResult<()>;

    /// Finish the computation and produce the identifier.
    fn finalize(self: Box<Self>) -> TransformResult<ObjectId>;
}

/// Domain-separated BLAKE3 transform.
///
/// The domain tag is prepended to every computation so that two chains
/// configured with different tags never produce colliding identifiers.
pub struct Blake3Transform {
    domain: &'static str,
}

impl Blake3Transform {
    /// Transform used by the default chain.
    pub const DEFAULT: Self = Self {
        domain: "cairn-id-v1",
    };

    /// Create a transform with a custom domain tag.
    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// The domain tag used by this transform.
    pub fn domain(&self) -> &str {
        self.domain
    }
}

struct Blake3State(blake3::Hasher);

impl Transform for Blake3Transform {
    fn init(&self) -> TransformResult<Box<dyn TransformState>> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        Ok(Box::new(Blake3State(hasher)))
    }
}

impl TransformState for Blake3State {
    fn update(&mut self, data: &[u8]) -> TransformResult<()> {
        self.0.update(data);
        Ok(())
    }

    fn finalize(self: Box<Self>) -> TransformResult<ObjectId> {
        Ok(ObjectId::from_hash(*self.0.finalize().as_bytes()))
    }
}

/// Plain SHA-256 transform.
pub struct Sha256Transform;

struct Sha256State(Sha256);

impl Transform for Sha256Transform {
    fn init(&self) -> TransformResult<Box<dyn TransformState>> {
        Ok(Box::new(Sha256State(Sha256::new())))
    }
}

impl TransformState for Sha256State {
    fn update(&mut self, data: &[u8]) -> TransformResult<()> {
        self.0.update(data);
        Ok(())
    }

    fn finalize(self: Box<Self>) -> TransformResult<ObjectId> {
        ObjectId::from_slice(&self.0.finalize()).map_err(|e| TransformError::Failed {
            name: "sha256".into(),
            reason: e.to_string(),
        })
    }
}

/// Run one transform over a buffer.
pub fn digest(transform: &dyn Transform, data: &[u8]) -> TransformResult<ObjectId> {
    let mut state = transform.init()?;
    state.update(data)?;
    state.finalize()
}
