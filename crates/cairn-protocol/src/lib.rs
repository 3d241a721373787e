//! Wire protocol for the Cairn storage cluster.
//!
//! A frame is a fixed-size command header followed by a sequence of
//! self-describing attribute blocks. All multi-byte fields are big-endian on
//! the wire, so encoding and decoding are exact inverses.

pub mod codec;
pub mod error;
pub mod header;

pub use codec::{read_frame, write_frame, Attribute, Attributes, Frame, FrameBuilder, MAX_FRAME_SIZE};
pub use error::{ProtocolError, ProtocolResult};
pub use header::{
    AddrAttr, AttrHeader, CmdFlags, CmdHeader, CommandKind, IoAttr, IoFlags, Wire, TRANS_REPLY,
};
