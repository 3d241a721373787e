use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::BitOr;

use bytes::{Buf, BufMut};

use cairn_types::{ObjectId, Status, ID_SIZE};

use crate::error::{ProtocolError, ProtocolResult};

/// Marks a correlation id as belonging to a reply frame.
pub const TRANS_REPLY: u64 = 1 << 63;

/// Fixed-layout structure with a canonical big-endian wire form.
pub trait Wire: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    fn encode<B: BufMut>(&self, buf: &mut B);

    /// Decode from the first [`Self::SIZE`] bytes of `data`.
    fn decode(data: &[u8]) -> ProtocolResult<Self>;
}

fn ensure_len(what: &'static str, data: &[u8], need: usize) -> ProtocolResult<()> {
    if data.len() < need {
        return Err(ProtocolError::Truncated { what, have: data.len(), need });
    }
    Ok(())
}

fn get_id(buf: &mut &[u8]) -> ObjectId {
    let mut raw = [0u8; ID_SIZE];
    buf.copy_to_slice(&mut raw);
    ObjectId::from_hash(raw)
}

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident: $repr:ty { $($(#[$fmeta:meta])* $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name($repr);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn from_bits(bits: $repr) -> Self {
                Self(bits)
            }

            pub const fn bits(self) -> $repr {
                self.0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let mut names = Vec::new();
                $(if self.0 & $value != 0 { names.push(stringify!($flag)); })*
                write!(f, "{}({:#x}: {})", stringify!($name), self.0, names.join("|"))
            }
        }
    };
}

flag_set! {
    /// Flags in the command header.
    CmdFlags: u32 {
        /// Peer must answer with an empty ack frame once all attributes ran.
        NEED_ACK = 1 << 0;
        /// More reply frames follow for the same transaction.
        MORE = 1 << 1;
        /// The transaction is torn down after this frame.
        DESTROY = 1 << 2;
        /// Route to the unordered (non-blocking) worker pool.
        NOLOCK = 1 << 3;
    }
}

flag_set! {
    /// Flags in the IO attribute.
    IoFlags: u64 {
        /// Write at the end of the object, ignoring the offset.
        APPEND = 1 << 0;
        /// Record the write in the object's journal.
        UPDATE = 1 << 1;
        /// Never journal this write, even with `UPDATE` set.
        SKIP_JOURNAL = 1 << 2;
    }
}

impl IoFlags {
    /// Whether a write with these flags must be journaled.
    pub fn journaled(self) -> bool {
        self.contains(Self::UPDATE) && !self.contains(Self::SKIP_JOURNAL)
    }
}

/// Attribute type tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandKind {
    Lookup = 1,
    ReverseLookup = 2,
    Join = 3,
    Write = 4,
    Read = 5,
    List = 6,
    Exec = 7,
}

impl CommandKind {
    pub fn from_tag(tag: u32) -> Option<Self> {
        let kind = match tag {
            1 => Self::Lookup,
            2 => Self::ReverseLookup,
            3 => Self::Join,
            4 => Self::Write,
            5 => Self::Read,
            6 => Self::List,
            7 => Self::Exec,
            _ => return None,
        };
        Some(kind)
    }

    pub const fn tag(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Lookup => "LOOKUP",
            Self::ReverseLookup => "REVERSE_LOOKUP",
            Self::Join => "JOIN",
            Self::Write => "WRITE",
            Self::Read => "READ",
            Self::List => "LIST",
            Self::Exec => "EXEC",
        }
    }
}

/// Command header: the first bytes of every frame.
///
/// ```text
/// [32 bytes: id] [8: payload size] [4: flags] [4: status] [8: trans]
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmdHeader {
    pub id: ObjectId,
    /// Number of payload bytes (attribute blocks) following the header.
    pub size: u64,
    pub flags: CmdFlags,
    pub status: Status,
    /// Correlation id; replies carry the request's id with [`TRANS_REPLY`] set.
    pub trans: u64,
}

impl CmdHeader {
    pub fn new(id: ObjectId, trans: u64, flags: CmdFlags) -> Self {
        Self { id, size: 0, flags, status: Status::OK, trans }
    }

    /// Header for a reply to `request`.
    pub fn reply_to(request: &CmdHeader, id: ObjectId) -> Self {
        Self {
            id,
            size: 0,
            flags: CmdFlags::empty(),
            status: Status::OK,
            trans: request.trans | TRANS_REPLY,
        }
    }

    pub fn is_reply(&self) -> bool {
        self.trans & TRANS_REPLY != 0
    }

    /// Correlation id with the reply marker masked off.
    pub fn trans_id(&self) -> u64 {
        self.trans & !TRANS_REPLY
    }

    /// Empty reply with no "more" flag: terminates a transaction.
    pub fn is_ack(&self) -> bool {
        self.is_reply() && self.size == 0 && !self.flags.contains(CmdFlags::MORE)
    }
}

impl Wire for CmdHeader {
    const SIZE: usize = ID_SIZE + 8 + 4 + 4 + 8;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self.id.as_bytes());
        buf.put_u64(self.size);
        buf.put_u32(self.flags.bits());
        buf.put_i32(self.status.raw());
        buf.put_u64(self.trans);
    }

    fn decode(data: &[u8]) -> ProtocolResult<Self> {
        ensure_len("command header", data, Self::SIZE)?;
        let mut buf = &data[..Self::SIZE];
        let id = get_id(&mut buf);
        Ok(Self {
            id,
            size: buf.get_u64(),
            flags: CmdFlags::from_bits(buf.get_u32()),
            status: Status::from_raw(buf.get_i32()),
            trans: buf.get_u64(),
        })
    }
}

/// Attribute block header.
///
/// ```text
/// [4 bytes: command type] [4: flags] [8: payload size]
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttrHeader {
    pub cmd: u32,
    pub flags: u32,
    pub size: u64,
}

impl AttrHeader {
    pub fn new(kind: CommandKind, size: u64) -> Self {
        Self { cmd: kind.tag(), flags: 0, size }
    }

    pub fn kind(&self) -> Option<CommandKind> {
        CommandKind::from_tag(self.cmd)
    }
}

impl Wire for AttrHeader {
    const SIZE: usize = 4 + 4 + 8;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(self.cmd);
        buf.put_u32(self.flags);
        buf.put_u64(self.size);
    }

    fn decode(data: &[u8]) -> ProtocolResult<Self> {
        ensure_len("attribute header", data, Self::SIZE)?;
        let mut buf = &data[..Self::SIZE];
        Ok(Self {
            cmd: buf.get_u32(),
            flags: buf.get_u32(),
            size: buf.get_u64(),
        })
    }
}

/// IO attribute: describes a positioned read or write of an object.
///
/// ```text
/// [32 bytes: object id] [8: offset] [8: size] [8: flags]
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoAttr {
    pub id: ObjectId,
    pub offset: u64,
    pub size: u64,
    pub flags: IoFlags,
}

impl IoAttr {
    pub fn new(id: ObjectId, offset: u64, size: u64, flags: IoFlags) -> Self {
        Self { id, offset, size, flags }
    }
}

impl Wire for IoAttr {
    const SIZE: usize = ID_SIZE + 8 + 8 + 8;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self.id.as_bytes());
        buf.put_u64(self.offset);
        buf.put_u64(self.size);
        buf.put_u64(self.flags.bits());
    }

    fn decode(data: &[u8]) -> ProtocolResult<Self> {
        ensure_len("io attribute", data, Self::SIZE)?;
        let mut buf = &data[..Self::SIZE];
        let id = get_id(&mut buf);
        Ok(Self {
            id,
            offset: buf.get_u64(),
            size: buf.get_u64(),
            flags: IoFlags::from_bits(buf.get_u64()),
        })
    }
}

const AF_INET: u16 = 2;
const AF_INET6: u16 = 10;
const SOCK_STREAM: u16 = 1;
const IPPROTO_TCP: u16 = 6;

/// Network address of a node, as carried by lookup and join commands.
///
/// ```text
/// [2 bytes: family] [2: port] [2: socket type] [2: protocol] [16: ip]
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddrAttr {
    pub addr: SocketAddr,
    pub sock_type: u16,
    pub proto: u16,
}

impl AddrAttr {
    /// TCP stream address.
    pub fn tcp(addr: SocketAddr) -> Self {
        Self { addr, sock_type: SOCK_STREAM, proto: IPPROTO_TCP }
    }
}

impl Wire for AddrAttr {
    const SIZE: usize = 2 + 2 + 2 + 2 + 16;

    fn encode<B: BufMut>(&self, buf: &mut B) {
        let mut ip = [0u8; 16];
        let family = match self.addr.ip() {
            IpAddr::V4(v4) => {
                ip[..4].copy_from_slice(&v4.octets());
                AF_INET
            }
            IpAddr::V6(v6) => {
                ip.copy_from_slice(&v6.octets());
                AF_INET6
            }
        };
        buf.put_u16(family);
        buf.put_u16(self.addr.port());
        buf.put_u16(self.sock_type);
        buf.put_u16(self.proto);
        buf.put_slice(&ip);
    }

    fn decode(data: &[u8]) -> ProtocolResult<Self> {
        ensure_len("address attribute", data, Self::SIZE)?;
        let mut buf = &data[..Self::SIZE];
        let family = buf.get_u16();
        let port = buf.get_u16();
        let sock_type = buf.get_u16();
        let proto = buf.get_u16();
        let mut raw = [0u8; 16];
        buf.copy_to_slice(&mut raw);

        let ip = match family {
            AF_INET => {
                if raw[4..].iter().any(|b| *b != 0) {
                    return Err(ProtocolError::InvalidField(
                        "non-zero padding after IPv4 address".into(),
                    ));
                }
                IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
            }
            AF_INET6 => IpAddr::V6(Ipv6Addr::from(raw)),
            other => {
                return Err(ProtocolError::InvalidField(format!(
                    "unknown address family {other}"
                )))
            }
        };
        Ok(Self { addr: SocketAddr::new(ip, port), sock_type, proto })
    }
}
