use std::io::{Read, Write};

use bytes::{Bytes, BytesMut};

use cairn_types::{ObjectId, Status};

use crate::error::{ProtocolError, ProtocolResult};
use crate::header::{AddrAttr, AttrHeader, CmdFlags, CmdHeader, CommandKind, IoAttr, Wire};

/// Default cap on a single frame's payload.
pub const MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;

/// One wire-protocol unit: a command header followed by attribute blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub header: CmdHeader,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame, fixing up `header.size` to the payload length.
    pub fn new(mut header: CmdHeader, payload: Bytes) -> Self {
        header.size = payload.len() as u64;
        Self { header, payload }
    }

    /// Empty acknowledgement for `request` carrying `status`.
    pub fn ack(request: &CmdHeader, status: Status) -> Self {
        let mut header = CmdHeader::reply_to(request, request.id);
        header.flags = request.flags;
        header.flags.remove(CmdFlags::MORE);
        header.status = status;
        Self::new(header, Bytes::new())
    }

    /// Total encoded length.
    pub fn wire_len(&self) -> usize {
        CmdHeader::SIZE + self.payload.len()
    }

    /// Encode header and payload into one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a complete frame from the start of `data`.
    /// Returns (frame, bytes_consumed).
    pub fn decode(data: &[u8]) -> ProtocolResult<(Frame, usize)> {
        let header = CmdHeader::decode(data)?;
        let total = (CmdHeader::SIZE as u64).saturating_add(header.size);
        if (data.len() as u64) < total {
            return Err(ProtocolError::Truncated {
                what: "frame payload",
                have: data.len(),
                need: total as usize,
            });
        }
        let payload = Bytes::copy_from_slice(&data[CmdHeader::SIZE..total as usize]);
        Ok((Frame { header, payload }, total as usize))
    }

    /// Walk the attribute blocks in order.
    ///
    /// The iterator yields at most one error and then stops: the first block
    /// whose header is truncated or whose declared size does not fit in the
    /// remaining payload ends the walk.
    pub fn attributes(&self) -> Attributes<'_> {
        Attributes { rest: &self.payload, failed: false }
    }
}

/// One attribute block borrowed from a frame's payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attribute<'a> {
    pub header: AttrHeader,
    pub data: &'a [u8],
}

impl<'a> Attribute<'a> {
    /// Decode the IO attribute that starts this block's data.
    /// Returns the attribute and the bytes that follow it.
    pub fn io(&self) -> ProtocolResult<(IoAttr, &'a [u8])> {
        let io = IoAttr::decode(self.data)?;
        Ok((io, &self.data[IoAttr::SIZE..]))
    }

    pub fn addr(&self) -> ProtocolResult<AddrAttr> {
        AddrAttr::decode(self.data)
    }
}

/// Iterator over a frame's attribute blocks.
pub struct Attributes<'a> {
    rest: &'a [u8],
    failed: bool,
}

impl<'a> Iterator for Attributes<'a> {
    type Item = ProtocolResult<Attribute<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }
        let header = match AttrHeader::decode(self.rest) {
            Ok(header) => header,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };
        let remaining = (self.rest.len() - AttrHeader::SIZE) as u64;
        if header.size > remaining {
            self.failed = true;
            return Some(Err(ProtocolError::AttributeOverflow {
                declared: header.size,
                remaining,
            }));
        }
        let end = AttrHeader::SIZE + header.size as usize;
        let data = &self.rest[AttrHeader::SIZE..end];
        self.rest = &self.rest[end..];
        Some(Ok(Attribute { header, data }))
    }
}

/// Incrementally builds a frame out of attribute blocks.
pub struct FrameBuilder {
    header: CmdHeader,
    payload: BytesMut,
}

impl FrameBuilder {
    pub fn new(header: CmdHeader) -> Self {
        Self { header, payload: BytesMut::new() }
    }

    /// Request frame for `id` with correlation id `trans`.
    pub fn request(id: ObjectId, trans: u64, flags: CmdFlags) -> Self {
        Self::new(CmdHeader::new(id, trans, flags))
    }

    pub fn status(mut self, status: Status) -> Self {
        self.header.status = status;
        self
    }

    pub fn flags(mut self, flags: CmdFlags) -> Self {
        self.header.flags = flags;
        self
    }

    /// Append an attribute block with raw data.
    pub fn attr(mut self, kind: CommandKind, data: &[u8]) -> Self {
        AttrHeader::new(kind, data.len() as u64).encode(&mut self.payload);
        self.payload.extend_from_slice(data);
        self
    }

    /// Append an attribute block holding an IO attribute followed by `data`.
    pub fn io_attr(mut self, kind: CommandKind, io: &IoAttr, data: &[u8]) -> Self {
        AttrHeader::new(kind, (IoAttr::SIZE + data.len()) as u64).encode(&mut self.payload);
        io.encode(&mut self.payload);
        self.payload.extend_from_slice(data);
        self
    }

    /// Append an attribute block holding a node address.
    pub fn addr_attr(mut self, kind: CommandKind, addr: &AddrAttr) -> Self {
        AttrHeader::new(kind, AddrAttr::SIZE as u64).encode(&mut self.payload);
        addr.encode(&mut self.payload);
        self
    }

    pub fn build(self) -> Frame {
        Frame::new(self.header, self.payload.freeze())
    }
}

/// Blocking read of one frame from a stream.
pub fn read_frame<R: Read>(reader: &mut R, max_size: u64) -> ProtocolResult<Frame> {
    let mut raw = [0u8; CmdHeader::SIZE];
    reader.read_exact(&mut raw)?;
    let header = CmdHeader::decode(&raw)?;
    if header.size > max_size {
        return Err(ProtocolError::FrameTooLarge { size: header.size, max: max_size });
    }
    let mut payload = vec![0u8; header.size as usize];
    reader.read_exact(&mut payload)?;
    Ok(Frame { header, payload: Bytes::from(payload) })
}

/// Blocking write of one frame to a stream.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> ProtocolResult<()> {
    writer.write_all(&frame.encode())?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::IoFlags;
    use cairn_types::ID_SIZE;
    use proptest::prelude::*;

    fn id(byte: u8) -> ObjectId {
        ObjectId::from_hash([byte; ID_SIZE])
    }

    fn write_frame_for(data: &[u8]) -> Frame {
        let io = IoAttr::new(id(2), 0, data.len() as u64, IoFlags::UPDATE);
        FrameBuilder::request(id(1), 5, CmdFlags::NEED_ACK)
            .io_attr(CommandKind::Write, &io, data)
            .build()
    }

    #[test]
    fn builder_sets_payload_size() {
        let frame = write_frame_for(b"hello");
        assert_eq!(
            frame.header.size as usize,
            AttrHeader::SIZE + IoAttr::SIZE + 5
        );
        assert_eq!(frame.wire_len(), CmdHeader::SIZE + frame.payload.len());
    }

    #[test]
    fn attributes_are_walked_in_order() {
        let io = IoAttr::new(id(3), 10, 0, IoFlags::empty());
        let frame = FrameBuilder::request(id(1), 9, CmdFlags::empty())
            .attr(CommandKind::Lookup, &[])
            .io_attr(CommandKind::Read, &io, &[])
            .build();

        let attrs: Vec<_> = frame.attributes().collect::<ProtocolResult<_>>().unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].header.kind(), Some(CommandKind::Lookup));
        assert_eq!(attrs[1].header.kind(), Some(CommandKind::Read));
        let (decoded, rest) = attrs[1].io().unwrap();
        assert_eq!(decoded, io);
        assert!(rest.is_empty());
    }

    #[test]
    fn oversized_attribute_stops_the_walk() {
        let mut payload = BytesMut::new();
        AttrHeader::new(CommandKind::Lookup, 0).encode(&mut payload);
        AttrHeader::new(CommandKind::Write, 1000).encode(&mut payload);
        payload.extend_from_slice(&[0u8; 10]);
        let frame = Frame::new(CmdHeader::new(id(1), 1, CmdFlags::empty()), payload.freeze());

        let mut walk = frame.attributes();
        assert!(walk.next().unwrap().is_ok());
        let err = walk.next().unwrap().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::AttributeOverflow { declared: 1000, remaining: 10 }
        ));
        assert!(walk.next().is_none());
    }

    #[test]
    fn truncated_attribute_header_is_an_error() {
        let frame = Frame::new(
            CmdHeader::new(id(1), 1, CmdFlags::empty()),
            Bytes::from_static(&[0, 0, 0, 1]),
        );
        let results: Vec<_> = frame.attributes().collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(ProtocolError::Truncated { .. })));
    }

    #[test]
    fn ack_mirrors_request() {
        let request = CmdHeader::new(id(4), 77, CmdFlags::NEED_ACK | CmdFlags::MORE);
        let ack = Frame::ack(&request, Status::EPROTO);
        assert!(ack.header.is_ack());
        assert_eq!(ack.header.trans_id(), 77);
        assert_eq!(ack.header.status, Status::EPROTO);
        assert_eq!(ack.header.id, id(4));
        assert!(ack.payload.is_empty());
    }

    #[test]
    fn decode_reports_missing_payload() {
        let frame = write_frame_for(b"abc");
        let encoded = frame.encode();
        let err = Frame::decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { what: "frame payload", .. }));
    }

    #[test]
    fn blocking_stream_roundtrip() {
        let frame = write_frame_for(b"over the wire");
        let mut wire = Vec::new();
        write_frame(&mut wire, &frame).unwrap();
        let decoded = read_frame(&mut wire.as_slice(), MAX_FRAME_SIZE).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn blocking_read_enforces_limit() {
        let frame = write_frame_for(&[7u8; 100]);
        let wire = frame.encode();
        let err = read_frame(&mut &wire[..], 10).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { max: 10, .. }));
    }

    fn arb_id() -> impl Strategy<Value = ObjectId> {
        prop::array::uniform32(any::<u8>()).prop_map(ObjectId::from_hash)
    }

    fn arb_header() -> impl Strategy<Value = CmdHeader> {
        (arb_id(), any::<u64>(), any::<u32>(), any::<i32>(), any::<u64>()).prop_map(
            |(id, size, flags, status, trans)| CmdHeader {
                id,
                size,
                flags: CmdFlags::from_bits(flags),
                status: Status::from_raw(status),
                trans,
            },
        )
    }

    fn arb_io() -> impl Strategy<Value = IoAttr> {
        (arb_id(), any::<u64>(), any::<u64>(), any::<u64>())
            .prop_map(|(id, offset, size, flags)| IoAttr::new(id, offset, size, IoFlags::from_bits(flags)))
    }

    proptest! {
        #[test]
        fn header_roundtrip(header in arb_header()) {
            let mut buf = BytesMut::new();
            header.encode(&mut buf);
            prop_assert_eq!(CmdHeader::decode(&buf).unwrap(), header);
        }

        #[test]
        fn encoded_header_bytes_roundtrip(raw in prop::collection::vec(any::<u8>(), CmdHeader::SIZE)) {
            let mut buf = BytesMut::new();
            CmdHeader::decode(&raw).unwrap().encode(&mut buf);
            prop_assert_eq!(&buf[..], &raw[..]);
        }

        #[test]
        fn attr_header_roundtrip(cmd in any::<u32>(), flags in any::<u32>(), size in any::<u64>()) {
            let attr = AttrHeader { cmd, flags, size };
            let mut buf = BytesMut::new();
            attr.encode(&mut buf);
            prop_assert_eq!(AttrHeader::decode(&buf).unwrap(), attr);
        }

        #[test]
        fn io_frame_roundtrip(io in arb_io(), data in prop::collection::vec(any::<u8>(), 0..256), trans in any::<u64>()) {
            let frame = FrameBuilder::request(io.id, trans, CmdFlags::NEED_ACK)
                .io_attr(CommandKind::Write, &io, &data)
                .build();
            let encoded = frame.encode();
            let (decoded, consumed) = Frame::decode(&encoded).unwrap();
            prop_assert_eq!(consumed, encoded.len());
            prop_assert_eq!(&decoded, &frame);
            prop_assert_eq!(decoded.encode(), encoded);

            let attr = decoded.attributes().next().unwrap().unwrap();
            let (decoded_io, rest) = attr.io().unwrap();
            prop_assert_eq!(decoded_io, io);
            prop_assert_eq!(rest, &data[..]);
        }
    }
}
