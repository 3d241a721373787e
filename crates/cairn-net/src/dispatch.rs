//! Command dispatch: runs each attribute of an inbound request against its
//! handler and answers on the request's connection.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use cairn_protocol::{
    AddrAttr, Attribute, CmdFlags, CmdHeader, CommandKind, Frame, FrameBuilder, IoAttr,
    ProtocolError, Wire,
};
use cairn_store::StoreError;
use cairn_types::{ObjectId, Status, ID_SIZE};

use crate::connection::Connection;
use crate::error::{NetError, NetResult};
use crate::node::NodeContext;
use crate::registry::Owner;
use crate::worker::{Envelope, Handler};

/// Reply channel for one inbound request.
///
/// Replies are held back by one frame so that the last one can be sent as
/// the transaction's final frame. Every earlier reply carries `MORE`. When
/// the request asked for an ack, the ack is final and all replies carry
/// `MORE`.
pub struct Responder<'a> {
    conn: &'a Arc<Connection>,
    request: CmdHeader,
    pending: Option<Frame>,
    sent: usize,
}

impl<'a> Responder<'a> {
    pub fn new(conn: &'a Arc<Connection>, request: CmdHeader) -> Self {
        Self { conn, request, pending: None, sent: 0 }
    }

    pub fn conn(&self) -> &Arc<Connection> {
        self.conn
    }

    pub fn request(&self) -> &CmdHeader {
        &self.request
    }

    /// Replies queued so far, including the one still held back.
    pub fn replies(&self) -> usize {
        self.sent + usize::from(self.pending.is_some())
    }

    /// Queue a reply frame for `id`. The previously queued reply goes out
    /// with `MORE` set.
    pub fn reply(&mut self, id: ObjectId, build: impl FnOnce(FrameBuilder) -> FrameBuilder) -> NetResult<()> {
        let frame = build(FrameBuilder::new(CmdHeader::reply_to(&self.request, id))).build();
        if let Some(previous) = self.pending.replace(frame) {
            self.send(previous, true)?;
        }
        Ok(())
    }

    /// Flush the held reply and, if the request asked for one, send the ack
    /// carrying `status` as the final frame.
    pub fn finish(mut self, status: Status) -> NetResult<()> {
        let need_ack = self.request.flags.contains(CmdFlags::NEED_ACK);
        if let Some(last) = self.pending.take() {
            self.send(last, need_ack)?;
        }
        if need_ack {
            self.conn.send(&Frame::ack(&self.request, status))?;
        }
        Ok(())
    }

    fn send(&mut self, mut frame: Frame, more: bool) -> NetResult<()> {
        if more {
            frame.header.flags.insert(CmdFlags::MORE);
        }
        self.conn.send(&frame)?;
        self.sent += 1;
        Ok(())
    }
}

/// Handler for one attribute type.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, ctx: &NodeContext, responder: &mut Responder<'_>, attr: &Attribute<'_>) -> NetResult<()>;
}

/// Routes attributes to their handlers.
pub struct Dispatcher {
    ctx: Arc<NodeContext>,
    handlers: HashMap<CommandKind, Box<dyn CommandHandler>>,
}

impl Dispatcher {
    /// Dispatcher with every built-in handler registered.
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        let mut dispatcher = Self { ctx, handlers: HashMap::new() };
        dispatcher.register(CommandKind::Lookup, LookupHandler);
        dispatcher.register(CommandKind::ReverseLookup, ReverseLookupHandler);
        dispatcher.register(CommandKind::Join, JoinHandler);
        dispatcher.register(CommandKind::Write, WriteHandler);
        dispatcher.register(CommandKind::Read, ReadHandler);
        dispatcher.register(CommandKind::List, ListHandler);
        dispatcher.register(CommandKind::Exec, ExecHandler);
        dispatcher
    }

    /// Install or replace the handler for `kind`.
    pub fn register(&mut self, kind: CommandKind, handler: impl CommandHandler + 'static) {
        self.handlers.insert(kind, Box::new(handler));
    }

    /// Run every attribute of `frame` in order, stopping at the first
    /// failure. Replies from all attributes form one stream; with `NEED_ACK`
    /// it ends in an ack carrying the overall status.
    pub fn dispatch(&self, conn: &Arc<Connection>, frame: &Frame) -> Status {
        let header = frame.header;
        let mut responder = Responder::new(conn, header);
        let mut status = Status::OK;

        for attr in frame.attributes() {
            let result = attr
                .map_err(NetError::from)
                .and_then(|attr| self.run(&mut responder, &attr));
            if let Err(e) = result {
                warn!(conn = conn.id(), id = %header.id, trans = header.trans, error = %e, "command failed");
                status = e.status();
                break;
            }
        }

        if let Err(e) = responder.finish(status) {
            debug!(conn = conn.id(), trans = header.trans, error = %e, "final reply not sent");
        }
        status
    }

    fn run(&self, responder: &mut Responder<'_>, attr: &Attribute<'_>) -> NetResult<()> {
        let kind = attr.header.kind();
        let handler = kind
            .and_then(|k| self.handlers.get(&k))
            .ok_or(ProtocolError::UnknownCommand(attr.header.cmd))?;
        trace!(id = %responder.request().id, cmd = kind.map(CommandKind::name), size = attr.header.size, "dispatching attribute");
        handler.handle(&self.ctx, responder, attr)
    }
}

impl Handler for Dispatcher {
    fn handle(&self, envelope: Envelope) {
        self.dispatch(&envelope.conn, &envelope.frame);
    }
}

struct LookupHandler;

impl CommandHandler for LookupHandler {
    fn handle(&self, ctx: &NodeContext, responder: &mut Responder<'_>, _attr: &Attribute<'_>) -> NetResult<()> {
        let target = responder.request().id;
        let (owner, addr) = match ctx.registry().route(&ctx.id(), &target) {
            Owner::Local => (ctx.id(), ctx.addr()),
            Owner::Peer(conn) => (conn.peer(), conn.addr()),
        };
        debug!(target = %target, owner = %owner, %addr, "lookup");
        responder.reply(owner, |b| b.addr_attr(CommandKind::Lookup, &AddrAttr::tcp(addr)))
    }
}

struct ReverseLookupHandler;

impl CommandHandler for ReverseLookupHandler {
    fn handle(&self, ctx: &NodeContext, responder: &mut Responder<'_>, _attr: &Attribute<'_>) -> NetResult<()> {
        let addr = AddrAttr::tcp(ctx.addr());
        responder.reply(ctx.id(), |b| b.addr_attr(CommandKind::ReverseLookup, &addr))
    }
}

/// A peer announces itself: open a link back to its advertised address.
struct JoinHandler;

impl CommandHandler for JoinHandler {
    fn handle(&self, ctx: &NodeContext, responder: &mut Responder<'_>, attr: &Attribute<'_>) -> NetResult<()> {
        let peer = responder.request().id;
        let addr = attr.addr()?.addr;
        if peer == ctx.id() || ctx.registry().contains(&peer) {
            debug!(peer = %peer, %addr, "join from known node");
            return Ok(());
        }
        let stream = TcpStream::connect_timeout(&addr, ctx.config().connect_timeout())?;
        let conn = ctx.reactor().attach(Some(peer), stream)?;
        debug!(peer = %peer, %addr, conn = conn.id(), "peer joined");
        Ok(())
    }
}

struct WriteHandler;

impl CommandHandler for WriteHandler {
    fn handle(&self, ctx: &NodeContext, responder: &mut Responder<'_>, attr: &Attribute<'_>) -> NetResult<()> {
        let request = responder.request();
        if attr.header.size <= IoAttr::SIZE as u64 {
            return Err(NetError::InvalidRequest(format!(
                "write attribute of {} bytes carries no data",
                attr.header.size
            )));
        }
        let (io, data) = attr.io()?;
        let declared = attr.header.size - IoAttr::SIZE as u64;
        if io.size != declared || io.size > request.size {
            return Err(NetError::InvalidRequest(format!(
                "io size {} does not match attribute payload {declared}",
                io.size
            )));
        }
        let store = ctx.store()?;
        store.put(&request.id, &io, data)?;
        Ok(())
    }
}

/// Streams an object back in chunks of at most `max_read_chunk` bytes.
struct ReadHandler;

impl CommandHandler for ReadHandler {
    fn handle(&self, ctx: &NodeContext, responder: &mut Responder<'_>, attr: &Attribute<'_>) -> NetResult<()> {
        let (io, rest) = attr.io()?;
        if !rest.is_empty() {
            return Err(NetError::InvalidRequest(format!(
                "read attribute carries {} trailing bytes",
                rest.len()
            )));
        }
        let store = ctx.store()?;
        let total = store.size(&io.id)?;
        if io.offset > total || (io.size != 0 && io.size > total - io.offset) {
            return Err(StoreError::OutOfRange { id: io.id, offset: io.offset, size: io.size, len: total }.into());
        }
        let size = if io.size == 0 { total - io.offset } else { io.size };

        let reply_id = responder.request().id;
        let chunk = ctx.config().max_read_chunk;
        let mut sent = 0;
        loop {
            let n = chunk.min(size - sent);
            let offset = io.offset + sent;
            let data = if n == 0 { Vec::new() } else { store.get(&io.id, offset, n)? };
            sent += n;
            let part = IoAttr::new(io.id, offset, n, io.flags);
            responder.reply(reply_id, |b| b.io_attr(CommandKind::Read, &part, &data))?;
            if sent == size {
                break;
            }
        }
        debug!(id = %io.id, offset = io.offset, size, "object read");
        Ok(())
    }
}

/// Streams the stored identifiers, `ID_SIZE` bytes each.
struct ListHandler;

impl CommandHandler for ListHandler {
    fn handle(&self, ctx: &NodeContext, responder: &mut Responder<'_>, _attr: &Attribute<'_>) -> NetResult<()> {
        let ids = ctx.store()?.list()?;
        let per_chunk = ((ctx.config().max_read_chunk as usize) / ID_SIZE).max(1);
        let reply_id = responder.request().id;

        if ids.is_empty() {
            return responder.reply(reply_id, |b| b.attr(CommandKind::List, &[]));
        }
        for chunk in ids.chunks(per_chunk) {
            let data: Vec<u8> = chunk.iter().flat_map(|id| id.as_bytes().iter().copied()).collect();
            responder.reply(reply_id, |b| b.attr(CommandKind::List, &data))?;
        }
        Ok(())
    }
}

struct ExecHandler;

impl CommandHandler for ExecHandler {
    fn handle(&self, ctx: &NodeContext, responder: &mut Responder<'_>, attr: &Attribute<'_>) -> NetResult<()> {
        match ctx.executor() {
            Some(executor) => executor.execute(responder, attr),
            None => Err(NetError::Unsupported("exec")),
        }
    }
}
