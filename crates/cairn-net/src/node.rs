use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use cairn_crypto::TransformChain;
use cairn_protocol::{
    read_frame, write_frame, AddrAttr, CmdFlags, CommandKind, Frame, FrameBuilder, IoAttr,
    IoFlags, ProtocolError,
};
use cairn_store::{FsObjectStore, ObjectStore};
use cairn_types::{ObjectId, ID_SIZE};

use crate::config::NodeConfig;
use crate::connection::Connection;
use crate::dispatch::Dispatcher;
use crate::error::{NetError, NetResult};
use crate::exec::Executor;
use crate::reactor::{ReactorHandle, ReactorPool, ReactorSettings};
use crate::registry::Registry;
use crate::transaction::{self, Callback};
use crate::worker::{self, WorkerPool};

/// State shared by the node, its reactors and its workers.
pub struct NodeContext {
    id: ObjectId,
    addr: SocketAddr,
    config: NodeConfig,
    chain: TransformChain,
    store: Option<Arc<dyn ObjectStore>>,
    reactor: ReactorHandle,
    executor: Option<Arc<dyn Executor>>,
}

impl NodeContext {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Address this node listens on and advertises to peers.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn chain(&self) -> &TransformChain {
        &self.chain
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.reactor.registry()
    }

    pub fn reactor(&self) -> &ReactorHandle {
        &self.reactor
    }

    /// Local object store; fails with `EINVAL` on nodes without a root.
    pub fn store(&self) -> NetResult<&dyn ObjectStore> {
        self.store.as_deref().ok_or(NetError::NoStorage)
    }

    pub fn executor(&self) -> Option<&Arc<dyn Executor>> {
        self.executor.as_ref()
    }

    /// Context with no reactors, for exercising handlers directly.
    #[cfg(test)]
    pub(crate) fn detached(
        config: NodeConfig,
        store: Option<Arc<dyn ObjectStore>>,
        executor: Option<Arc<dyn Executor>>,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let reactor = ReactorHandle::detached(registry, ReactorSettings::from(&config));
        Self {
            id: ObjectId::from_hash([0x42; 32]),
            addr: config.listen_addr,
            chain: TransformChain::with_defaults(),
            config,
            store,
            reactor,
            executor,
        }
    }
}

/// Identifiers a client write was stored under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct WriteIds {
    /// Derived from the object name; used as the routing key.
    pub name: ObjectId,
    /// Derived from the content.
    pub content: ObjectId,
}

/// Configures and starts a [`Node`].
pub struct NodeBuilder {
    config: NodeConfig,
    chain: Option<TransformChain>,
    store: Option<Arc<dyn ObjectStore>>,
    executor: Option<Arc<dyn Executor>>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self { config, chain: None, store: None, executor: None }
    }

    /// Use `chain` instead of the default transforms.
    pub fn chain(mut self, chain: TransformChain) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Use `store` instead of a filesystem store under `config.root`.
    pub fn store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn start(self) -> NetResult<Node> {
        let config = self.config;
        config.validate()?;

        let listener = TcpListener::bind(config.listen_addr)?;
        let addr = listener.local_addr()?;
        let chain = self.chain.unwrap_or_default();
        let id = match &config.node_id {
            Some(hex) => ObjectId::from_hex(hex).map_err(|e| NetError::Config(e.to_string()))?,
            None => chain.compute(addr.to_string().as_bytes(), 0)?.id,
        };
        let store = match (self.store, &config.root) {
            (Some(store), _) => Some(store),
            (None, Some(root)) => {
                let fs = FsObjectStore::open(root)?.with_journal_sync(config.journal_sync);
                Some(Arc::new(fs) as Arc<dyn ObjectStore>)
            }
            (None, None) => None,
        };

        let registry = Arc::new(Registry::new());
        let (submitter, queues) = worker::queues(config.queue_capacity);
        let reactors = ReactorPool::start(
            config.net_threads,
            ReactorSettings::from(&config),
            submitter,
            registry,
        )?;

        let ctx = Arc::new(NodeContext {
            id,
            addr,
            chain,
            store,
            reactor: reactors.handle().clone(),
            executor: self.executor,
            config,
        });
        let workers = match WorkerPool::start(
            queues,
            ctx.config.io_threads,
            ctx.config.nonblocking_io_threads,
            Arc::new(Dispatcher::new(Arc::clone(&ctx))),
        ) {
            Ok(workers) => workers,
            Err(e) => {
                reactors.shutdown();
                return Err(e);
            }
        };
        let mut node = Node { ctx, reactors: Some(reactors), workers: Some(workers) };
        let listening = node.reactors().and_then(|r| r.listen(listener));
        if let Err(e) = listening {
            node.shutdown();
            return Err(e);
        }
        info!(id = %id, %addr, root = ?node.ctx.config.root, "node started");

        for peer in node.ctx.config.peers.clone() {
            if let Err(e) = node.add_peer(peer) {
                warn!(%peer, error = %e, "failed to add peer");
            }
        }
        Ok(node)
    }
}

/// A running storage node: reactors, workers, and the client API.
pub struct Node {
    ctx: Arc<NodeContext>,
    reactors: Option<ReactorPool>,
    workers: Option<WorkerPool>,
}

impl Node {
    pub fn start(config: NodeConfig) -> NetResult<Self> {
        NodeBuilder::new(config).start()
    }

    pub fn id(&self) -> ObjectId {
        self.ctx.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.ctx.addr
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    pub fn chain(&self) -> &TransformChain {
        &self.ctx.chain
    }

    pub fn peers(&self) -> Vec<(ObjectId, SocketAddr)> {
        self.ctx.registry().peers()
    }

    fn reactors(&self) -> NetResult<&ReactorPool> {
        self.reactors.as_ref().ok_or(NetError::Shutdown)
    }

    /// Connect to a node, learn its identifier through a reverse lookup and
    /// register the link.
    pub fn add_peer(&self, addr: SocketAddr) -> NetResult<ObjectId> {
        let timeout = self.ctx.config.connect_timeout();
        let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let request = FrameBuilder::request(ObjectId::null(), 0, CmdFlags::NEED_ACK)
            .addr_attr(CommandKind::ReverseLookup, &AddrAttr::tcp(self.ctx.addr))
            .build();
        write_frame(&mut stream, &request)?;

        // Read the whole reply stream so nothing of it is left for the reactor.
        let mut answer = None;
        loop {
            let reply = read_frame(&mut stream, self.ctx.config.max_frame_size)?;
            if !reply.header.is_reply() || reply.header.trans_id() != 0 {
                return Err(NetError::Handshake(format!("unexpected frame from {addr}")));
            }
            if !reply.header.status.is_ok() {
                return Err(NetError::from_status(reply.header.status));
            }
            if answer.is_none() {
                if let Some(attr) = first_attr(&reply, CommandKind::ReverseLookup)? {
                    answer = Some((reply.header.id, attr.addr()?));
                }
            }
            if !reply.header.flags.contains(CmdFlags::MORE) {
                break;
            }
        }
        let (peer, advertised) =
            answer.ok_or_else(|| NetError::Handshake(format!("{addr} sent no address")))?;

        if peer == self.ctx.id {
            return Err(NetError::Handshake(format!("{addr} is this node")));
        }
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;
        let conn = self.ctx.reactor.attach(Some(peer), stream)?;
        info!(peer = %peer, %addr, advertised = %advertised.addr, conn = conn.id(), "peer added");
        Ok(peer)
    }

    /// Announce this node to every known peer.
    pub fn join(&self) -> NetResult<()> {
        self.ctx.store()?;
        let request = FrameBuilder::request(self.ctx.id, 0, CmdFlags::NEED_ACK)
            .addr_attr(CommandKind::Join, &AddrAttr::tcp(self.ctx.addr))
            .build();
        let peers = self.ctx.registry().connections();
        if peers.is_empty() {
            warn!("join with no known peers");
        }
        let mut waits = Vec::with_capacity(peers.len());
        for conn in &peers {
            let (callback, rx) = transaction::channel();
            conn.start(request.clone(), callback)?;
            waits.push(rx);
        }
        for rx in waits {
            rx.collect()?;
        }
        info!(peers = peers.len(), "joined");
        Ok(())
    }

    /// Ask the closest peer who owns `id`.
    pub fn lookup(&self, id: &ObjectId) -> NetResult<(ObjectId, SocketAddr)> {
        let conn = self.route(id)?;
        let request = FrameBuilder::request(*id, 0, CmdFlags::NEED_ACK)
            .attr(CommandKind::Lookup, &[])
            .build();
        let frames = self.request(&conn, request)?;
        for frame in &frames {
            if let Some(attr) = first_attr(frame, CommandKind::Lookup)? {
                return Ok((frame.header.id, attr.addr()?.addr));
            }
        }
        Err(NetError::Handshake("lookup reply carried no address".into()))
    }

    /// Start a single-attribute IO transaction on `conn`.
    ///
    /// As with [`Connection::start`], `callback` gets a terminal event even
    /// when this fails.
    pub fn start_io(
        &self,
        conn: &Arc<Connection>,
        id: &ObjectId,
        kind: CommandKind,
        io: &IoAttr,
        data: &[u8],
        callback: Callback,
    ) -> NetResult<u64> {
        let frame = FrameBuilder::request(*id, 0, CmdFlags::NEED_ACK)
            .io_attr(kind, io, data)
            .build();
        let max = self.ctx.config.max_frame_size;
        if frame.header.size > max {
            let error = ProtocolError::FrameTooLarge { size: frame.header.size, max }.into();
            return Err(transaction::refuse(callback, error));
        }
        conn.start(frame, callback)
    }

    /// Write `data` under `id` on the peer that owns it.
    pub fn write_object(&self, id: &ObjectId, io: &IoAttr, data: &[u8], callback: Callback) -> NetResult<u64> {
        let conn = match self.route(id) {
            Ok(conn) => conn,
            Err(e) => return Err(transaction::refuse(callback, e)),
        };
        self.start_io(&conn, id, CommandKind::Write, io, data, callback)
    }

    /// Store `data` twice: under the identifier of `name` and under the
    /// identifier of the content, computed with the next transform.
    pub fn write_data(&self, name: &[u8], offset: u64, data: &[u8], flags: IoFlags) -> NetResult<WriteIds> {
        let name_id = self.ctx.chain.compute(name, 0)?;
        let content = self.ctx.chain.compute(data, name_id.next)?;
        self.write_both(name_id.id, content.id, offset, data, flags)
    }

    /// Upload a file region (`size == 0` means to the end of the file) to
    /// the same offset of the remote object.
    pub fn write_file(&self, name: &[u8], path: &Path, offset: u64, size: u64, flags: IoFlags) -> NetResult<WriteIds> {
        let name_id = self.ctx.chain.compute(name, 0)?;
        let content = self.ctx.chain.compute_file(path, offset, size, name_id.next)?;

        let mut file = File::open(path)?;
        let size = if size == 0 { file.metadata()?.len() - offset } else { size };
        let mut data = vec![0u8; size as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut data)?;
        self.write_both(name_id.id, content.id, offset, &data, flags)
    }

    fn write_both(
        &self,
        name: ObjectId,
        content: ObjectId,
        offset: u64,
        data: &[u8],
        flags: IoFlags,
    ) -> NetResult<WriteIds> {
        let io = IoAttr::new(content, offset, data.len() as u64, flags);
        let (name_cb, name_rx) = transaction::channel();
        self.write_object(&name, &io, data, name_cb)?;
        let (content_cb, content_rx) = transaction::channel();
        self.write_object(&content, &io, data, content_cb)?;

        name_rx.collect()?;
        content_rx.collect()?;
        debug!(name = %name, content = %content, offset, size = data.len(), "object written");
        Ok(WriteIds { name, content })
    }

    /// Start a read of `io.id`; replies stream into `callback`.
    pub fn read_object(&self, io: &IoAttr, callback: Callback) -> NetResult<u64> {
        let conn = match self.route(&io.id) {
            Ok(conn) => conn,
            Err(e) => return Err(transaction::refuse(callback, e)),
        };
        self.start_io(&conn, &io.id, CommandKind::Read, io, &[], callback)
    }

    /// Read an object by name. `size == 0` reads to the end.
    pub fn read_data(&self, name: &[u8], offset: u64, size: u64) -> NetResult<Vec<u8>> {
        let io = IoAttr::new(self.ctx.chain.compute(name, 0)?.id, offset, size, IoFlags::empty());
        let (callback, rx) = transaction::channel();
        self.read_object(&io, callback)?;

        let mut data = Vec::new();
        for frame in rx.collect()? {
            for attr in frame.attributes() {
                let attr = attr?;
                if attr.header.kind() == Some(CommandKind::Read) {
                    data.extend_from_slice(attr.io()?.1);
                }
            }
        }
        Ok(data)
    }

    /// Download an object by name into `dest`, writing each chunk at its
    /// object offset. Returns the number of bytes written.
    pub fn read_file(&self, name: &[u8], dest: &Path, offset: u64, size: u64) -> NetResult<u64> {
        let io = IoAttr::new(self.ctx.chain.compute(name, 0)?.id, offset, size, IoFlags::empty());
        let mut file = OpenOptions::new().write(true).create(true).truncate(false).open(dest)?;
        let (callback, rx) = transaction::channel();
        self.read_object(&io, callback)?;

        let mut written = 0;
        loop {
            let reply = rx.recv()?;
            if !reply.status.is_ok() {
                return Err(NetError::from_status(reply.status));
            }
            if let Some(frame) = &reply.frame {
                for attr in frame.attributes() {
                    let attr = attr?;
                    if attr.header.kind() != Some(CommandKind::Read) {
                        continue;
                    }
                    let (part, bytes) = attr.io()?;
                    file.seek(SeekFrom::Start(part.offset))?;
                    file.write_all(bytes)?;
                    written += bytes.len() as u64;
                }
            }
            if reply.last {
                break;
            }
        }
        file.sync_all()?;
        debug!(dest = %dest.display(), written, "object downloaded");
        Ok(written)
    }

    /// Identifiers stored on `peer`.
    pub fn list(&self, peer: &ObjectId) -> NetResult<Vec<ObjectId>> {
        let conn = self
            .ctx
            .registry()
            .get(peer)
            .ok_or_else(|| NetError::NoRoute(peer.to_hex()))?;
        let request = FrameBuilder::request(*peer, 0, CmdFlags::NEED_ACK | CmdFlags::NOLOCK)
            .attr(CommandKind::List, &[])
            .build();

        let mut ids = Vec::new();
        for frame in self.request(&conn, request)? {
            for attr in frame.attributes() {
                let attr = attr?;
                if attr.header.kind() != Some(CommandKind::List) {
                    continue;
                }
                for raw in attr.data.chunks_exact(ID_SIZE) {
                    ids.push(ObjectId::from_slice(raw).map_err(|e| ProtocolError::InvalidField(e.to_string()))?);
                }
            }
        }
        Ok(ids)
    }

    /// Send an `EXEC` attribute to the node owning `id`.
    pub fn exec(&self, id: &ObjectId, payload: &[u8]) -> NetResult<Vec<Frame>> {
        let conn = self.route(id)?;
        let request = FrameBuilder::request(*id, 0, CmdFlags::NEED_ACK)
            .attr(CommandKind::Exec, payload)
            .build();
        self.request(&conn, request)
    }

    fn route(&self, id: &ObjectId) -> NetResult<Arc<Connection>> {
        self.ctx
            .registry()
            .closest(id)
            .ok_or_else(|| NetError::NoRoute(id.to_hex()))
    }

    fn request(&self, conn: &Arc<Connection>, frame: Frame) -> NetResult<Vec<Frame>> {
        let (callback, rx) = transaction::channel();
        conn.start(frame, callback)?;
        rx.collect()
    }

    /// Stop reactors (resetting every connection) and then workers.
    pub fn shutdown(&mut self) {
        let Some(reactors) = self.reactors.take() else { return };
        reactors.shutdown();
        if let Some(workers) = self.workers.take() {
            workers.join();
        }
        info!(id = %self.ctx.id, "node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn first_attr(frame: &Frame, kind: CommandKind) -> NetResult<Option<cairn_protocol::Attribute<'_>>> {
    for attr in frame.attributes() {
        let attr = attr?;
        if attr.header.kind() == Some(kind) {
            return Ok(Some(attr));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Responder;
    use crate::transaction::Reply;
    use cairn_protocol::{Attribute, MAX_FRAME_SIZE};
    use cairn_types::Status;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn config(root: Option<&Path>) -> NodeConfig {
        NodeConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            root: root.map(Path::to_path_buf),
            net_threads: 2,
            io_threads: 2,
            nonblocking_io_threads: 1,
            transaction_timeout_ms: 3000,
            sweep_interval_ms: 20,
            connect_timeout_ms: 1000,
            ..NodeConfig::default()
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    struct Cluster {
        dir: tempfile::TempDir,
        server: Node,
        client: Node,
    }

    fn cluster(tune: impl FnOnce(NodeConfig) -> NodeConfig) -> Cluster {
        let dir = tempfile::tempdir().unwrap();
        let server = Node::start(tune(config(Some(dir.path())))).unwrap();
        let client = Node::start(config(None)).unwrap();
        assert_eq!(client.add_peer(server.addr()).unwrap(), server.id());
        Cluster { dir, server, client }
    }

    fn recorder() -> (Callback, Arc<Mutex<Vec<Reply>>>) {
        let replies = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&replies);
        let callback: Callback = Box::new(move |reply| sink.lock().unwrap().push(reply));
        (callback, replies)
    }

    #[test]
    fn write_then_read_by_name() {
        let c = cluster(|c| c);
        let ids = c.client.write_data(b"greeting", 0, b"hello world", IoFlags::UPDATE).unwrap();
        assert_ne!(ids.name, ids.content);

        let store = c.server.context().store().unwrap();
        assert_eq!(store.get(&ids.name, 0, 0).unwrap(), b"hello world");
        assert_eq!(store.get(&ids.content, 0, 0).unwrap(), b"hello world");
        let journal = c.dir.path().join(ids.name.shard()).join(format!("{}.history", ids.name.to_hex()));
        assert!(journal.is_file());

        assert_eq!(c.client.read_data(b"greeting", 0, 0).unwrap(), b"hello world");
        assert_eq!(c.client.read_data(b"greeting", 6, 5).unwrap(), b"world");

        let mut listed = c.client.list(&c.server.id()).unwrap();
        listed.sort();
        let mut expected = vec![ids.name, ids.content];
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[test]
    fn large_read_arrives_in_chunks() {
        let c = cluster(|c| NodeConfig { max_read_chunk: 4, ..c });
        let ids = c.client.write_data(b"digits", 0, b"0123456789", IoFlags::empty()).unwrap();

        let (callback, replies) = recorder();
        let io = IoAttr::new(ids.name, 0, 0, IoFlags::empty());
        c.client.read_object(&io, callback).unwrap();
        assert!(wait_until(|| replies.lock().unwrap().iter().any(|r| r.last)));

        let replies = replies.lock().unwrap();
        let more: Vec<bool> = replies
            .iter()
            .map(|r| r.frame.as_ref().unwrap().header.flags.contains(CmdFlags::MORE))
            .collect();
        // Three data chunks, then the ack closes the stream.
        assert_eq!(more, vec![true, true, true, false]);
        assert_eq!(replies.iter().filter(|r| r.last).count(), 1);
        let ack = replies.last().unwrap().frame.as_ref().unwrap();
        assert!(ack.header.is_ack());
        assert_eq!(ack.header.status, Status::OK);

        assert_eq!(c.client.read_data(b"digits", 0, 0).unwrap(), b"0123456789");
    }

    #[test]
    fn one_request_reads_several_objects() {
        let c = cluster(|c| c);
        let a = c.client.write_data(b"a", 0, b"AAAA", IoFlags::empty()).unwrap();
        let b = c.client.write_data(b"b", 0, b"BBBB", IoFlags::empty()).unwrap();

        let request = FrameBuilder::request(a.name, 0, CmdFlags::NEED_ACK)
            .io_attr(CommandKind::Read, &IoAttr::new(a.name, 0, 0, IoFlags::empty()), &[])
            .io_attr(CommandKind::Read, &IoAttr::new(b.name, 0, 0, IoFlags::empty()), &[])
            .build();
        let conn = c.client.route(&a.name).unwrap();
        let frames = c.client.request(&conn, request).unwrap();

        assert_eq!(frames.len(), 3);
        let data: Vec<u8> = frames
            .iter()
            .flat_map(|f| f.attributes())
            .flat_map(|attr| attr.unwrap().io().unwrap().1.to_vec())
            .collect();
        assert_eq!(data, b"AAAABBBB");
        assert!(frames[2].header.is_ack());
        assert_eq!(frames[2].header.status, Status::OK);
    }

    #[test]
    fn failed_start_still_completes_callback() {
        let node = Node::start(NodeConfig { max_frame_size: 256, max_read_chunk: 64, ..config(None) }).unwrap();

        // No peers at all: nothing to route to.
        let (callback, replies) = recorder();
        let io = IoAttr::new(ObjectId::from_hash([1; 32]), 0, 4, IoFlags::empty());
        let err = node.write_object(&io.id, &io, b"data", callback).unwrap_err();
        assert_eq!(err.status(), Status::ENOENT);
        assert_eq!(replies.lock().unwrap().len(), 1);
        assert_eq!(replies.lock().unwrap()[0].status, Status::ENOENT);

        // A request that would not fit in one frame.
        let (conn, _remote) = silent_peer(&node);
        let (callback, replies) = recorder();
        let io = IoAttr::new(ObjectId::from_hash([2; 32]), 0, 512, IoFlags::empty());
        let err = node
            .start_io(&conn, &io.id, CommandKind::Write, &io, &[0u8; 512], callback)
            .unwrap_err();
        assert_eq!(err.status(), Status::EPROTO);
        let replies = replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].last);
        assert_eq!(replies[0].status, Status::EPROTO);
        assert_eq!(conn.pending_transactions(), 0);
    }

    #[test]
    fn oversized_request_gets_eproto_and_link_survives() {
        let node = Node::start(NodeConfig { max_frame_size: 256, max_read_chunk: 64, ..config(None) }).unwrap();
        let mut stream = TcpStream::connect(node.addr()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let oversized = FrameBuilder::request(ObjectId::null(), 1, CmdFlags::NEED_ACK)
            .attr(CommandKind::Exec, &[0u8; 1024])
            .build();
        write_frame(&mut stream, &oversized).unwrap();
        let ack = read_frame(&mut stream, MAX_FRAME_SIZE).unwrap();
        assert!(ack.header.is_ack());
        assert_eq!(ack.header.trans_id(), 1);
        assert_eq!(ack.header.status, Status::EPROTO);

        let lookup = FrameBuilder::request(ObjectId::from_hash([5; 32]), 2, CmdFlags::NEED_ACK)
            .attr(CommandKind::Lookup, &[])
            .build();
        write_frame(&mut stream, &lookup).unwrap();
        let reply = read_frame(&mut stream, MAX_FRAME_SIZE).unwrap();
        assert_eq!(reply.header.trans_id(), 2);
        assert_eq!(reply.header.id, node.id());
        let ack = read_frame(&mut stream, MAX_FRAME_SIZE).unwrap();
        assert!(ack.header.is_ack());
        assert_eq!(ack.header.status, Status::OK);
    }

    #[test]
    fn file_upload_and_download() {
        let c = cluster(|c| NodeConfig { max_read_chunk: 3, ..c });
        let scratch = tempfile::tempdir().unwrap();
        let source = scratch.path().join("source.txt");
        std::fs::write(&source, b"abcdefgh").unwrap();

        let ids = c.client.write_file(b"docs/source.txt", &source, 0, 0, IoFlags::empty()).unwrap();
        assert_eq!(ids.content, c.client.chain().compute_file(&source, 0, 0, 1).unwrap().id);

        let dest = scratch.path().join("dest.txt");
        let written = c.client.read_file(b"docs/source.txt", &dest, 0, 0).unwrap();
        assert_eq!(written, 8);
        assert_eq!(std::fs::read(&dest).unwrap(), b"abcdefgh");
    }

    #[test]
    fn lookup_and_routing_errors() {
        let c = cluster(|c| c);
        let (owner, addr) = c.client.lookup(&ObjectId::from_hash([0x11; 32])).unwrap();
        assert_eq!(owner, c.server.id());
        assert_eq!(addr, c.server.addr());
        assert_eq!(c.client.peers(), vec![(c.server.id(), c.server.addr())]);

        let lonely = Node::start(config(None)).unwrap();
        let err = lonely.write_data(b"x", 0, b"y", IoFlags::empty()).unwrap_err();
        assert_eq!(err.status(), Status::ENOENT);
    }

    #[test]
    fn write_to_rootless_node_is_einval() {
        let server = Node::start(config(None)).unwrap();
        let client = Node::start(config(None)).unwrap();
        client.add_peer(server.addr()).unwrap();
        let err = client.write_data(b"x", 0, b"y", IoFlags::empty()).unwrap_err();
        assert_eq!(err.status(), Status::EINVAL);
    }

    #[test]
    fn join_opens_link_back() {
        let server_dir = tempfile::tempdir().unwrap();
        let client_dir = tempfile::tempdir().unwrap();
        let server = Node::start(config(Some(server_dir.path()))).unwrap();
        let client = Node::start(config(Some(client_dir.path()))).unwrap();
        client.add_peer(server.addr()).unwrap();
        assert!(server.peers().is_empty());

        client.join().unwrap();
        assert!(wait_until(|| server.peers().iter().any(|(id, _)| *id == client.id())));

        // The back link is usable: the server can now write to the client.
        server.write_data(b"back", 0, b"link", IoFlags::empty()).unwrap();
    }

    #[test]
    fn join_requires_storage() {
        let client = Node::start(config(None)).unwrap();
        assert!(matches!(client.join(), Err(NetError::NoStorage)));
    }

    /// Attach `node` to a socket that never answers.
    fn silent_peer(node: &Node) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let conn = node
            .context()
            .reactor()
            .attach(Some(ObjectId::from_hash([0x77; 32])), stream)
            .unwrap();
        let (remote, _) = listener.accept().unwrap();
        remote.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        (conn, remote)
    }

    #[test]
    fn timeout_then_late_reply_dropped() {
        let node = Node::start(NodeConfig {
            transaction_timeout_ms: 100,
            max_stall: 100,
            ..config(None)
        })
        .unwrap();
        let (conn, mut remote) = silent_peer(&node);

        let (callback, replies) = recorder();
        let io = IoAttr::new(ObjectId::from_hash([1; 32]), 0, 0, IoFlags::empty());
        node.start_io(&conn, &io.id, CommandKind::Read, &io, &[], callback).unwrap();
        let request = read_frame(&mut remote, MAX_FRAME_SIZE).unwrap();

        assert!(wait_until(|| !replies.lock().unwrap().is_empty()));
        assert_eq!(replies.lock().unwrap()[0].status, Status::ETIMEDOUT);
        assert_eq!(conn.pending_transactions(), 0);

        write_frame(&mut remote, &Frame::ack(&request.header, Status::OK)).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(replies.lock().unwrap().len(), 1);
        assert!(!conn.is_closed());
    }

    #[test]
    fn disconnect_fails_pending_transactions() {
        let node = Node::start(config(None)).unwrap();
        let (conn, remote) = silent_peer(&node);
        let peer = conn.peer();
        assert!(node.peers().iter().any(|(id, _)| *id == peer));

        let (callback, replies) = recorder();
        let frame = FrameBuilder::request(peer, 0, CmdFlags::NEED_ACK)
            .attr(CommandKind::List, &[])
            .build();
        conn.start(frame, callback).unwrap();
        drop(remote);

        assert!(wait_until(|| !replies.lock().unwrap().is_empty()));
        assert_eq!(replies.lock().unwrap()[0].status, Status::ECONNRESET);
        assert!(wait_until(|| node.peers().is_empty()));
        assert!(conn.is_closed());
    }

    #[test]
    fn stalled_connection_is_reset() {
        let node = Node::start(NodeConfig {
            transaction_timeout_ms: 50,
            max_stall: 1,
            ..config(None)
        })
        .unwrap();
        let (conn, _remote) = silent_peer(&node);
        let frame = FrameBuilder::request(conn.peer(), 0, CmdFlags::NEED_ACK)
            .attr(CommandKind::Lookup, &[])
            .build();
        let (callback, replies) = recorder();
        conn.start(frame, callback).unwrap();

        assert!(wait_until(|| conn.is_closed()));
        assert_eq!(replies.lock().unwrap()[0].status, Status::ETIMEDOUT);
        assert!(wait_until(|| node.peers().is_empty()));
    }

    struct Echo(AtomicUsize);

    impl Executor for Echo {
        fn execute(&self, responder: &mut Responder<'_>, attr: &Attribute<'_>) -> NetResult<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            let id = responder.request().id;
            responder.reply(id, |b| b.attr(CommandKind::Exec, attr.data))
        }
    }

    #[test]
    fn exec_round_trip() {
        let echo = Arc::new(Echo(AtomicUsize::new(0)));
        let server = NodeBuilder::new(config(None)).executor(echo.clone()).start().unwrap();
        let client = Node::start(config(None)).unwrap();
        client.add_peer(server.addr()).unwrap();

        let frames = client.exec(&server.id(), b"run job").unwrap();
        let attr = first_attr(&frames[0], CommandKind::Exec).unwrap().unwrap();
        assert_eq!(attr.data, b"run job");
        assert_eq!(echo.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exec_without_executor_is_unsupported() {
        let server = Node::start(config(None)).unwrap();
        let client = Node::start(config(None)).unwrap();
        client.add_peer(server.addr()).unwrap();
        let err = client.exec(&server.id(), b"run job").unwrap_err();
        assert_eq!(err.status(), Status::ENOTSUP);
    }

    #[test]
    fn configured_node_id_is_used() {
        let hex = "ab".repeat(32);
        let node = Node::start(NodeConfig { node_id: Some(hex.clone()), ..config(None) }).unwrap();
        assert_eq!(node.id().to_hex(), hex);
    }
}
