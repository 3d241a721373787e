use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{watch, Notify};
use tracing::{debug, trace, warn};

use cairn_protocol::{CmdHeader, CmdFlags, Frame, Wire};
use cairn_types::{ObjectId, Status};

use crate::error::{NetError, NetResult};
use crate::transaction::{refuse, Callback, Reply, TransactionSet};

#[derive(Clone, Copy, Debug)]
enum RecvState {
    Header,
    Body(CmdHeader),
    /// Skipping the body of an oversized frame.
    Discard { header: CmdHeader, remaining: u64 },
}

/// Largest slice of an oversized body read per call.
const DISCARD_CHUNK: u64 = 64 * 1024;

/// What [`RecvAssembler::step`] produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Frame(Frame),
    /// A frame above the size limit whose body was read and thrown away.
    /// The stream stays in sync, so only this frame is lost.
    Oversized(CmdHeader),
}

/// Receive side of a connection: turns a fragmented byte stream into frames.
///
/// State survives across readiness events, so a read that would block
/// simply returns and the next call resumes at the same offset.
pub struct RecvAssembler {
    state: RecvState,
    buf: Vec<u8>,
    offset: usize,
    max_frame_size: u64,
}

impl RecvAssembler {
    pub fn new(max_frame_size: u64) -> Self {
        Self {
            state: RecvState::Header,
            buf: vec![0; CmdHeader::SIZE],
            offset: 0,
            max_frame_size,
        }
    }

    /// Pull bytes through `read` until a frame completes or the source
    /// would block (`Ok(None)`). A zero-byte read means the peer is gone.
    pub fn step<F>(&mut self, mut read: F) -> NetResult<Option<Inbound>>
    where
        F: FnMut(&mut [u8]) -> io::Result<usize>,
    {
        loop {
            if self.offset < self.buf.len() {
                match read(&mut self.buf[self.offset..]) {
                    Ok(0) => return Err(NetError::Disconnected),
                    Ok(n) => self.offset += n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            match self.state {
                RecvState::Header => {
                    let header = CmdHeader::decode(&self.buf)?;
                    self.offset = 0;
                    if header.size > self.max_frame_size {
                        debug!(size = header.size, max = self.max_frame_size, "discarding oversized frame");
                        self.state = RecvState::Discard { header, remaining: header.size };
                        self.buf = vec![0; header.size.min(DISCARD_CHUNK) as usize];
                        continue;
                    }
                    if header.size == 0 {
                        return Ok(Some(Inbound::Frame(Frame { header, payload: Bytes::new() })));
                    }
                    self.state = RecvState::Body(header);
                    self.buf = vec![0; header.size as usize];
                }
                RecvState::Body(header) => {
                    let payload = std::mem::replace(&mut self.buf, vec![0; CmdHeader::SIZE]);
                    self.state = RecvState::Header;
                    self.offset = 0;
                    return Ok(Some(Inbound::Frame(Frame { header, payload: Bytes::from(payload) })));
                }
                RecvState::Discard { header, remaining } => {
                    let remaining = remaining - self.buf.len() as u64;
                    self.offset = 0;
                    if remaining == 0 {
                        self.state = RecvState::Header;
                        self.buf = vec![0; CmdHeader::SIZE];
                        return Ok(Some(Inbound::Oversized(header)));
                    }
                    self.state = RecvState::Discard { header, remaining };
                    self.buf.truncate(remaining.min(DISCARD_CHUNK) as usize);
                }
            }
        }
    }
}

/// Send side of a connection: a FIFO of encoded frames plus the offset into
/// the frame at the front.
#[derive(Default)]
pub struct SendQueue {
    frames: VecDeque<Bytes>,
    offset: usize,
}

impl SendQueue {
    pub fn push(&mut self, frame: Bytes) {
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Drop everything queued. Returns how many frames were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.frames.len();
        self.frames.clear();
        self.offset = 0;
        n
    }

    /// Write queued frames through `write` until the queue is empty
    /// (`Ok(true)`) or the sink would block (`Ok(false)`).
    pub fn drain_with<F>(&mut self, mut write: F) -> io::Result<bool>
    where
        F: FnMut(&[u8]) -> io::Result<usize>,
    {
        while let Some(front) = self.frames.front() {
            let len = front.len();
            match write(&front[self.offset..]) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.offset += n;
                    if self.offset == len {
                        self.frames.pop_front();
                        self.offset = 0;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

/// One peer link or accepted client.
///
/// Shared as `Arc<Connection>` by the owning reactor, queued requests and
/// the node registry. The receive assembler is owned by the reactor task;
/// the send queue and transaction set are locked because workers touch them
/// too.
pub struct Connection {
    id: u64,
    peer: ObjectId,
    addr: SocketAddr,
    reactor: usize,
    timeout: Duration,
    send: Mutex<SendQueue>,
    send_ready: Notify,
    transactions: Mutex<TransactionSet>,
    next_trans: AtomicU64,
    stall: AtomicU32,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Prepare `stream` for non-blocking use and wrap it.
    ///
    /// Fails without side effects if the socket cannot be configured, so a
    /// returned connection is always fully initialized.
    pub fn new(
        id: u64,
        peer: ObjectId,
        stream: &TcpStream,
        reactor: usize,
        timeout: Duration,
    ) -> NetResult<Arc<Self>> {
        let addr = stream.peer_addr()?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let (closed, _) = watch::channel(false);
        Ok(Arc::new(Self {
            id,
            peer,
            addr,
            reactor,
            timeout,
            send: Mutex::new(SendQueue::default()),
            send_ready: Notify::new(),
            transactions: Mutex::new(TransactionSet::new()),
            next_trans: AtomicU64::new(1),
            stall: AtomicU32::new(0),
            closed,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Identifier of the remote node; null for plain clients.
    pub fn peer(&self) -> ObjectId {
        self.peer
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn reactor(&self) -> usize {
        self.reactor
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Queue a frame for the reactor to write.
    pub fn send(&self, frame: &Frame) -> NetResult<()> {
        {
            let mut queue = self.send.lock().expect("send queue lock poisoned");
            if self.is_closed() {
                return Err(NetError::Closed);
            }
            queue.push(frame.encode());
        }
        trace!(conn = self.id, trans = frame.header.trans, size = frame.header.size, "frame queued");
        self.send_ready.notify_one();
        Ok(())
    }

    /// Start a transaction: assign a correlation id, register `callback`
    /// and queue `frame`.
    ///
    /// The callback receives exactly one terminal event either way. On `Err`
    /// that event is a synthetic failure carrying the error's status.
    pub fn start(&self, mut frame: Frame, callback: Callback) -> NetResult<u64> {
        let trans = self.next_trans.fetch_add(1, Ordering::Relaxed) & !cairn_protocol::TRANS_REPLY;
        frame.header.trans = trans;
        {
            let mut set = self.transactions.lock().expect("transaction lock poisoned");
            if self.is_closed() {
                drop(set);
                return Err(refuse(callback, NetError::Closed));
            }
            set.insert(trans, Instant::now() + self.timeout, callback);
        }
        // A close racing with us has already completed the transaction.
        if let Err(e) = self.send(&frame) {
            debug!(conn = self.id, trans, error = %e, "transaction queued on closing connection");
        }
        Ok(trans)
    }

    /// Match a reply frame against the pending transactions.
    pub fn complete_reply(&self, frame: Frame) {
        let trans = frame.header.trans_id();
        let last = !frame.header.flags.contains(CmdFlags::MORE)
            || frame.header.flags.contains(CmdFlags::DESTROY);
        let completion = self
            .transactions
            .lock()
            .expect("transaction lock poisoned")
            .on_reply(trans, last, Instant::now() + self.timeout);

        let Some(completion) = completion else {
            warn!(conn = self.id, trans, "reply for unknown transaction dropped");
            return;
        };
        self.stall.store(0, Ordering::Relaxed);
        let status = frame.header.status;
        completion.deliver(Reply { frame: Some(frame), status, last });
    }

    /// Expire overdue transactions with `ETIMEDOUT`. Returns the stall
    /// count when anything expired.
    pub fn sweep(&self, now: Instant) -> Option<u32> {
        let expired = self
            .transactions
            .lock()
            .expect("transaction lock poisoned")
            .take_expired(now);
        if expired.is_empty() {
            return None;
        }
        for (trans, completion) in expired {
            warn!(conn = self.id, addr = %self.addr, trans, "transaction timed out");
            completion.deliver(Reply::synthetic(Status::ETIMEDOUT));
        }
        Some(self.stall.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Reset the connection: fail every pending transaction with `status`
    /// and discard queued frames. Returns false if it was already closed.
    pub fn close(&self, status: Status) -> bool {
        let first = self.closed.send_if_modified(|closed| !std::mem::replace(closed, true));
        if !first {
            return false;
        }
        let dropped = self.send.lock().expect("send queue lock poisoned").clear();
        let pending = self.transactions.lock().expect("transaction lock poisoned").drain();
        debug!(conn = self.id, addr = %self.addr, %status, dropped, pending = pending.len(), "connection reset");
        for (_, completion) in pending {
            completion.deliver(Reply::synthetic(status));
        }
        self.send_ready.notify_one();
        true
    }

    pub fn pending_transactions(&self) -> usize {
        self.transactions.lock().expect("transaction lock poisoned").len()
    }

    pub fn queued_frames(&self) -> usize {
        self.send.lock().expect("send queue lock poisoned").len()
    }

    pub fn stall_count(&self) -> u32 {
        self.stall.load(Ordering::Relaxed)
    }

    pub(crate) fn send_queue(&self) -> MutexGuard<'_, SendQueue> {
        self.send.lock().expect("send queue lock poisoned")
    }

    /// Resolves once frames may be waiting in the send queue.
    pub(crate) async fn send_ready(&self) {
        self.send_ready.notified().await
    }

    /// Decode and remove everything queued. Lets tests inspect replies
    /// without a reactor.
    #[cfg(test)]
    pub(crate) fn take_queued(&self) -> Vec<Frame> {
        let mut queue = self.send_queue();
        let mut frames = Vec::new();
        while let Some(bytes) = queue.frames.pop_front() {
            frames.push(Frame::decode(&bytes).unwrap().0);
        }
        queue.offset = 0;
        frames
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("addr", &self.addr)
            .field("reactor", &self.reactor)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Loopback socket pair for tests that need a real connection.
#[cfg(test)]
pub(crate) fn test_pair() -> (TcpStream, TcpStream) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}
