//! Reactor threads.
//!
//! Each reactor is an OS thread running a single-threaded tokio runtime that
//! multiplexes readiness for its own subset of connections. A connection is
//! pinned to the reactor chosen when it is attached.

use std::collections::HashMap;
use std::net::TcpStream as StdTcpStream;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::TrySendError;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use cairn_protocol::{CmdFlags, CmdHeader, Frame};
use cairn_types::{ObjectId, Status};

use crate::config::NodeConfig;
use crate::connection::{Connection, Inbound, RecvAssembler};
use crate::error::{NetError, NetResult};
use crate::registry::Registry;
use crate::worker::{Envelope, Submitter};

const QUEUE_BACKOFF: Duration = Duration::from_millis(1);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Tunables shared by every reactor.
#[derive(Clone, Copy, Debug)]
pub struct ReactorSettings {
    pub max_frame_size: u64,
    pub sweep_interval: Duration,
    pub max_stall: u32,
    pub transaction_timeout: Duration,
}

impl From<&NodeConfig> for ReactorSettings {
    fn from(config: &NodeConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            sweep_interval: config.sweep_interval(),
            max_stall: config.max_stall,
            transaction_timeout: config.transaction_timeout(),
        }
    }
}

enum Command {
    Attach(Arc<Connection>, StdTcpStream),
    Listen(std::net::TcpListener),
}

struct HandleInner {
    senders: Vec<mpsc::UnboundedSender<Command>>,
    next: AtomicUsize,
    conn_ids: AtomicU64,
    registry: Arc<Registry>,
    settings: ReactorSettings,
}

/// Cloneable entry point for handing sockets to the reactors.
#[derive(Clone)]
pub struct ReactorHandle(Arc<HandleInner>);

impl ReactorHandle {
    fn new(senders: Vec<mpsc::UnboundedSender<Command>>, registry: Arc<Registry>, settings: ReactorSettings) -> Self {
        Self(Arc::new(HandleInner {
            senders,
            next: AtomicUsize::new(0),
            conn_ids: AtomicU64::new(1),
            registry,
            settings,
        }))
    }

    /// Handle with no reactors behind it; every attach fails.
    #[cfg(test)]
    pub(crate) fn detached(registry: Arc<Registry>, settings: ReactorSettings) -> Self {
        Self::new(Vec::new(), registry, settings)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.0.registry
    }

    /// Wrap `stream` in a connection and hand it to the next reactor.
    ///
    /// With `peer` set the connection is registered as that node's link
    /// before any I/O starts; if the peer already has one, that existing
    /// connection is returned and `stream` is dropped.
    pub fn attach(&self, peer: Option<ObjectId>, stream: StdTcpStream) -> NetResult<Arc<Connection>> {
        let inner = &self.0;
        if inner.senders.is_empty() {
            return Err(NetError::Shutdown);
        }
        if let Some(existing) = peer.and_then(|p| inner.registry.get(&p)) {
            return Ok(existing);
        }

        let index = inner.next.fetch_add(1, Ordering::Relaxed) % inner.senders.len();
        let id = inner.conn_ids.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(
            id,
            peer.unwrap_or_else(ObjectId::null),
            &stream,
            index,
            inner.settings.transaction_timeout,
        )?;
        if peer.is_some() && !inner.registry.insert(Arc::clone(&conn)) {
            if let Some(existing) = inner.registry.get(&conn.peer()) {
                return Ok(existing);
            }
        }

        if inner.senders[index].send(Command::Attach(Arc::clone(&conn), stream)).is_err() {
            inner.registry.remove(&conn);
            return Err(NetError::Shutdown);
        }
        Ok(conn)
    }

    fn listen(&self, listener: std::net::TcpListener) -> NetResult<()> {
        let sender = self.0.senders.first().ok_or(NetError::Shutdown)?;
        sender.send(Command::Listen(listener)).map_err(|_| NetError::Shutdown)
    }
}

/// Fixed set of reactor threads.
pub struct ReactorPool {
    handle: ReactorHandle,
    shutdown: watch::Sender<bool>,
    threads: Vec<JoinHandle<()>>,
}

impl ReactorPool {
    pub fn start(
        count: usize,
        settings: ReactorSettings,
        submitter: Submitter,
        registry: Arc<Registry>,
    ) -> NetResult<Self> {
        let (shutdown, _) = watch::channel(false);
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..count).map(|_| mpsc::unbounded_channel()).unzip();
        let handle = ReactorHandle::new(senders, registry, settings);

        let mut threads = Vec::with_capacity(count);
        for (index, commands) in receivers.into_iter().enumerate() {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let reactor = Reactor {
                index,
                settings,
                submitter: submitter.clone(),
                handle: handle.clone(),
                connections: Mutex::new(HashMap::new()),
            };
            let stop = shutdown.subscribe();
            let thread = thread::Builder::new()
                .name(format!("cairn-net-{index}"))
                .spawn(move || runtime.block_on(Arc::new(reactor).run(commands, stop)))?;
            threads.push(thread);
        }
        debug!(reactors = count, "reactor pool started");
        Ok(Self { handle, shutdown, threads })
    }

    pub fn handle(&self) -> &ReactorHandle {
        &self.handle
    }

    /// Accept clients on `listener` from the first reactor.
    pub fn listen(&self, listener: std::net::TcpListener) -> NetResult<()> {
        self.handle.listen(listener)
    }

    /// Stop every reactor, resetting their connections, and wait for the
    /// threads to exit.
    pub fn shutdown(self) {
        self.shutdown.send_replace(true);
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}

struct Reactor {
    index: usize,
    settings: ReactorSettings,
    submitter: Submitter,
    handle: ReactorHandle,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
}

impl Reactor {
    async fn run(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut stop: watch::Receiver<bool>,
    ) {
        tokio::spawn(Arc::clone(&self).sweep_loop());
        let listen_stop = stop.clone();
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Attach(conn, stream)) => self.attach(conn, stream),
                    Some(Command::Listen(listener)) => {
                        tokio::spawn(Arc::clone(&self).accept_loop(listener, listen_stop.clone()));
                    }
                    None => break,
                },
                _ = raised(&mut stop) => break,
            }
        }

        let connections: Vec<_> = self
            .connections
            .lock()
            .expect("reactor lock poisoned")
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in &connections {
            conn.close(Status::ECONNRESET);
            self.handle.registry().remove(conn);
        }
        debug!(reactor = self.index, closed = connections.len(), "reactor stopped");
    }

    fn attach(self: &Arc<Self>, conn: Arc<Connection>, stream: StdTcpStream) {
        let stream = match TcpStream::from_std(stream) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(conn = conn.id(), addr = %conn.addr(), error = %e, "failed to register socket");
                conn.close(Status::from_io(&e));
                self.handle.registry().remove(&conn);
                return;
            }
        };
        self.connections
            .lock()
            .expect("reactor lock poisoned")
            .insert(conn.id(), Arc::clone(&conn));

        let (read, write) = stream.into_split();
        tokio::spawn(send_loop(Arc::clone(&conn), write));
        debug!(reactor = self.index, conn = conn.id(), peer = %conn.peer(), addr = %conn.addr(), "connection attached");
        tokio::spawn(Arc::clone(self).receive_loop(conn, read));
    }

    async fn receive_loop(self: Arc<Self>, conn: Arc<Connection>, half: OwnedReadHalf) {
        let mut assembler = RecvAssembler::new(self.settings.max_frame_size);
        let mut closed = conn.closed_signal();

        let status = 'conn: loop {
            tokio::select! {
                ready = half.readable() => {
                    if let Err(e) = ready {
                        break 'conn Status::from_io(&e);
                    }
                }
                _ = raised(&mut closed) => break 'conn Status::ECONNRESET,
            }
            loop {
                match assembler.step(|buf| half.try_read(buf)) {
                    Ok(Some(Inbound::Frame(frame))) => {
                        if let Err(status) = self.deliver(&conn, frame).await {
                            break 'conn status;
                        }
                    }
                    Ok(Some(Inbound::Oversized(header))) => self.reject_oversized(&conn, header),
                    Ok(None) => break,
                    Err(NetError::Disconnected) => break 'conn Status::ECONNRESET,
                    Err(e) => {
                        warn!(conn = conn.id(), addr = %conn.addr(), error = %e, "receive failed");
                        break 'conn e.status();
                    }
                }
            }
        };

        conn.close(status);
        self.connections
            .lock()
            .expect("reactor lock poisoned")
            .remove(&conn.id());
        self.handle.registry().remove(&conn);
        info!(conn = conn.id(), peer = %conn.peer(), addr = %conn.addr(), %status, "connection closed");
    }

    /// Replies complete their transaction here so that chunks of one stream
    /// are seen in arrival order; requests go to the workers.
    async fn deliver(&self, conn: &Arc<Connection>, frame: Frame) -> Result<(), Status> {
        if frame.header.is_reply() {
            conn.complete_reply(frame);
            return Ok(());
        }
        let mut envelope = Envelope { conn: Arc::clone(conn), frame };
        loop {
            match self.submitter.try_submit(envelope) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    envelope = back;
                    tokio::time::sleep(QUEUE_BACKOFF).await;
                }
                Err(TrySendError::Disconnected(_)) => return Err(Status::ECONNRESET),
            }
        }
    }

    /// The frame's body is gone but the link is healthy. Fail just that
    /// frame: a reply ends its transaction with `EPROTO`, a request is
    /// answered with an `EPROTO` ack if it wanted one.
    fn reject_oversized(&self, conn: &Arc<Connection>, mut header: CmdHeader) {
        warn!(
            conn = conn.id(),
            addr = %conn.addr(),
            trans = header.trans,
            size = header.size,
            max = self.settings.max_frame_size,
            "oversized frame dropped"
        );
        if header.is_reply() {
            header.status = Status::EPROTO;
            header.flags.remove(CmdFlags::MORE);
            conn.complete_reply(Frame::new(header, Bytes::new()));
        } else if header.flags.contains(CmdFlags::NEED_ACK) {
            if let Err(e) = conn.send(&Frame::ack(&header, Status::EPROTO)) {
                debug!(conn = conn.id(), trans = header.trans, error = %e, "ack not sent");
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.settings.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let connections: Vec<_> = self
                .connections
                .lock()
                .expect("reactor lock poisoned")
                .values()
                .cloned()
                .collect();
            let now = Instant::now();
            for conn in connections {
                let Some(stall) = conn.sweep(now) else { continue };
                if stall >= self.settings.max_stall {
                    warn!(conn = conn.id(), addr = %conn.addr(), stall, "connection stalled; resetting");
                    conn.close(Status::ECONNRESET);
                }
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: std::net::TcpListener, mut stop: watch::Receiver<bool>) {
        let listener = match listener
            .set_nonblocking(true)
            .and_then(|()| TcpListener::from_std(listener))
        {
            Ok(listener) => listener,
            Err(e) => {
                warn!(error = %e, "failed to register listener");
                return;
            }
        };
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let attached = stream
                            .into_std()
                            .map_err(NetError::from)
                            .and_then(|stream| self.handle.attach(None, stream));
                        match attached {
                            Ok(conn) => debug!(conn = conn.id(), %addr, reactor = conn.reactor(), "client accepted"),
                            Err(e) => warn!(%addr, error = %e, "failed to attach client"),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = raised(&mut stop) => break,
            }
        }
    }
}

/// Resolves once `signal` reads true or its sender is gone. The borrow taken
/// by `wait_for` is released here, so callers may await inside select arms.
async fn raised(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|raised| *raised).await;
}

async fn send_loop(conn: Arc<Connection>, half: OwnedWriteHalf) {
    let mut closed = conn.closed_signal();
    loop {
        if conn.is_closed() {
            return;
        }
        let drained = conn.send_queue().drain_with(|buf| half.try_write(buf));
        match drained {
            Ok(true) => {
                tokio::select! {
                    _ = conn.send_ready() => {}
                    _ = raised(&mut closed) => return,
                }
            }
            Ok(false) => {
                tokio::select! {
                    ready = half.writable() => {
                        if let Err(e) = ready {
                            conn.close(Status::from_io(&e));
                            return;
                        }
                    }
                    _ = raised(&mut closed) => return,
                }
            }
            Err(e) => {
                warn!(conn = conn.id(), addr = %conn.addr(), error = %e, "send failed");
                conn.close(Status::from_io(&e));
                return;
            }
        }
    }
}
