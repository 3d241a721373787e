use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, trace};

use cairn_protocol::{CmdFlags, Frame};

use crate::connection::Connection;
use crate::error::NetResult;

/// A complete inbound request waiting for a worker.
pub struct Envelope {
    pub conn: Arc<Connection>,
    pub frame: Frame,
}

/// Handles one envelope on a worker thread.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, envelope: Envelope);
}

/// Producer side of the two worker queues.
#[derive(Clone)]
pub struct Submitter {
    ordered: Sender<Envelope>,
    unordered: Sender<Envelope>,
}

impl Submitter {
    /// Queue an envelope without blocking. `NOLOCK` frames go to the
    /// unordered pool. A full queue hands the envelope back.
    pub fn try_submit(&self, envelope: Envelope) -> Result<(), TrySendError<Envelope>> {
        let queue = if envelope.frame.header.flags.contains(CmdFlags::NOLOCK) {
            &self.unordered
        } else {
            &self.ordered
        };
        queue.try_send(envelope)
    }
}

/// Consumer side, handed to [`WorkerPool::start`].
pub struct Queues {
    ordered: Receiver<Envelope>,
    unordered: Receiver<Envelope>,
}

/// Two bounded queues, each with its own capacity.
pub fn queues(capacity: usize) -> (Submitter, Queues) {
    let (ordered_tx, ordered_rx) = bounded(capacity);
    let (unordered_tx, unordered_rx) = bounded(capacity);
    (
        Submitter { ordered: ordered_tx, unordered: unordered_tx },
        Queues { ordered: ordered_rx, unordered: unordered_rx },
    )
}

/// Ordered and unordered worker threads.
///
/// Workers exit once every [`Submitter`] is dropped and their queue drains.
pub struct WorkerPool {
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start<H: Handler>(
        queues: Queues,
        ordered: usize,
        unordered: usize,
        handler: Arc<H>,
    ) -> NetResult<Self> {
        let mut threads = Vec::with_capacity(ordered + unordered);
        let pools = [("cairn-io", ordered, queues.ordered), ("cairn-io-nb", unordered, queues.unordered)];
        for (prefix, count, rx) in pools {
            for i in 0..count {
                let rx = rx.clone();
                let handler = Arc::clone(&handler);
                let name = format!("{prefix}-{i}");
                let thread = thread::Builder::new()
                    .name(name.clone())
                    .spawn(move || run(&name, rx, handler.as_ref()))?;
                threads.push(thread);
            }
        }
        debug!(ordered, unordered, "worker pools started");
        Ok(Self { threads })
    }

    /// Wait for every worker to exit.
    pub fn join(self) {
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}

fn run<H: Handler>(name: &str, rx: Receiver<Envelope>, handler: &H) {
    for envelope in rx.iter() {
        if envelope.conn.is_closed() {
            trace!(worker = name, conn = envelope.conn.id(), "request for closed connection dropped");
            continue;
        }
        handler.handle(envelope);
    }
    debug!(worker = name, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_pair;
    use cairn_protocol::FrameBuilder;
    use cairn_types::ObjectId;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recorder(Mutex<Vec<(String, u64)>>);

    impl Handler for Recorder {
        fn handle(&self, envelope: Envelope) {
            let name = thread::current().name().unwrap_or_default().to_string();
            self.0.lock().unwrap().push((name, envelope.frame.header.trans));
        }
    }

    fn envelope(conn: &Arc<Connection>, trans: u64, flags: CmdFlags) -> Envelope {
        Envelope {
            conn: Arc::clone(conn),
            frame: FrameBuilder::request(ObjectId::null(), trans, flags).build(),
        }
    }

    #[test]
    fn nolock_frames_use_unordered_pool() {
        let (client, _server) = test_pair();
        let conn = Connection::new(1, ObjectId::null(), &client, 0, Duration::from_secs(1)).unwrap();
        let (submitter, queues) = queues(8);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let pool = WorkerPool::start(queues, 1, 1, Arc::clone(&recorder)).unwrap();

        submitter.try_submit(envelope(&conn, 1, CmdFlags::empty())).ok().unwrap();
        submitter.try_submit(envelope(&conn, 2, CmdFlags::NOLOCK)).ok().unwrap();
        drop(submitter);
        pool.join();

        let mut seen = recorder.0.lock().unwrap().clone();
        seen.sort_by_key(|(_, trans)| *trans);
        assert_eq!(seen[0], ("cairn-io-0".to_string(), 1));
        assert_eq!(seen[1], ("cairn-io-nb-0".to_string(), 2));
    }

    #[test]
    fn full_queue_returns_envelope() {
        let (client, _server) = test_pair();
        let conn = Connection::new(1, ObjectId::null(), &client, 0, Duration::from_secs(1)).unwrap();
        let (submitter, _queues) = queues(1);
        submitter.try_submit(envelope(&conn, 1, CmdFlags::empty())).ok().unwrap();
        match submitter.try_submit(envelope(&conn, 2, CmdFlags::empty())) {
            Err(TrySendError::Full(env)) => assert_eq!(env.frame.header.trans, 2),
            _ => panic!("expected a full queue"),
        }
        // The other queue is independent.
        assert!(submitter.try_submit(envelope(&conn, 3, CmdFlags::NOLOCK)).is_ok());
    }

    #[test]
    fn closed_connection_requests_are_skipped() {
        let (client, _server) = test_pair();
        let conn = Connection::new(1, ObjectId::null(), &client, 0, Duration::from_secs(1)).unwrap();
        conn.close(cairn_types::Status::ECONNRESET);
        let (submitter, queues) = queues(4);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let pool = WorkerPool::start(queues, 1, 1, Arc::clone(&recorder)).unwrap();
        submitter.try_submit(envelope(&conn, 1, CmdFlags::empty())).ok().unwrap();
        drop(submitter);
        pool.join();
        assert!(recorder.0.lock().unwrap().is_empty());
    }
}
