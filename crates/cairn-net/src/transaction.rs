//! Correlation of outgoing requests with their replies.
//!
//! Each connection owns a [`TransactionSet`]. A transaction ends with exactly
//! one terminal event: a reply without `MORE`, a deadline expiry, or a
//! connection reset. Whoever removes it from the set delivers that event,
//! and delivery always happens after the set lock is released.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver};

use cairn_protocol::Frame;
use cairn_types::Status;

use crate::error::{NetError, NetResult};

/// One event delivered to a transaction's callback.
#[derive(Clone, Debug)]
pub struct Reply {
    /// The reply frame; absent for synthetic completions (timeout, reset).
    pub frame: Option<Frame>,
    pub status: Status,
    /// No further events follow.
    pub last: bool,
}

impl Reply {
    pub(crate) fn synthetic(status: Status) -> Self {
        Self { frame: None, status, last: true }
    }
}

/// Hand `error` to a callback whose transaction never started, then return
/// it to the caller.
pub(crate) fn refuse(mut callback: Callback, error: NetError) -> NetError {
    callback(Reply::synthetic(error.status()));
    error
}

/// Completion callback. Called once per streamed chunk; the call with
/// `last == true` happens exactly once.
pub type Callback = Box<dyn FnMut(Reply) + Send>;

struct Slot {
    callback: Callback,
    done: bool,
}

/// Shared handle on a pending transaction's callback.
#[derive(Clone)]
pub(crate) struct Completion(Arc<Mutex<Slot>>);

impl Completion {
    fn new(callback: Callback) -> Self {
        Self(Arc::new(Mutex::new(Slot { callback, done: false })))
    }

    /// Deliver an event. Anything after the terminal event is ignored.
    pub(crate) fn deliver(&self, reply: Reply) {
        let mut slot = self.0.lock().expect("completion lock poisoned");
        if slot.done {
            return;
        }
        slot.done = reply.last;
        (slot.callback)(reply);
    }
}

struct Pending {
    deadline: Instant,
    completion: Completion,
}

/// Pending transactions of one connection, indexed by correlation id and
/// by deadline.
#[derive(Default)]
pub struct TransactionSet {
    pending: HashMap<u64, Pending>,
    deadlines: BTreeSet<(Instant, u64)>,
}

impl TransactionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, trans: u64, deadline: Instant, callback: Callback) {
        self.deadlines.insert((deadline, trans));
        if let Some(old) = self.pending.insert(
            trans,
            Pending { deadline, completion: Completion::new(callback) },
        ) {
            self.deadlines.remove(&(old.deadline, trans));
        }
    }

    /// Look up the transaction a reply belongs to.
    ///
    /// A final reply removes the transaction; an intermediate one keeps it
    /// and pushes its deadline out to `refresh`.
    pub(crate) fn on_reply(&mut self, trans: u64, last: bool, refresh: Instant) -> Option<Completion> {
        if last {
            let pending = self.pending.remove(&trans)?;
            self.deadlines.remove(&(pending.deadline, trans));
            return Some(pending.completion);
        }
        let pending = self.pending.get_mut(&trans)?;
        self.deadlines.remove(&(pending.deadline, trans));
        pending.deadline = refresh;
        self.deadlines.insert((refresh, trans));
        Some(pending.completion.clone())
    }

    /// Remove every transaction whose deadline is at or before `now`,
    /// earliest deadline first.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<(u64, Completion)> {
        let mut expired = Vec::new();
        while let Some(&(deadline, trans)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.pop_first();
            if let Some(pending) = self.pending.remove(&trans) {
                expired.push((trans, pending.completion));
            }
        }
        expired
    }

    /// Remove everything, earliest deadline first.
    pub(crate) fn drain(&mut self) -> Vec<(u64, Completion)> {
        let order: Vec<u64> = self.deadlines.iter().map(|(_, trans)| *trans).collect();
        self.deadlines.clear();
        order
            .into_iter()
            .filter_map(|trans| self.pending.remove(&trans).map(|p| (trans, p.completion)))
            .collect()
    }

    pub fn contains(&self, trans: u64) -> bool {
        self.pending.contains_key(&trans)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Callback that forwards every event into a channel, for callers that
/// want to block on the outcome.
pub fn channel() -> (Callback, ReplyReceiver) {
    let (tx, rx) = unbounded();
    let callback: Callback = Box::new(move |reply| {
        // The receiver may have given up; nothing to do then.
        let _ = tx.send(reply);
    });
    (callback, ReplyReceiver { rx })
}

/// Receiving end of [`channel`].
pub struct ReplyReceiver {
    rx: Receiver<Reply>,
}

impl ReplyReceiver {
    /// Next event. Fails if the transaction was dropped without completing,
    /// which only happens when the node shuts down.
    pub fn recv(&self) -> NetResult<Reply> {
        self.rx.recv().map_err(|_| NetError::Shutdown)
    }

    /// Wait for the terminal event and return every reply frame received.
    /// A non-OK status anywhere in the stream fails the whole call.
    pub fn collect(self) -> NetResult<Vec<Frame>> {
        let mut frames = Vec::new();
        loop {
            let reply = self.recv()?;
            if !reply.status.is_ok() {
                return Err(NetError::from_status(reply.status));
            }
            frames.extend(reply.frame);
            if reply.last {
                return Ok(frames);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting() -> (Callback, Arc<AtomicUsize>, Arc<Mutex<Vec<Status>>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let (c, s) = (calls.clone(), statuses.clone());
        let callback: Callback = Box::new(move |reply: Reply| {
            c.fetch_add(1, Ordering::SeqCst);
            s.lock().unwrap().push(reply.status);
        });
        (callback, calls, statuses)
    }

    #[test]
    fn final_reply_removes() {
        let now = Instant::now();
        let mut set = TransactionSet::new();
        let (cb, calls, _) = counting();
        set.insert(1, now + Duration::from_secs(1), cb);

        let completion = set.on_reply(1, false, now + Duration::from_secs(2)).unwrap();
        completion.deliver(Reply { frame: None, status: Status::OK, last: false });
        assert!(set.contains(1));

        let completion = set.on_reply(1, true, now).unwrap();
        completion.deliver(Reply { frame: None, status: Status::OK, last: true });
        assert!(set.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert!(set.on_reply(1, true, now).is_none());
    }

    #[test]
    fn expiry_in_deadline_order() {
        let now = Instant::now();
        let mut set = TransactionSet::new();
        set.insert(10, now + Duration::from_millis(30), counting().0);
        set.insert(11, now + Duration::from_millis(10), counting().0);
        set.insert(12, now + Duration::from_secs(60), counting().0);

        let expired: Vec<u64> = set
            .take_expired(now + Duration::from_millis(50))
            .into_iter()
            .map(|(t, _)| t)
            .collect();
        assert_eq!(expired, vec![11, 10]);
        assert_eq!(set.len(), 1);
        assert!(set.contains(12));
    }

    #[test]
    fn intermediate_reply_refreshes_deadline() {
        let now = Instant::now();
        let mut set = TransactionSet::new();
        set.insert(5, now + Duration::from_millis(10), counting().0);
        set.on_reply(5, false, now + Duration::from_secs(10)).unwrap();
        assert!(set.take_expired(now + Duration::from_millis(20)).is_empty());
        assert!(set.contains(5));
    }

    #[test]
    fn terminal_event_fires_once() {
        let now = Instant::now();
        let mut set = TransactionSet::new();
        let (cb, calls, statuses) = counting();
        set.insert(1, now, cb);

        // A chunk handle taken before expiry must not fire after it.
        let stale = set.on_reply(1, false, now).unwrap();
        for (_, completion) in set.take_expired(now + Duration::from_secs(1)) {
            completion.deliver(Reply::synthetic(Status::ETIMEDOUT));
        }
        stale.deliver(Reply { frame: None, status: Status::OK, last: false });
        stale.deliver(Reply::synthetic(Status::ECONNRESET));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*statuses.lock().unwrap(), vec![Status::ETIMEDOUT]);
    }

    #[test]
    fn drain_empties_set() {
        let now = Instant::now();
        let mut set = TransactionSet::new();
        set.insert(2, now + Duration::from_secs(2), counting().0);
        set.insert(1, now + Duration::from_secs(1), counting().0);
        let order: Vec<u64> = set.drain().into_iter().map(|(t, _)| t).collect();
        assert_eq!(order, vec![1, 2]);
        assert!(set.is_empty());
    }

    #[test]
    fn channel_collects_until_last() {
        let (cb, rx) = channel();
        let mut cb = cb;
        let frame = cairn_protocol::FrameBuilder::request(cairn_types::ObjectId::null(), 1, Default::default()).build();
        cb(Reply { frame: Some(frame.clone()), status: Status::OK, last: false });
        cb(Reply { frame: Some(frame), status: Status::OK, last: true });
        assert_eq!(rx.collect().unwrap().len(), 2);

        let (mut cb, rx) = channel();
        cb(Reply::synthetic(Status::ETIMEDOUT));
        assert!(matches!(rx.collect(), Err(NetError::Timeout)));
    }

    #[test]
    fn dropped_callback_reports_shutdown() {
        let (cb, rx) = channel();
        drop(cb);
        assert!(matches!(rx.recv(), Err(NetError::Shutdown)));
    }
}
