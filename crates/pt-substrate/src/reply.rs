//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bounded reply channel returned by a query."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use pt_msg::{BoundedQueue, OverflowPolicy, PushError};
use tracing::warn;

use crate::sample::Sample;

/// Terminal failure reported through a reply channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplyError {
    /// The query deadline passed before any reply arrived.
    #[error("query timed out")]
    Timeout,
    /// The substrate failed the query.
    #[error("query failed: {0}")]
    Failed(String),
}

/// One entry of a reply channel.
pub type ReplyItem = Result<Sample, ReplyError>;

type CloseHook = Box<dyn FnOnce() + Send>;

/// Create a reply channel holding at most `capacity` undelivered entries.
pub fn reply_channel(capacity: NonZeroUsize) -> (ReplySender, ReplyReceiver) {
    let queue = Arc::new(BoundedQueue::bounded(capacity, OverflowPolicy::Reject));
    (
        ReplySender {
            queue: Arc::clone(&queue),
        },
        ReplyReceiver {
            queue,
            on_close: None,
        },
    )
}

/// Substrate half of a reply channel.
#[derive(Clone)]
pub struct ReplySender {
    queue: Arc<BoundedQueue<ReplyItem>>,
}

impl ReplySender {
    /// Push one entry. A full channel drops the entry with a warning; a
    /// closed channel hands it back as [`PushError::Closed`].
    pub fn send(&self, item: ReplyItem) -> Result<(), PushError<ReplyItem>> {
        match self.queue.push(item) {
            Ok(()) => Ok(()),
            Err(PushError::Full(item)) => {
                warn!(
                    capacity = ?self.queue.capacity(),
                    reply = ?item.as_ref().map(|sample| sample.key_expr.as_str()),
                    "reply channel full; dropping reply"
                );
                Err(PushError::Full(item))
            }
            Err(err) => Err(err),
        }
    }

    /// Signal that no further entries will be sent.
    pub fn close(&self) {
        self.queue.exit();
    }

    /// True once either half has closed the channel.
    pub fn is_closed(&self) -> bool {
        self.queue.is_exited()
    }
}

/// Caller half of a reply channel. Dropping it closes the channel.
pub struct ReplyReceiver {
    queue: Arc<BoundedQueue<ReplyItem>>,
    on_close: Option<CloseHook>,
}

impl ReplyReceiver {
    /// Run `hook` once when the receiver is dropped.
    pub fn on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    /// Block until an entry arrives; `None` once the channel is closed and
    /// drained.
    pub fn recv(&self) -> Option<ReplyItem> {
        self.queue.pull()
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<ReplyItem> {
        self.queue.pull_timeout(timeout)
    }

    pub fn try_recv(&self) -> Option<ReplyItem> {
        self.queue.try_pull()
    }

    /// Entries waiting to be received.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Iterator for ReplyReceiver {
    type Item = ReplyItem;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

impl Drop for ReplyReceiver {
    fn drop(&mut self) {
        self.queue.exit();
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

impl fmt::Debug for ReplyReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyReceiver")
            .field("pending", &self.queue.len())
            .field("closed", &self.queue.is_exited())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyexpr::KeyExpr;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn sample(payload: &'static [u8]) -> Sample {
        Sample::new(KeyExpr::new("svc/echo").expect("key"), Bytes::from_static(payload), None)
    }

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).expect("non-zero")
    }

    #[test]
    fn receives_in_order_then_none_after_close() {
        let (tx, rx) = reply_channel(capacity(4));
        tx.send(Ok(sample(b"a"))).expect("send");
        tx.send(Err(ReplyError::Timeout)).expect("send");
        tx.close();
        assert_eq!(rx.recv().and_then(Result::ok).map(|s| s.payload), Some(Bytes::from_static(b"a")));
        assert_eq!(rx.recv(), Some(Err(ReplyError::Timeout)));
        assert_eq!(rx.recv(), None);
    }

    #[test]
    fn overflow_drops_extra_reply() {
        let (tx, rx) = reply_channel(capacity(1));
        tx.send(Ok(sample(b"first"))).expect("send");
        let err = tx.send(Ok(sample(b"second"))).expect_err("channel full");
        assert!(matches!(err, PushError::Full(_)));
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn dropping_receiver_closes_channel_and_runs_hook() {
        let (tx, rx) = reply_channel(capacity(2));
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let rx = rx.on_close(move || flag.store(true, Ordering::SeqCst));
        drop(rx);
        assert!(tx.is_closed());
        assert!(fired.load(Ordering::SeqCst));
        let err = tx.send(Ok(sample(b"late"))).expect_err("closed");
        assert!(err.is_closed());
    }

    #[test]
    fn recv_blocks_until_sender_pushes() {
        let (tx, rx) = reply_channel(capacity(1));
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx.send(Ok(sample(b"later"))).expect("send");
        });
        let reply = rx.recv().expect("reply").expect("ok");
        assert_eq!(reply.payload.as_ref(), b"later");
        sender.join().expect("sender thread");
    }
}
