//! Table of requests waiting for a reply.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use dashmap::DashMap;
use protocol::error::ChannelError;
use protocol::messages::{ChannelMessage, CorrelationKey};
use tokio::sync::oneshot;

/// Outcome delivered to a waiting caller.
pub type Reply = Result<ChannelMessage, ChannelError>;

/// Pending requests keyed by `(type class, topic, id)`.
///
/// At most one entry exists per key. Entries leave the table when a reply
/// arrives, when they are superseded, or when the channel closes.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: DashMap<CorrelationKey, oneshot::Sender<Reply>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `key`.
    ///
    /// A waiter already registered under the same key is failed with
    /// [`ChannelError::Superseded`].
    pub fn register(&self, key: CorrelationKey) -> ReplyFuture {
        let (tx, rx) = oneshot::channel();
        if let Some(previous) = self.entries.insert(key.clone(), tx) {
            tracing::debug!("Superseding pending request {}", key);
            let _ = previous.send(Err(ChannelError::Superseded(key.to_string())));
        }
        ReplyFuture { key, rx }
    }

    /// Resolves the waiter matching `message`, if any.
    ///
    /// Returns whether a waiter was found.
    pub fn resolve(&self, message: &ChannelMessage) -> bool {
        let key = message.correlation_key();
        if key.id.is_none() {
            return false;
        }
        match self.entries.remove(&key) {
            Some((_, tx)) => {
                let _ = tx.send(Ok(message.clone()));
                true
            }
            None => false,
        }
    }

    /// Drops the waiter for `key` without resolving it.
    pub fn remove(&self, key: &CorrelationKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Fails every waiter with `error` and empties the table.
    ///
    /// Returns the number of waiters failed.
    pub fn fail_all(&self, error: ChannelError) -> usize {
        let keys: Vec<CorrelationKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for key in keys {
            if let Some((_, tx)) = self.entries.remove(&key) {
                let _ = tx.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves with the reply to one request.
///
/// Resolves to [`ChannelError::Closed`] if the table is dropped first.
#[derive(Debug)]
pub struct ReplyFuture {
    key: CorrelationKey,
    rx: oneshot::Receiver<Reply>,
}

impl ReplyFuture {
    /// Key the reply is expected under.
    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }
}

impl Future for ReplyFuture {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(reply)) => Poll::Ready(reply),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ChannelError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
