//! Data channel protocol: validation, heartbeat, correlation and dispatch.
//!
//! The engine sits on top of an already-open channel provided by a
//! [`ChannelTransport`]. The transport forwards open, text, binary and close
//! events into the engine, and the engine sends through its non-blocking
//! [`ChannelTransport::send_text`].

pub mod engine;
pub mod pending;

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use protocol::error::ChannelError;
use rand::Rng;

pub use engine::{ChannelEngine, EngineConfig, HEARTBEAT_INTERVAL};
pub use pending::{PendingTable, Reply, ReplyFuture};

/// Ids are kept inside the positive signed 32-bit range.
pub const MESSAGE_ID_MODULUS: i64 = 1 << 31;

/// Upper bound (inclusive) of the random jitter added to the clock part.
pub const MESSAGE_ID_JITTER: i64 = 999;

/// How long an issued id is remembered.
///
/// The clock part advances every millisecond and the jitter spans under a
/// second, so an id older than this can no longer be drawn again.
pub const MESSAGE_ID_REUSE_WINDOW: Duration = Duration::from_secs(2);

/// An open, bidirectional text channel.
///
/// `send_text` must not block: implementations enqueue and return.
pub trait ChannelTransport: Send + Sync {
    /// Returns whether the channel is currently open.
    fn is_open(&self) -> bool;

    /// Queues one text frame for transmission.
    fn send_text(&self, text: String) -> Result<(), ChannelError>;
}

/// Draws a request id from the wall clock and a random jitter.
pub fn generate_message_id() -> i64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let jitter = rand::thread_rng().gen_range(0..=MESSAGE_ID_JITTER);
    message_id_from(millis, jitter)
}

/// `((millis mod 2^31) + jitter) mod 2^31`.
pub fn message_id_from(epoch_millis: i64, jitter: i64) -> i64 {
    (epoch_millis.rem_euclid(MESSAGE_ID_MODULUS) + jitter).rem_euclid(MESSAGE_ID_MODULUS)
}

/// Ids issued on one channel within the reuse window.
#[derive(Debug, Default)]
pub struct IssuedIds {
    order: VecDeque<(Instant, i64)>,
    ids: HashSet<i64>,
}

impl IssuedIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `id` as issued at `now`; returns false if it is still in use.
    pub fn insert(&mut self, id: i64, now: Instant) -> bool {
        while let Some(&(issued_at, old)) = self.order.front() {
            if now.duration_since(issued_at) < MESSAGE_ID_REUSE_WINDOW {
                break;
            }
            self.order.pop_front();
            self.ids.remove(&old);
        }

        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back((now, id));
        true
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now_mod() -> i64 {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        millis.rem_euclid(MESSAGE_ID_MODULUS)
    }

    #[test]
    fn test_message_id_formula() {
        assert_eq!(message_id_from(1_000, 5), 1_005);
        assert_eq!(message_id_from(MESSAGE_ID_MODULUS + 7, 0), 7);
        assert_eq!(message_id_from(MESSAGE_ID_MODULUS - 1, 999), 998);
    }

    #[test]
    fn test_message_id_burst_stays_in_window() {
        let before = now_mod();
        let ids: Vec<i64> = (0..10_000).map(|_| generate_message_id()).collect();
        let after = now_mod();

        let elapsed = (after - before).rem_euclid(MESSAGE_ID_MODULUS);
        for id in ids {
            assert!((0..MESSAGE_ID_MODULUS).contains(&id));
            let offset = (id - before).rem_euclid(MESSAGE_ID_MODULUS);
            assert!(
                offset <= elapsed + MESSAGE_ID_JITTER,
                "id {} outside window starting at {}",
                id,
                before
            );
        }
    }

    #[test]
    fn test_issued_ids_reject_recent_duplicates() {
        let start = Instant::now();
        let mut issued = IssuedIds::new();

        assert!(issued.insert(42, start));
        assert!(!issued.insert(42, start + Duration::from_millis(500)));
        assert!(issued.insert(43, start + Duration::from_millis(500)));
        assert_eq!(issued.len(), 2);
    }

    #[test]
    fn test_issued_ids_forget_after_window() {
        let start = Instant::now();
        let mut issued = IssuedIds::new();
        for id in 0..1_000 {
            assert!(issued.insert(id, start));
        }

        let later = start + MESSAGE_ID_REUSE_WINDOW;
        assert!(issued.insert(42, later));
        assert_eq!(issued.len(), 1);
        assert!(!issued.is_empty());
    }
}
