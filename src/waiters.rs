/*!
 * Waiter Registry
 *
 * Tracks clients parked on `BLPOP` for a list key that had nothing to pop.
 * A waiter is live from registration until it is either woken by a
 * matching push or its deadline passes; either way it leaves the registry
 * exactly once. This module only tracks *who* is waiting — delivering the
 * popped value to them is the handler layer's job (`shard.rs`), since that
 * requires touching the keyspace too.
 */

use ahash::AHashMap;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Instant;

/// Identifies the session that issued a `BLPOP`, so a later wake or
/// timeout knows which connection to reply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

struct Waiter {
    session: SessionId,
    deadline: Option<Instant>,
}

#[derive(Default)]
pub struct WaiterRegistry {
    queues: AHashMap<Bytes, VecDeque<Waiter>>,
}

impl WaiterRegistry {
    /// Park `session` on `key`. `deadline` of `None` means "wait forever"
    /// (`BLPOP key 0`).
    ///
    /// # Arguments
    /// * `key` - list key the session is blocked on
    /// * `session` - id of the blocked session
    /// * `deadline` - `Some(instant)` the waiter expires at; `None` for no
    ///   deadline
    pub fn register(&mut self, key: Bytes, session: SessionId, deadline: Option<Instant>) {
        self.queues.entry(key).or_default().push_back(Waiter { session, deadline });
    }

    /// # Returns
    /// * `true` if at least one live waiter is parked on `key`
    pub fn has_waiters(&self, key: &[u8]) -> bool {
        self.queues.get(key).is_some_and(|q| !q.is_empty())
    }

    /// Pop the earliest-registered waiter for `key`, if any. Callers drain
    /// this once per element a committing push makes available.
    ///
    /// # Returns
    /// * `Some(session)` — the oldest waiter on `key`, now removed
    /// * `None` if no waiter is parked on `key`
    pub fn next_waiter(&mut self, key: &[u8]) -> Option<SessionId> {
        let queue = self.queues.get_mut(key)?;
        let waiter = queue.pop_front()?;
        if queue.is_empty() {
            self.queues.remove(key);
        }
        Some(waiter.session)
    }

    /// Remove every waiter registered by `session` — called when its
    /// connection closes so a dead socket never gets "delivered" to.
    ///
    /// # Arguments
    /// * `session` - id of the session whose connection closed
    pub fn cancel_session(&mut self, session: SessionId) {
        self.queues.retain(|_, q| {
            q.retain(|w| w.session != session);
            !q.is_empty()
        });
    }

    /// Remove and return the sessions whose deadline is at or before `now`.
    ///
    /// # Arguments
    /// * `now` - the instant to compare deadlines against
    ///
    /// # Returns
    /// * the sessions that timed out, each removed from its queue
    pub fn expire(&mut self, now: Instant) -> Vec<SessionId> {
        let mut expired = Vec::new();
        self.queues.retain(|_, q| {
            q.retain(|w| {
                let timed_out = matches!(w.deadline, Some(d) if now >= d);
                if timed_out {
                    expired.push(w.session);
                }
                !timed_out
            });
            !q.is_empty()
        });
        expired
    }
}
