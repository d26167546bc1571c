/*!
 * Command Execution Handler
 *
 * Wires the keyspace (`storage.rs`) and the waiter registry (`waiters.rs`)
 * together behind a single lock, so a list push and the wake-up of any
 * client blocked on it happen as one atomic step. This is the only module
 * that knows both "what a command does to storage" and "who else needs to
 * hear about it."
 */

use crate::command::Command;
use crate::resp::Reply;
use crate::storage::{Keyspace, WrongType, XaddError};
use crate::waiters::{SessionId, WaiterRegistry};
use bytes::Bytes;
use parking_lot::Mutex;
use std::time::Instant;

/// What the session loop should do with a command's result.
pub enum Outcome {
    /// Send `Reply` back on the issuing session's connection now.
    Reply(Reply),
    /// The command parked the session (`BLPOP` with nothing to pop). The
    /// session loop owns the deadline bookkeeping; nothing is sent yet.
    Block { key: Bytes, deadline: Option<Instant> },
}

/// A reply owed to a session other than the one that issued the command
/// that triggered it — produced when a push wakes a blocked `BLPOP`.
pub struct Delivery {
    pub session: SessionId,
    pub reply: Reply,
}

#[derive(Default)]
struct Inner {
    keyspace: Keyspace,
    waiters: WaiterRegistry,
}

/// The shared execution unit. One instance serves every connection; the
/// mutex is the "single shared lock" that makes push-then-wake atomic.
#[derive(Default)]
pub struct Server {
    inner: Mutex<Inner>,
}

impl Server {
    /// Create an empty server: no keys, no waiters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute one already-parsed command on behalf of `session`.
    ///
    /// # Arguments
    /// * `session` - id of the issuing session, needed so a `BLPOP` that
    ///   can't be satisfied immediately knows who to wake later
    /// * `cmd` - the parsed command to run
    ///
    /// # Returns
    /// * the reply (or block instruction) for `session`, plus any
    ///   deliveries the command's side effects owe to other sessions
    pub fn exec(&self, session: SessionId, cmd: Command) -> (Outcome, Vec<Delivery>) {
        self.inner.lock().exec(session, cmd)
    }

    /// Called by the session loop on every tick to age out `BLPOP`
    /// deadlines that have elapsed. Each returned delivery is a nil-array
    /// timeout reply for the named session.
    ///
    /// # Arguments
    /// * `now` - the instant to compare waiter deadlines against
    ///
    /// # Returns
    /// * one `Delivery` per session whose deadline has passed
    pub fn expire_waiters(&self, now: Instant) -> Vec<Delivery> {
        self.inner
            .lock()
            .waiters
            .expire(now)
            .into_iter()
            .map(|session| {
                log::debug!("blpop timed out for session {:?}", session);
                Delivery { session, reply: Reply::NilArray }
            })
            .collect()
    }

    /// Called when a connection closes, so a pending `BLPOP` never gets
    /// delivered to a socket that's gone.
    ///
    /// # Arguments
    /// * `session` - id of the session whose connection closed
    pub fn cancel_session(&self, session: SessionId) {
        self.inner.lock().waiters.cancel_session(session);
    }
}

impl Inner {
    fn exec(&mut self, session: SessionId, cmd: Command) -> (Outcome, Vec<Delivery>) {
        match cmd {
            Command::Ping => (reply(Reply::SimpleString("PONG".to_string())), no_deliveries()),

            Command::Echo(msg) => (reply(Reply::Bulk(msg)), no_deliveries()),

            Command::Set { key, value, expire } => {
                self.keyspace.set_string(key, value, expire.map(|e| e.as_duration()));
                (reply(Reply::ok()), no_deliveries())
            }

            Command::Get(key) => match self.keyspace.get_string(&key) {
                Ok(Some(v)) => (reply(Reply::Bulk(v)), no_deliveries()),
                Ok(None) => (reply(Reply::NilBulk), no_deliveries()),
                Err(WrongType) => (reply(wrongtype()), no_deliveries()),
            },

            Command::Type(key) => (reply(Reply::SimpleString(self.keyspace.type_of(&key).to_string())), no_deliveries()),

            Command::RPush { key, values } => match self.keyspace.rpush(&key, values) {
                Ok(n) => {
                    let deliveries = self.drain_waiters(&key);
                    (reply(Reply::Integer(n)), deliveries)
                }
                Err(WrongType) => (reply(wrongtype()), no_deliveries()),
            },

            Command::LPush { key, values } => match self.keyspace.lpush(&key, values) {
                Ok(n) => {
                    let deliveries = self.drain_waiters(&key);
                    (reply(Reply::Integer(n)), deliveries)
                }
                Err(WrongType) => (reply(wrongtype()), no_deliveries()),
            },

            Command::LRange { key, start, stop } => match self.keyspace.lrange(&key, start, stop) {
                Ok(values) => (reply(Reply::Array(values.into_iter().map(Reply::Bulk).collect())), no_deliveries()),
                Err(WrongType) => (reply(wrongtype()), no_deliveries()),
            },

            Command::LLen(key) => match self.keyspace.llen(&key) {
                Ok(n) => (reply(Reply::Integer(n)), no_deliveries()),
                Err(WrongType) => (reply(wrongtype()), no_deliveries()),
            },

            Command::LPop { key, count } => match count {
                None => match self.keyspace.lpop_one(&key) {
                    Ok(Some(v)) => (reply(Reply::Bulk(v)), no_deliveries()),
                    Ok(None) => (reply(Reply::NilBulk), no_deliveries()),
                    Err(WrongType) => (reply(wrongtype()), no_deliveries()),
                },
                Some(n) => match self.keyspace.lpop_many(&key, n as usize) {
                    Ok(values) => (reply(Reply::Array(values.into_iter().map(Reply::Bulk).collect())), no_deliveries()),
                    Err(WrongType) => (reply(wrongtype()), no_deliveries()),
                },
            },

            Command::BLPop { key, timeout } => match self.keyspace.lpop_one(&key) {
                Ok(Some(v)) => (
                    reply(Reply::Array(vec![Reply::Bulk(key), Reply::Bulk(v)])),
                    no_deliveries(),
                ),
                Ok(None) => {
                    let deadline = if timeout.is_zero() { None } else { Some(Instant::now() + timeout) };
                    log::debug!("session {:?} blocked on {:?}", session, key);
                    self.waiters.register(key.clone(), session, deadline);
                    (Outcome::Block { key, deadline }, no_deliveries())
                }
                Err(WrongType) => (reply(wrongtype()), no_deliveries()),
            },

            Command::XAdd { key, id, fields } => {
                let now_ms = now_unix_ms();
                match self.keyspace.xadd(&key, id, fields, now_ms) {
                    Ok(Ok((ms, seq))) => (reply(Reply::Bulk(format_stream_id(ms, seq))), no_deliveries()),
                    Ok(Err(XaddError::MustBeGreaterThanZero)) => (
                        reply(Reply::err("ERR The ID specified in XADD must be greater than 0-0")),
                        no_deliveries(),
                    ),
                    Ok(Err(XaddError::EqualOrSmaller)) => (
                        reply(Reply::err(
                            "ERR The ID specified in XADD is equal or smaller than the target stream top item",
                        )),
                        no_deliveries(),
                    ),
                    Err(WrongType) => (reply(wrongtype()), no_deliveries()),
                }
            }

            Command::XRange { key, start, end } => {
                match self.keyspace.xrange(&key, start.resolve_as_start(), end.resolve_as_end()) {
                    Ok(entries) => (
                        reply(Reply::Array(entries.into_iter().map(entry_to_reply).collect())),
                        no_deliveries(),
                    ),
                    Err(WrongType) => (reply(wrongtype()), no_deliveries()),
                }
            }

            Command::XRead { streams } => {
                let resolved: Vec<(Bytes, (u64, u64))> =
                    streams.into_iter().map(|(k, after)| (k, after.resolve())).collect();
                match self.keyspace.xread(&resolved) {
                    Ok(None) => (reply(Reply::NilArray), no_deliveries()),
                    Ok(Some(results)) => {
                        let arr = results
                            .into_iter()
                            .map(|(key, entries)| {
                                Reply::Array(vec![
                                    Reply::Bulk(key),
                                    Reply::Array(entries.into_iter().map(entry_to_reply).collect()),
                                ])
                            })
                            .collect();
                        (reply(Reply::Array(arr)), no_deliveries())
                    }
                    Err(WrongType) => (reply(wrongtype()), no_deliveries()),
                }
            }
        }
    }

    /// After a push commits, hand its now-available head elements to
    /// whichever sessions are parked on `key`, oldest registration first.
    /// Stops as soon as either side runs out.
    fn drain_waiters(&mut self, key: &Bytes) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        while self.waiters.has_waiters(key) {
            match self.keyspace.lpop_one(key) {
                Ok(Some(value)) => {
                    let session = self
                        .waiters
                        .next_waiter(key)
                        .expect("has_waiters just confirmed a waiter exists");
                    log::debug!("waking session {:?} on {:?}", session, key);
                    deliveries.push(Delivery {
                        session,
                        reply: Reply::Array(vec![Reply::Bulk(key.clone()), Reply::Bulk(value)]),
                    });
                }
                _ => break,
            }
        }
        deliveries
    }
}

fn reply(r: Reply) -> Outcome {
    Outcome::Reply(r)
}

fn no_deliveries() -> Vec<Delivery> {
    Vec::new()
}

fn wrongtype() -> Reply {
    Reply::err("WRONGTYPE Operation against a key holding the wrong kind of value")
}

fn format_stream_id(ms: u64, seq: u64) -> Bytes {
    Bytes::from(format!("{}-{}", ms, seq))
}

fn entry_to_reply(entry: crate::storage::StreamEntry) -> Reply {
    let id = format_stream_id(entry.ms, entry.seq);
    let mut fv = Vec::with_capacity(entry.fields.len() * 2);
    for (f, v) in entry.fields {
        fv.push(Reply::Bulk(f));
        fv.push(Reply::Bulk(v));
    }
    Reply::Array(vec![Reply::Bulk(id), Reply::Array(fv)])
}

fn now_unix_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Expire, IdSpec};
    use std::time::Duration;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn reply_of(outcome: Outcome) -> Reply {
        match outcome {
            Outcome::Reply(r) => r,
            Outcome::Block { .. } => panic!("expected a reply, got a block"),
        }
    }

    #[test]
    fn set_then_get_roundtrips() {
        let server = Server::new();
        let (o, _) = server.exec(
            SessionId(1),
            Command::Set { key: b("k"), value: b("v"), expire: None },
        );
        assert_eq!(reply_of(o), Reply::ok());
        let (o, _) = server.exec(SessionId(1), Command::Get(b("k")));
        assert_eq!(reply_of(o), Reply::Bulk(b("v")));
    }

    #[test]
    fn get_on_wrong_type_does_not_mutate() {
        let server = Server::new();
        server.exec(SessionId(1), Command::RPush { key: b("k"), values: vec![b("v")] });
        let (o, _) = server.exec(SessionId(1), Command::Get(b("k")));
        assert_eq!(reply_of(o), wrongtype());
        let (o, _) = server.exec(SessionId(1), Command::LLen(b("k")));
        assert_eq!(reply_of(o), Reply::Integer(1));
    }

    #[test]
    fn blpop_blocks_when_empty_and_is_woken_by_push() {
        let server = Server::new();
        let (outcome, deliveries) =
            server.exec(SessionId(1), Command::BLPop { key: b("q"), timeout: Duration::from_secs(5) });
        assert!(deliveries.is_empty());
        match outcome {
            Outcome::Block { key, deadline } => {
                assert_eq!(key, b("q"));
                assert!(deadline.is_some());
            }
            Outcome::Reply(_) => panic!("expected a block"),
        }

        let (o, deliveries) = server.exec(SessionId(2), Command::RPush { key: b("q"), values: vec![b("hello")] });
        assert_eq!(reply_of(o), Reply::Integer(1));
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].session, SessionId(1));
        assert_eq!(
            deliveries[0].reply,
            Reply::Array(vec![Reply::Bulk(b("q")), Reply::Bulk(b("hello"))])
        );

        let (o, _) = server.exec(SessionId(2), Command::LLen(b("q")));
        assert_eq!(reply_of(o), Reply::Integer(0));
    }

    #[test]
    fn push_of_fewer_elements_than_waiters_wakes_only_some() {
        let server = Server::new();
        server.exec(SessionId(1), Command::BLPop { key: b("q"), timeout: Duration::from_secs(1) });
        server.exec(SessionId(2), Command::BLPop { key: b("q"), timeout: Duration::from_secs(1) });
        let (_, deliveries) = server.exec(SessionId(3), Command::RPush { key: b("q"), values: vec![b("only")] });
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].session, SessionId(1));
    }

    #[test]
    fn expire_waiters_times_out_past_deadline() {
        let server = Server::new();
        server.exec(SessionId(1), Command::BLPop { key: b("q"), timeout: Duration::from_millis(1) });
        std::thread::sleep(Duration::from_millis(5));
        let deliveries = server.expire_waiters(Instant::now());
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].session, SessionId(1));
        assert_eq!(deliveries[0].reply, Reply::NilArray);
    }

    #[test]
    fn cancel_session_removes_a_pending_blpop() {
        let server = Server::new();
        server.exec(SessionId(1), Command::BLPop { key: b("q"), timeout: Duration::from_secs(5) });
        server.cancel_session(SessionId(1));
        let (_, deliveries) = server.exec(SessionId(2), Command::RPush { key: b("q"), values: vec![b("x")] });
        assert!(deliveries.is_empty());
    }

    #[test]
    fn xadd_rejects_zero_id_without_mutating() {
        let server = Server::new();
        let (o, _) = server.exec(
            SessionId(1),
            Command::XAdd { key: b("s"), id: IdSpec::Exact(0, 0), fields: vec![(b("f"), b("v"))] },
        );
        assert_eq!(reply_of(o), Reply::err("ERR The ID specified in XADD must be greater than 0-0"));
        let (o, _) = server.exec(SessionId(1), Command::Type(b("s")));
        assert_eq!(reply_of(o), Reply::SimpleString("none".to_string()));
    }

    #[test]
    fn expire_resets_value() {
        let server = Server::new();
        server.exec(
            SessionId(1),
            Command::Set { key: b("k"), value: b("v"), expire: Some(Expire::Millis(1)) },
        );
        std::thread::sleep(Duration::from_millis(10));
        let (o, _) = server.exec(SessionId(1), Command::Get(b("k")));
        assert_eq!(reply_of(o), Reply::NilBulk);
    }
}
