/*!
 * Network Layer and Event Loop
 *
 * A single-threaded mio reactor: one OS thread owns one `Poll` and one
 * listening socket, and runs every session's I/O and command dispatch
 * inline. There is no worker-thread offload — command execution only
 * takes a lock around a hash map and a couple of `VecDeque`s, so it's
 * cheap enough to run straight on the event-loop thread. Scaling across
 * cores means running several of these threads against the same
 * `Arc<Server>`, each with its own listener bound with `SO_REUSEPORT`.
 */

use crate::command;
use crate::resp::{decode_frame, encode_reply, Reply};
use crate::shard::{Delivery, Outcome, Server};
use crate::waiters::SessionId;
use anyhow::Result;
use ahash::AHashMap;
use bytes::BytesMut;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Socket, Type};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const READ_BUF: usize = 4096;
const LISTENER: Token = Token(0);
/// How often the reactor wakes on its own to scan for timed-out `BLPOP`s,
/// even with no socket activity.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Bind a TCP listener with `SO_REUSEPORT` set, so multiple reactor
/// threads can each own an independent accept queue on the same address
/// instead of funneling every connection through one listener.
///
/// # Arguments
/// * `addr` - socket address to bind to
///
/// # Returns
/// * a non-blocking `TcpListener` registered for `SO_REUSEPORT`/`SO_REUSEADDR`
pub fn bind_reuseport(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into()))
}

struct Session {
    sock: TcpStream,
    rbuf: BytesMut,
    wbuf: BytesMut,
    /// Set while a `BLPOP` is pending on this connection. The session loop
    /// stops feeding it new commands until a delivery or a timeout clears
    /// this back to `None` — the deadline itself is tracked by the waiter
    /// registry, not here.
    blocked: Option<bytes::Bytes>,
}

impl Session {
    fn flush(&mut self) -> bool {
        while !self.wbuf.is_empty() {
            match self.sock.write(&self.wbuf) {
                Ok(0) => return false,
                Ok(n) => {
                    let _ = self.wbuf.split_to(n);
                }
                Err(ref e) if would_block(e) => return true,
                Err(_) => return false,
            }
        }
        true
    }
}

/// Run the reactor loop on the calling thread. Never returns except on a
/// fatal I/O setup error.
///
/// # Arguments
/// * `addr` - address to bind and accept connections on
/// * `server` - the shared keyspace/waiter registry every session executes
///   commands against
///
/// # Returns
/// * `Err` only if binding the listener or registering it with `Poll` fails;
///   otherwise this function runs forever
pub fn run(addr: SocketAddr, server: Arc<Server>) -> Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(1024);
    let mut listener = bind_reuseport(addr)?;
    poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;

    let mut sessions: AHashMap<usize, Session> = AHashMap::new();
    let mut next_token: usize = 1;

    loop {
        poll.poll(&mut events, Some(POLL_TIMEOUT))?;

        for ev in events.iter() {
            match ev.token() {
                LISTENER => loop {
                    match listener.accept() {
                        Ok((mut sock, _)) => {
                            sock.set_nodelay(true).ok();
                            let token = next_token;
                            next_token += 1;
                            poll.registry().register(
                                &mut sock,
                                Token(token),
                                Interest::READABLE | Interest::WRITABLE,
                            )?;
                            sessions.insert(
                                token,
                                Session {
                                    sock,
                                    rbuf: BytesMut::with_capacity(READ_BUF),
                                    wbuf: BytesMut::new(),
                                    blocked: None,
                                },
                            );
                        }
                        Err(ref e) if would_block(e) => break,
                        Err(e) => {
                            log::warn!("accept error: {e}");
                            break;
                        }
                    }
                },

                Token(t) => {
                    let mut should_remove = false;
                    let mut deliveries = Vec::new();

                    if let Some(session) = sessions.get_mut(&t) {
                        if ev.is_readable() && session.blocked.is_none() {
                            should_remove |= !read_into_buffer(session);
                        }
                        if !should_remove && session.blocked.is_none() {
                            deliveries = process_buffered_frames(&server, SessionId(t as u64), session);
                        }
                    }
                    apply_deliveries(&server, &mut sessions, deliveries);

                    if !should_remove {
                        if let Some(session) = sessions.get_mut(&t) {
                            if !session.flush() {
                                should_remove = true;
                            }
                        }
                    }

                    if should_remove {
                        if let Some(mut session) = sessions.remove(&t) {
                            let _ = poll.registry().deregister(&mut session.sock);
                        }
                        server.cancel_session(SessionId(t as u64));
                    }
                }
            }
        }

        let deliveries = server.expire_waiters(Instant::now());
        apply_deliveries(&server, &mut sessions, deliveries);
        for session in sessions.values_mut() {
            session.flush();
        }
    }
}

/// Read all currently-available bytes into `session.rbuf`. Returns
/// `false` if the connection is gone and should be torn down.
fn read_into_buffer(session: &mut Session) -> bool {
    let mut tmp = [0u8; READ_BUF];
    loop {
        match session.sock.read(&mut tmp) {
            Ok(0) => return false,
            Ok(n) => session.rbuf.extend_from_slice(&tmp[..n]),
            Err(ref e) if would_block(e) => return true,
            Err(_) => return false,
        }
    }
}

/// Decode and execute every complete frame currently in `session.rbuf`,
/// stopping early if a command blocks the session. Returns replies owed
/// to other sessions that a push may have woken.
fn process_buffered_frames(server: &Server, session_id: SessionId, session: &mut Session) -> Vec<Delivery> {
    let mut deliveries = Vec::new();

    loop {
        let frame = match decode_frame(&session.rbuf) {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => {
                log::debug!("protocol error from session {:?}: {e}", session_id);
                // A malformed frame desyncs the byte stream; there's no
                // well-defined point to resume from, so the connection is
                // torn down without a reply.
                session.rbuf.clear();
                session.wbuf.clear();
                return deliveries;
            }
        };
        let (consumed, args) = frame;
        let _ = session.rbuf.split_to(consumed);

        match command::parse(&args) {
            Ok(cmd) => {
                let (outcome, mut more) = server.exec(session_id, cmd);
                deliveries.append(&mut more);
                match outcome {
                    Outcome::Reply(r) => {
                        let mut out = Vec::new();
                        encode_reply(&r, &mut out);
                        session.wbuf.extend_from_slice(&out);
                    }
                    Outcome::Block { key, .. } => {
                        session.blocked = Some(key);
                    }
                }
            }
            Err(e) => {
                let mut out = Vec::new();
                encode_reply(&Reply::err(e.to_string()), &mut out);
                session.wbuf.extend_from_slice(&out);
            }
        }

        if session.blocked.is_some() {
            break;
        }
    }

    deliveries
}

/// Route each delivery to its target session's write buffer, unblocking
/// it in the process. Sessions that have since disconnected are skipped.
///
/// Unblocking can itself produce more deliveries: the woken session may
/// have pipelined further commands behind its `BLPOP` while it waited, and
/// those are still sitting in its read buffer unprocessed. Draining with a
/// work queue instead of a single pass means a push that wakes session A,
/// whose next buffered command pushes to a key session B is blocked on,
/// still reaches B in the same tick instead of waiting for B's socket to
/// next become readable.
fn apply_deliveries(server: &Server, sessions: &mut AHashMap<usize, Session>, deliveries: Vec<Delivery>) {
    let mut pending: std::collections::VecDeque<Delivery> = deliveries.into();
    while let Some(delivery) = pending.pop_front() {
        let token = delivery.session.0 as usize;
        if let Some(session) = sessions.get_mut(&token) {
            session.blocked = None;
            let mut out = Vec::new();
            encode_reply(&delivery.reply, &mut out);
            session.wbuf.extend_from_slice(&out);

            if !session.rbuf.is_empty() && session.blocked.is_none() {
                let more = process_buffered_frames(server, delivery.session, session);
                pending.extend(more);
            }
            session.flush();
        }
    }
}

#[inline]
fn would_block(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted)
}
