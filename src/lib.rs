// Core modules for the respio key-value server
pub mod resp; // RESP decoder/encoder (C1/C2)
pub mod command; // command parser (C3)
pub mod storage; // keyspace: strings, lists, streams (C4)
pub mod waiters; // BLPOP waiter registry (C5)
pub mod shard; // command execution / handler layer (C6)
pub mod net; // mio reactor / session loop (C7)

pub use command::{Command, CommandError};
pub use resp::{ProtocolError, Reply};
pub use shard::{Delivery, Outcome, Server};
pub use waiters::SessionId;

/// Default bind address.
pub const DEFAULT_ADDR: &str = "0.0.0.0:7379";
