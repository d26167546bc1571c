/*!
 * respio Server Main Entry Point
 *
 * Initializes logging, builds the shared `Server`, and starts the
 * reactor. Only a single thread runs today; the listener is still bound
 * with `SO_REUSEPORT` so a future multi-threaded reactor pool can share
 * one address without a rewrite.
 */

use anyhow::Result;
use respio::shard::Server;
use std::net::ToSocketAddrs;
use std::sync::Arc;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    // RUST_LOG=debug cargo run --release
    env_logger::init();

    let addr = bind_addr()?;
    let server = Arc::new(Server::new());

    log::info!("respio listening on {}", addr);
    respio::net::run(addr, server)
}

/// Resolve the bind address: first CLI argument, else `RESPIO_ADDR`, else
/// the crate default. No flag parsing crate is introduced for this one
/// override — `std::env::args()` is enough.
fn bind_addr() -> Result<std::net::SocketAddr> {
    let raw = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("RESPIO_ADDR").ok())
        .unwrap_or_else(|| respio::DEFAULT_ADDR.to_string());
    Ok(raw.to_socket_addrs()?.next().unwrap())
}
