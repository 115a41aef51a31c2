/*!
 * cinderkv Server Main Entry Point
 *
 * Loads configuration, rebuilds the store from the append-only log and
 * only then starts accepting connections.
 */

use anyhow::{Context, Result};
use cinderkv::*;
use std::net::ToSocketAddrs;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> Result<()> {
    // Respects RUST_LOG, e.g. RUST_LOG=debug
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env().context("invalid configuration")?;
    let addr = config
        .listen_addr
        .to_socket_addrs()
        .with_context(|| format!("resolving {}", config.listen_addr))?
        .next()
        .with_context(|| format!("{} resolved to no address", config.listen_addr))?;

    // A log that fails to replay aborts startup; serving a partial store is worse
    let dispatcher = Dispatcher::open(&config).context("recovering from append-only log")?;
    log::info!(
        "store ready: {} keys from {} log records",
        dispatcher.store().len(),
        dispatcher.aof().map_or(0, |a| a.replayed())
    );

    net::run_server(addr, config.workers, &dispatcher)
}
