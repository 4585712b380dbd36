/*!
 * cinderkv Server Entry Point
 *
 * Chooses the node's role from the command line (standalone, leader, or
 * follower), replays the append-only log before serving, starts the
 * background sweep and compaction tasks, and runs until an interrupt or
 * terminate signal triggers the shutdown sequence: cancel the token,
 * stop every component in reverse start order, join the tasks.
 */

use anyhow::Result;
use clap::Parser;
use cinderkv::{
    spawn_compactor, spawn_sweeper, Aof, Engine, Follower, Leader, Server, Shutdown, Store,
};
use log::info;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(
    name = "cinderkv",
    about = "Replicated in-memory key-value store with TTL expiry and an append-only log"
)]
struct Args {
    /// Client listen address
    #[arg(long, default_value = cinderkv::DEFAULT_ADDR)]
    addr: SocketAddr,

    /// Serve replication to followers on this address (leader role)
    #[arg(long, conflicts_with = "follow")]
    replicate_on: Option<SocketAddr>,

    /// Replicate from the leader at this address (follower role)
    #[arg(long)]
    follow: Option<SocketAddr>,

    /// Append-only log path
    #[arg(long, default_value = cinderkv::DEFAULT_AOF_PATH)]
    aof: PathBuf,

    /// Seconds between expiry sweeps
    #[arg(long, default_value_t = 1)]
    sweep_interval: u64,

    /// Seconds between log compactions
    #[arg(long, default_value_t = 15)]
    compact_interval: u64,
}

fn main() -> Result<()> {
    // Respects RUST_LOG, e.g. RUST_LOG=debug cargo run --release
    env_logger::init();
    let args = Args::parse();

    let shutdown = Shutdown::new();
    install_signal_handlers();

    // Rebuild the store from the log before anything serves
    let store = Arc::new(Store::new());
    let aof = Arc::new(Aof::open(&args.aof));
    let replayed = aof.replay(&store)?;
    info!(
        "replayed {} log entries from {} ({} live keys)",
        replayed,
        aof.path().display(),
        store.size()
    );

    let sweeper = spawn_sweeper(
        store.clone(),
        Duration::from_secs(args.sweep_interval),
        shutdown.clone(),
    )?;
    let compactor = spawn_compactor(
        aof.clone(),
        store.clone(),
        Duration::from_secs(args.compact_interval),
        shutdown.clone(),
    )?;

    let leader = match args.replicate_on {
        Some(addr) => Some(Leader::start(addr, store.clone(), shutdown.clone())?),
        None => None,
    };
    let follower = match args.follow {
        Some(addr) => Some(Follower::start(addr, store.clone(), shutdown.clone())?),
        None => None,
    };

    let engine = Arc::new(Engine::new(store, Some(aof.clone()), leader.clone()));
    let server = Server::start(args.addr, engine, shutdown.clone())?;
    info!("cinderkv serving on {}", server.local_addr());

    // Park until a signal arrives or something else trips the token
    while !shutdown.wait(Duration::from_millis(200)) {
        if signal_pending() {
            info!("signal received, shutting down");
            shutdown.cancel();
        }
    }

    // Reverse start order; each stop is idempotent on the shared token
    server.join();
    if let Some(follower) = &follower {
        follower.stop();
    }
    if let Some(leader) = &leader {
        leader.stop();
    }
    let _ = compactor.join();
    let _ = sweeper.join();
    info!("shutdown complete");
    Ok(())
}

static SIGNALLED: AtomicBool = AtomicBool::new(false);

fn signal_pending() -> bool {
    SIGNALLED.load(Ordering::SeqCst)
}

#[cfg(unix)]
extern "C" fn on_signal(_sig: libc::c_int) {
    // only an atomic store: anything more is off-limits in a handler
    SIGNALLED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}
