/*!
 * Leader/Follower Replication
 *
 * Asynchronous single-leader replication over plain TCP, carrying the
 * same line grammar as the log and the client protocol.
 *
 * Leader side, per accepted connection: AwaitingSync -> Streaming. The
 * follower opens with a `SYNC` line; anything else closes the connection
 * immediately. A valid handshake gets a full snapshot framed as
 * `SNAPSHOT_BEGIN` / `SET` lines / `SNAPSHOT_END`, after which the
 * session joins the fan-out set and receives every applied mutation in
 * order. A failed send evicts just that session; a follower that
 * reconnects gets a fresh snapshot, never a gap-filled stream.
 *
 * Follower side: Connecting -> Syncing -> Streaming, looping back to
 * Connecting with bounded, jittered backoff on any I/O failure for as
 * long as the process runs.
 */

use crate::net::{Acceptor, LineEvent, LineReader, SHUTDOWN_POLL};
use crate::protocol::Command;
use crate::shutdown::Shutdown;
use crate::storage::Store;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Handshake line a follower must send before anything else
pub const SYNC: &str = "SYNC";
/// Marks the start of the snapshot transfer
pub const SNAPSHOT_BEGIN: &str = "SNAPSHOT_BEGIN";
/// Marks the end of the snapshot transfer; live streaming follows
pub const SNAPSHOT_END: &str = "SNAPSHOT_END";

/// A session write stalled this long counts as a send failure
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Follower connect attempts are bounded; the backoff handles the rest
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// First reconnect delay
const RETRY_BASE: Duration = Duration::from_millis(200);
/// Reconnect delays never exceed this
const RETRY_CAP: Duration = Duration::from_secs(10);

/// One connected follower, owned by the leader's fan-out set.
///
/// Sessions are independent: a failure on one never affects another.
struct ReplicaSession {
    peer: SocketAddr,
    stream: TcpStream,
}

/// Replication leader: accepts followers, syncs them, fans out writes.
pub struct Leader {
    sessions: Mutex<Vec<ReplicaSession>>,
    store: Arc<Store>,
    shutdown: Shutdown,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
    local_addr: SocketAddr,
}

impl Leader {
    /// Bind the replication port and start the accept loop.
    pub fn start(addr: SocketAddr, store: Arc<Store>, shutdown: Shutdown) -> Result<Arc<Leader>> {
        let mut acceptor = Acceptor::bind(addr, &shutdown)?;
        let local_addr = acceptor.local_addr()?;
        info!("replication listener on {}", local_addr);

        let leader = Arc::new(Leader {
            sessions: Mutex::new(Vec::new()),
            store,
            shutdown,
            accept_handle: Mutex::new(None),
            local_addr,
        });

        let accept_leader = leader.clone();
        let handle = std::thread::Builder::new()
            .name("repl-accept".into())
            .spawn(move || accept_leader.accept_loop(&mut acceptor))
            .context("failed to spawn replication accept thread")?;
        *leader.accept_handle.lock() = Some(handle);

        Ok(leader)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of followers currently registered for fan-out.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    fn accept_loop(self: Arc<Self>, acceptor: &mut Acceptor) {
        loop {
            match acceptor.accept() {
                Ok(Some((stream, peer))) => {
                    let leader = self.clone();
                    let spawned = std::thread::Builder::new()
                        .name(format!("repl-sync-{}", peer))
                        .spawn(move || leader.sync_session(stream, peer));
                    if let Err(e) = spawned {
                        warn!("failed to spawn sync thread: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("replication accept loop stopped: {:#}", e);
                    break;
                }
            }
        }
    }

    /// Handshake and sync one new follower connection.
    ///
    /// Snapshot capture, transfer, and registration happen in one
    /// sequence under the session lock. Because every mutation is also
    /// applied and broadcast under that lock (see [`Leader::publish`]),
    /// a command is either inside the snapshot or on the live stream
    /// after registration, never both and never neither.
    fn sync_session(&self, mut stream: TcpStream, peer: SocketAddr) {
        if stream.set_read_timeout(Some(SHUTDOWN_POLL)).is_err()
            || stream.set_write_timeout(Some(SEND_TIMEOUT)).is_err()
        {
            return;
        }
        stream.set_nodelay(true).ok();

        let mut reader = LineReader::new();
        match reader.next_line(&mut stream, &self.shutdown) {
            Ok(LineEvent::Line(line)) if line == SYNC => {}
            // any other input closes the connection, no retry
            _ => {
                debug!("closing {}: bad replication handshake", peer);
                return;
            }
        }

        let mut sessions = self.sessions.lock();
        let snapshot = self.store.snapshot_view();
        if let Err(e) = send_snapshot(&mut stream, &snapshot) {
            warn!("snapshot transfer to {} failed: {}", peer, e);
            return;
        }
        info!("follower {} synced ({} entries)", peer, snapshot.len());
        sessions.push(ReplicaSession { peer, stream });
    }

    /// Apply a mutation and broadcast it as one atomic sequence.
    ///
    /// `apply` runs under the session lock and reports whether the store
    /// actually changed; only an applied mutation is fanned out.
    pub fn publish(&self, cmd: &Command, apply: impl FnOnce() -> bool) -> bool {
        let mut sessions = self.sessions.lock();
        let applied = apply();
        if applied {
            Self::fan_out(&mut sessions, cmd);
        }
        applied
    }

    /// Send one encoded command to every registered session.
    ///
    /// A send failure evicts and closes that session alone; nothing is
    /// buffered or retried for it.
    fn fan_out(sessions: &mut Vec<ReplicaSession>, cmd: &Command) {
        if sessions.is_empty() {
            return;
        }
        let mut line = cmd.to_string();
        line.push('\n');
        sessions.retain_mut(|session| match session.stream.write_all(line.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                warn!("evicting follower {}: {}", session.peer, e);
                let _ = session.stream.shutdown(std::net::Shutdown::Both);
                false
            }
        });
    }

    /// Stop replication: trigger the shutdown token (which unparks the
    /// accept poll), force every session socket closed, and join the
    /// accept loop.
    pub fn stop(&self) {
        self.shutdown.cancel();
        {
            let mut sessions = self.sessions.lock();
            for session in sessions.iter() {
                let _ = session.stream.shutdown(std::net::Shutdown::Both);
            }
            sessions.clear();
        }
        if let Some(handle) = self.accept_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn send_snapshot(stream: &mut TcpStream, snapshot: &[Command]) -> std::io::Result<()> {
    // one buffered write; the session lock is held while this runs
    let mut payload = String::with_capacity(32 * (snapshot.len() + 2));
    payload.push_str(SNAPSHOT_BEGIN);
    payload.push('\n');
    for cmd in snapshot {
        payload.push_str(&cmd.to_string());
        payload.push('\n');
    }
    payload.push_str(SNAPSHOT_END);
    payload.push('\n');
    stream.write_all(payload.as_bytes())
}

/// Replication follower: maintains one link to the configured leader.
pub struct Follower {
    shutdown: Shutdown,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Follower {
    /// Start the reconnect-and-stream loop against `leader_addr`.
    pub fn start(leader_addr: SocketAddr, store: Arc<Store>, shutdown: Shutdown) -> Result<Follower> {
        let thread_shutdown = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("repl-follower".into())
            .spawn(move || follower_loop(leader_addr, &store, &thread_shutdown))
            .context("failed to spawn follower thread")?;
        Ok(Follower {
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the link: trigger the shutdown token and join the loop.
    pub fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Connecting -> Syncing -> Streaming, forever.
///
/// Every exit from the inner stream (connect refusal, mid-stream error,
/// clean EOF from a stopping leader) lands back here, where a bounded
/// jittered backoff paces the next attempt until cancellation.
fn follower_loop(leader_addr: SocketAddr, store: &Store, shutdown: &Shutdown) {
    let mut backoff = Backoff::new(RETRY_BASE, RETRY_CAP);
    while !shutdown.is_cancelled() {
        match stream_from_leader(leader_addr, store, &mut backoff, shutdown) {
            Ok(()) => debug!("replication link to {} closed", leader_addr),
            Err(e) => debug!("replication link to {} lost: {}", leader_addr, e),
        }
        if shutdown.is_cancelled() {
            break;
        }
        let delay = backoff.next_delay();
        debug!("reconnecting to {} in {:?}", leader_addr, delay);
        if shutdown.wait(delay) {
            break;
        }
    }
}

/// One connection's worth of replication: handshake, snapshot, stream.
fn stream_from_leader(
    leader_addr: SocketAddr,
    store: &Store,
    backoff: &mut Backoff,
    shutdown: &Shutdown,
) -> std::io::Result<()> {
    let mut stream = TcpStream::connect_timeout(&leader_addr, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(SHUTDOWN_POLL))?;
    stream.set_nodelay(true).ok();

    stream.write_all(format!("{}\n", SYNC).as_bytes())?;
    debug!("requested snapshot from {}", leader_addr);

    let mut reader = LineReader::new();

    // Syncing: read until the begin marker, then ingest SET lines
    loop {
        match reader.next_line(&mut stream, shutdown)? {
            LineEvent::Line(line) if line == SNAPSHOT_BEGIN => break,
            LineEvent::Line(_) => continue,
            LineEvent::Closed => return Ok(()),
        }
    }
    let mut loaded = 0usize;
    loop {
        match reader.next_line(&mut stream, shutdown)? {
            LineEvent::Line(line) if line == SNAPSHOT_END => break,
            LineEvent::Line(line) => match Command::decode(&line) {
                Ok(cmd @ Command::Set { .. }) => {
                    store.apply(&cmd);
                    loaded += 1;
                }
                Ok(_) | Err(_) => debug!("ignoring snapshot line {:?}", line),
            },
            LineEvent::Closed => return Ok(()),
        }
    }
    info!("snapshot from {} ingested: {} entries", leader_addr, loaded);
    backoff.reset();

    // Streaming: apply each inbound line like a local mutation, but
    // write nothing to the local log for it
    loop {
        match reader.next_line(&mut stream, shutdown)? {
            LineEvent::Line(line) => match Command::decode(&line) {
                Ok(cmd) => {
                    store.apply(&cmd);
                }
                Err(e) => debug!("ignoring stream line {:?}: {}", line, e),
            },
            LineEvent::Closed => return Ok(()),
        }
    }
}

/// Bounded exponential backoff with +/-25% jitter.
struct Backoff {
    base: Duration,
    cap: Duration,
    next: Duration,
}

impl Backoff {
    fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            next: base,
        }
    }

    fn reset(&mut self) {
        self.next = self.base;
    }

    fn next_delay(&mut self) -> Duration {
        let jitter = 0.75 + rand::random::<f64>() * 0.5;
        let delay = self.next.mul_f64(jitter);
        self.next = (self.next * 2).min(self.cap);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(400));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));
        backoff.next_delay();
        backoff.next_delay();
        // capped from here on
        let capped = backoff.next_delay();
        assert!(capped <= Duration::from_millis(500));
        assert_eq!(backoff.next, Duration::from_millis(400));
        backoff.reset();
        assert_eq!(backoff.next, Duration::from_millis(100));
    }
}
