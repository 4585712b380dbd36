/*!
 * Network Layer and Client Front End
 *
 * This module provides the TCP plumbing shared by the client-facing
 * server and the replication listener: socket2-based listener setup, a
 * cancellable accept loop (a mio poll that observes both "connection
 * ready" and the shutdown waker), and buffered newline framing over
 * blocking sockets.
 *
 * The client front end itself runs one thread per connection: each line
 * is tokenized (double quotes and backslash escapes respected),
 * dispatched through the engine, and answered with exactly one response
 * line. Connection reads carry a bounded timeout used only to re-check
 * cancellation; an idle client is never disconnected.
 */

use crate::engine::Engine;
use crate::protocol::{self, Response};
use crate::shutdown::Shutdown;
use anyhow::{Context, Result};
use bytes::BytesMut;
use log::{debug, info, warn};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Size of the per-connection read buffer
const READ_BUF: usize = 4096;

/// How long blocking waits may park before re-checking the shutdown token
pub(crate) const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// Bind a nonblocking TCP listener with SO_REUSEADDR set.
///
/// Uses socket2 so restarting the process does not trip over sockets
/// lingering in TIME_WAIT.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(SockProtocol::TCP))
        .context("failed to create socket")?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind {}", addr))?;
    socket.listen(128)?;

    Ok(socket.into())
}

/// Cancellable accept loop over a nonblocking listener.
///
/// Accepting parks in a mio poll registered with both the listener and a
/// waker tied to the shutdown token, so `accept` returns promptly for a
/// new connection or for cancellation.
pub struct Acceptor {
    listener: TcpListener,
    poll: Poll,
    events: Events,
    shutdown: Shutdown,
}

impl Acceptor {
    pub fn bind(addr: SocketAddr, shutdown: &Shutdown) -> Result<Self> {
        let listener = bind_listener(addr)?;
        let poll = Poll::new().context("failed to create poll")?;

        #[cfg(unix)]
        {
            use mio::unix::SourceFd;
            use std::os::unix::io::AsRawFd;
            poll.registry()
                .register(
                    &mut SourceFd(&listener.as_raw_fd()),
                    LISTENER,
                    Interest::READABLE,
                )
                .context("failed to register listener")?;
        }

        let waker = Waker::new(poll.registry(), WAKER).context("failed to create waker")?;
        shutdown.register_waker(waker);

        Ok(Self {
            listener,
            poll,
            events: Events::with_capacity(8),
            shutdown: shutdown.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Block until a connection is ready or shutdown is triggered.
    ///
    /// Returns `Ok(None)` once cancelled. The accepted stream is switched
    /// back to blocking mode: connections are handled by dedicated
    /// threads, not by this poll.
    pub fn accept(&mut self) -> Result<Option<(TcpStream, SocketAddr)>> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(None);
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    return Ok(Some((stream, peer)));
                }
                Err(ref e) if would_block(e) => {
                    // bounded timeout as a belt over the waker, and for
                    // platforms where the listener is not in the poll set
                    if let Err(e) = self.poll.poll(&mut self.events, Some(SHUTDOWN_POLL)) {
                        // a signal landing mid-poll is just an early tick
                        if e.kind() != std::io::ErrorKind::Interrupted {
                            return Err(e).context("accept poll failed");
                        }
                    }
                }
                Err(e) => {
                    // transient accept failure; keep the loop alive
                    warn!("accept failed: {}", e);
                    if self.shutdown.wait(SHUTDOWN_POLL) {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// Check if an I/O error indicates the operation would block
#[inline]
fn would_block(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

/// Check if an I/O error is a read-timeout tick rather than a failure
#[inline]
fn timed_out(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

/// Outcome of waiting for the next protocol line.
pub enum LineEvent {
    Line(String),
    /// Peer closed the connection, or shutdown was triggered
    Closed,
}

/// Newline framing over a blocking socket with a bounded read timeout.
///
/// Callers must have set a read timeout on the stream; timeout ticks are
/// absorbed here and only used to observe the shutdown token, so a quiet
/// peer parks the calling thread without ever dropping the connection.
pub struct LineReader {
    buf: BytesMut,
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

impl LineReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_BUF),
        }
    }

    pub fn next_line(
        &mut self,
        stream: &mut TcpStream,
        shutdown: &Shutdown,
    ) -> std::io::Result<LineEvent> {
        let mut tmp = [0u8; READ_BUF];
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    let len = line.len() - 1;
                    line.truncate(len);
                }
                return Ok(LineEvent::Line(String::from_utf8_lossy(&line).into_owned()));
            }
            if shutdown.is_cancelled() {
                return Ok(LineEvent::Closed);
            }
            match stream.read(&mut tmp) {
                Ok(0) => return Ok(LineEvent::Closed),
                Ok(n) => self.buf.extend_from_slice(&tmp[..n]),
                Err(ref e) if timed_out(e) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// The line-oriented client-facing TCP server.
pub struct Server {
    local_addr: SocketAddr,
    handle: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind the client port and start accepting connections.
    pub fn start(addr: SocketAddr, engine: Arc<Engine>, shutdown: Shutdown) -> Result<Server> {
        let mut acceptor = Acceptor::bind(addr, &shutdown)?;
        let local_addr = acceptor.local_addr()?;
        info!("client listener on {}", local_addr);

        let handle = std::thread::Builder::new()
            .name("client-accept".into())
            .spawn(move || accept_loop(&mut acceptor, &engine, &shutdown))
            .context("failed to spawn client accept thread")?;

        Ok(Server {
            local_addr,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the accept loop to finish (it exits once the shutdown
    /// token is triggered; connection threads drain on their own).
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(acceptor: &mut Acceptor, engine: &Arc<Engine>, shutdown: &Shutdown) {
    loop {
        match acceptor.accept() {
            Ok(Some((stream, peer))) => {
                debug!("client connected from {}", peer);
                let engine = engine.clone();
                let shutdown = shutdown.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("client-{}", peer))
                    .spawn(move || {
                        if let Err(e) = serve_connection(stream, &engine, &shutdown) {
                            debug!("client {} dropped: {}", peer, e);
                        } else {
                            debug!("client {} disconnected", peer);
                        }
                    });
                if let Err(e) = spawned {
                    warn!("failed to spawn client thread: {}", e);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("client accept loop stopped: {:#}", e);
                break;
            }
        }
    }
}

/// Serve one client connection: one response line per command line.
fn serve_connection(
    mut stream: TcpStream,
    engine: &Engine,
    shutdown: &Shutdown,
) -> std::io::Result<()> {
    stream.set_nodelay(true).ok();
    stream.set_read_timeout(Some(SHUTDOWN_POLL))?;

    let mut reader = LineReader::new();
    loop {
        match reader.next_line(&mut stream, shutdown)? {
            LineEvent::Line(line) => {
                // blank lines get no response at all
                if line.trim().is_empty() {
                    continue;
                }
                let response = match protocol::parse_request(&line) {
                    Ok(request) => engine.dispatch(request),
                    Err(e) => Response::Error(e.to_string()),
                };
                let mut out = response.to_string();
                out.push('\n');
                stream.write_all(out.as_bytes())?;
            }
            LineEvent::Closed => return Ok(()),
        }
    }
}
