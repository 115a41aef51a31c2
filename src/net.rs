/*!
 * Network Layer and Event Loop
 *
 * Thin socket glue around the dispatcher: every worker thread runs its own
 * mio event loop on a SO_REUSEPORT listener, decodes whatever frames are
 * buffered per connection, dispatches them in order and writes the replies
 * back. A malformed frame ends the connection.
 */

use crate::dispatch::Dispatcher;
use crate::protocol::{self, write_error, Frame};
use anyhow::{Context, Result};
use bytes::BytesMut;
use hashbrown::HashMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Read, Write};
use std::net::SocketAddr;

/// Size of read buffer for incoming data
const READ_BUF: usize = 4096;

const LISTENER: Token = Token(0);

/// Per-connection state
struct Conn {
    sock: TcpStream,
    rbuf: BytesMut,
    wbuf: BytesMut,
    frames: Vec<Frame>,
    /// Set after a protocol error or peer close: flush what is queued, then close
    closing: bool,
}

impl Conn {
    fn new(sock: TcpStream) -> Self {
        Self {
            sock,
            rbuf: BytesMut::with_capacity(READ_BUF),
            wbuf: BytesMut::new(),
            frames: Vec::with_capacity(32),
            closing: false,
        }
    }
}

/// Bind a TCP listener with SO_REUSEPORT support
///
/// Lets every worker bind the same port; the kernel spreads incoming
/// connections across them.
pub fn bind_reuseport(addr: SocketAddr) -> Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    #[cfg(unix)]
    {
        socket.set_reuse_address(true)?;
        socket.set_reuse_port(true)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Serve clients until a worker fails
///
/// Spawns `workers` event-loop threads, each borrowing the dispatcher.
/// The dispatcher must already be fully recovered from its log.
pub fn run_server(addr: SocketAddr, workers: usize, dispatcher: &Dispatcher) -> Result<()> {
    let workers = workers.max(1);
    log::info!("serving on {} with {} worker threads", addr, workers);

    crossbeam::scope(|s| -> Result<()> {
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                s.builder()
                    .name(format!("worker-{}", id))
                    .spawn(move |_| {
                        let res = run_worker_loop(id, addr, dispatcher);
                        if let Err(e) = &res {
                            log::error!("worker {} failed: {:#}", id, e);
                        }
                        res
                    })
            })
            .collect::<std::io::Result<_>>()?;

        for h in handles {
            h.join().map_err(|_| anyhow::anyhow!("worker thread panicked"))??;
        }
        Ok(())
    })
    .map_err(|_| anyhow::anyhow!("worker thread panicked"))?
}

/// Event loop for a single worker thread
fn run_worker_loop(id: usize, addr: SocketAddr, dispatcher: &Dispatcher) -> Result<()> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(1024);

    let mut listener = bind_reuseport(addr).with_context(|| format!("worker {} binding {}", id, addr))?;
    poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;

    let mut clients: HashMap<usize, Conn> = HashMap::new();
    let mut next_tok: usize = 1;
    let mut tmp_buf = [0u8; READ_BUF];

    loop {
        poll.poll(&mut events, None)?;

        for ev in events.iter() {
            match ev.token() {
                LISTENER => loop {
                    match listener.accept() {
                        Ok((mut sock, peer)) => {
                            sock.set_nodelay(true).ok();
                            let tok = next_tok;
                            next_tok = next_tok.wrapping_add(1);
                            if next_tok == 0 {
                                next_tok = 1;
                            }

                            poll.registry().register(&mut sock, Token(tok), Interest::READABLE)?;
                            log::debug!("worker {} accepted {} as #{}", id, peer, tok);
                            clients.insert(tok, Conn::new(sock));
                        }
                        Err(ref e) if would_block(e) => break,
                        Err(e) => {
                            log::warn!("worker {} accept error: {}", id, e);
                            break;
                        }
                    }
                },
                Token(t) => {
                    let Some(conn) = clients.get_mut(&t) else {
                        continue;
                    };

                    let mut should_remove = false;
                    if ev.is_readable() && !conn.closing {
                        let eof = read_into(conn, &mut tmp_buf);
                        process(t, conn, dispatcher);
                        // Answer what the peer sent before it hung up
                        conn.closing |= eof;
                    }
                    if !conn.wbuf.is_empty() {
                        should_remove = flush(conn);
                    }
                    if conn.closing && conn.wbuf.is_empty() {
                        should_remove = true;
                    }

                    if !should_remove {
                        let interest = if conn.wbuf.is_empty() {
                            Interest::READABLE
                        } else {
                            Interest::READABLE | Interest::WRITABLE
                        };
                        if poll.registry().reregister(&mut conn.sock, Token(t), interest).is_err() {
                            should_remove = true;
                        }
                    }

                    if should_remove {
                        log::debug!("worker {} closing #{}", id, t);
                        clients.remove(&t);
                    }
                }
            }
        }
    }
}

/// Drain the socket into the read buffer
///
/// # Returns
/// * `true` if the peer closed or the socket failed
fn read_into(conn: &mut Conn, tmp_buf: &mut [u8]) -> bool {
    loop {
        match conn.sock.read(tmp_buf) {
            Ok(0) => return true,
            Ok(n) => conn.rbuf.extend_from_slice(&tmp_buf[..n]),
            Err(ref e) if would_block(e) => return false,
            Err(_) => return true,
        }
    }
}

/// Decode every complete buffered frame and queue the replies
///
/// Frames that decoded before a protocol error are still answered; the
/// error itself is reported once and the connection is marked for close.
fn process(t: usize, conn: &mut Conn, dispatcher: &Dispatcher) {
    conn.frames.clear();
    let res = protocol::decode_many(&mut conn.rbuf, &mut conn.frames);

    for frame in conn.frames.drain(..) {
        dispatcher.dispatch(&frame).encode(&mut conn.wbuf);
    }

    if let Err(e) = res {
        log::debug!("protocol error on #{}: {}", t, e);
        write_error(&format!("ERR Protocol error: {}", e), &mut conn.wbuf);
        conn.rbuf.clear();
        conn.closing = true;
    }
}

/// Write as much of the reply buffer as the socket takes
///
/// # Returns
/// * `true` if the socket failed
fn flush(conn: &mut Conn) -> bool {
    while !conn.wbuf.is_empty() {
        match conn.sock.write(&conn.wbuf) {
            Ok(0) => return true,
            Ok(n) => {
                let _ = conn.wbuf.split_to(n);
            }
            Err(ref e) if would_block(e) => return false,
            Err(_) => return true,
        }
    }
    false
}

/// Check if an I/O error indicates the operation would block
#[inline]
fn would_block(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}
