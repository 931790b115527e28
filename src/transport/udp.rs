//! UDP transport: bound socket, receive loop, send primitives
//!
//! Owns the one bound datagram socket for the process. A dedicated
//! `udp-receive` thread decodes incoming frames and pushes them onto a
//! bounded lock-free queue; the dispatch loop drains the queue on its own
//! tick via [`UdpTransport::try_dequeue`].
//!
//! # Oversized payloads
//!
//! Frames larger than the configured datagram limit divert through the
//! one-shot TCP channel in [`crate::transport::fallback`]: the sender parks
//! the full frame behind an ephemeral listener and sends a small `Tcp`
//! control datagram carrying `"<port>:<length>"`. The receive loop consumes
//! the control frame, synchronously fetches and decodes the streamed body,
//! and queues the reconstructed message - the dispatch loop never sees the
//! control kind.
//!
//! # Failure semantics
//!
//! Everything after a successful bind is recoverable: decode failures and
//! socket errors are logged, reported on the error event channel, and the
//! receive loop re-arms. Only the disposed state ends the loop. A bind
//! failure disables messaging for the process lifetime - callers degrade to
//! "transport absent".

use crate::config::FallbackConfig;
use crate::error::{Error, Result};
use crate::protocol::codec::MAX_FRAME_SIZE;
use crate::protocol::{Message, MessageKind, decode, encode};
use crate::transport::fallback;
use crossbeam_channel::{Receiver, Sender, bounded};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Inbound queue capacity. The dispatch loop drains every tick, so this
/// only needs to cover one host frame of traffic.
const INBOUND_QUEUE_CAPACITY: usize = 256;

/// Receive buffer size - largest datagram we will ever accept.
const RECV_BUFFER_SIZE: usize = 65536;

/// Read timeout on the receive socket so the loop observes the closed flag.
const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Error event channel capacity; producers use try_send and never block.
const ERROR_CHANNEL_CAPACITY: usize = 16;

/// Counters exposed for periodic statistics logging.
#[derive(Debug, Default)]
pub struct TransportStats {
    pub datagrams_in: AtomicU64,
    pub datagrams_out: AtomicU64,
    pub decode_failures: AtomicU64,
    pub fallback_served: AtomicU64,
    pub fallback_fetched: AtomicU64,
}

impl TransportStats {
    pub fn summary(&self) -> String {
        format!(
            "in={} out={} decode_err={} fallback_served={} fallback_fetched={}",
            self.datagrams_in.load(Ordering::Relaxed),
            self.datagrams_out.load(Ordering::Relaxed),
            self.decode_failures.load(Ordering::Relaxed),
            self.fallback_served.load(Ordering::Relaxed),
            self.fallback_fetched.load(Ordering::Relaxed),
        )
    }
}

/// State shared between the owning handle, the receive thread, and any
/// in-flight send. The `closed` mutex is the dispose guard: send paths
/// check it while holding the lock, so a concurrent dispose cannot race a
/// send into a closed socket.
struct Shared {
    socket: UdpSocket,
    inbound: ArrayQueue<Message>,
    closed: Mutex<bool>,
    errors_tx: Sender<Error>,
    stats: TransportStats,
}

impl Shared {
    fn report(&self, err: Error) {
        log::error!("Transport error: {err}");
        // Observability tap only - dropping events when nobody drains is fine.
        let _ = self.errors_tx.try_send(err);
    }
}

/// The process-wide datagram transport.
pub struct UdpTransport {
    shared: Arc<Shared>,
    local_port: u16,
    max_datagram: usize,
    fallback: FallbackConfig,
    errors_rx: Receiver<Error>,
    recv_thread: Option<JoinHandle<()>>,
}

impl UdpTransport {
    /// Bind the datagram socket and start the receive loop.
    ///
    /// The socket is created with `SO_REUSEADDR` (so a process can rebind
    /// immediately after a host reload tears the transport down) and
    /// close-on-exec (so a forked child cannot silently clone and steal the
    /// bound port). `port == 0` binds an ephemeral port.
    pub fn bind(port: u16, max_datagram: usize, fallback: FallbackConfig) -> Result<Self> {
        let socket = bind_socket(port).map_err(|source| Error::Bind { port, source })?;
        socket
            .set_read_timeout(Some(RECV_POLL_TIMEOUT))
            .map_err(|source| Error::Bind { port, source })?;
        let local_port = socket
            .local_addr()
            .map_err(|source| Error::Bind { port, source })?
            .port();

        let (errors_tx, errors_rx) = bounded(ERROR_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            socket,
            inbound: ArrayQueue::new(INBOUND_QUEUE_CAPACITY),
            closed: Mutex::new(false),
            errors_tx,
            stats: TransportStats::default(),
        });

        let recv_shared = Arc::clone(&shared);
        let fetch_timeout = fallback.fetch_timeout();
        let recv_thread = thread::Builder::new()
            .name("udp-receive".to_string())
            .spawn(move || receive_loop(&recv_shared, fetch_timeout))?;

        log::info!("Transport bound to UDP port {local_port}");

        Ok(Self {
            shared,
            local_port,
            max_datagram,
            fallback,
            errors_rx,
            recv_thread: Some(recv_thread),
        })
    }

    /// Port the transport is actually bound to.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Non-blocking pop from the inbound queue. Called repeatedly by the
    /// dispatch loop on its tick.
    pub fn try_dequeue(&self) -> Option<Message> {
        self.shared.inbound.pop()
    }

    /// Observability tap for transport-level errors. Events are dropped
    /// rather than ever blocking the receive or send paths.
    pub fn error_events(&self) -> Receiver<Error> {
        self.errors_rx.clone()
    }

    pub fn stats(&self) -> &TransportStats {
        &self.shared.stats
    }

    /// Encode and transmit, fire-and-forget. Frames above the datagram
    /// limit divert through the one-shot streaming fallback.
    pub fn send(&self, endpoint: SocketAddr, kind: MessageKind, payload: &str) {
        let frame = encode(&Message::new(kind, payload));
        if frame.len() > self.max_datagram {
            self.send_oversized(endpoint, frame);
            return;
        }
        self.transmit(endpoint, &frame);
    }

    /// Blocking variant with an explicit timeout, reserved for last-gasp
    /// teardown notifications. Oversized payloads are dropped outright -
    /// the fallback handshake is not attempted on this path.
    pub fn send_blocking(
        &self,
        endpoint: SocketAddr,
        kind: MessageKind,
        payload: &str,
        timeout: Duration,
    ) {
        let frame = encode(&Message::new(kind, payload));
        if frame.len() > self.max_datagram {
            log::warn!(
                "Dropping oversized blocking send of {} bytes to {endpoint} (kind {kind:?})",
                frame.len()
            );
            return;
        }

        let closed = self.shared.closed.lock();
        if *closed {
            return;
        }
        let _ = self.shared.socket.set_write_timeout(Some(timeout));
        match self.shared.socket.send_to(&frame, endpoint) {
            Ok(_) => {
                self.shared.stats.datagrams_out.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.shared
                    .report(Error::Transport(format!("blocking send to {endpoint}: {e}")));
            }
        }
        let _ = self.shared.socket.set_write_timeout(None);
    }

    /// Mark the transport closed. In-flight sends and the receive loop
    /// observe the flag and exit quietly instead of throwing into host code.
    pub fn dispose(&self) {
        let mut closed = self.shared.closed.lock();
        if !*closed {
            *closed = true;
            log::info!(
                "Transport on port {} disposed ({})",
                self.local_port,
                self.shared.stats.summary()
            );
        }
    }

    fn transmit(&self, endpoint: SocketAddr, frame: &[u8]) {
        let closed = self.shared.closed.lock();
        if *closed {
            return;
        }
        match self.shared.socket.send_to(frame, endpoint) {
            Ok(_) => {
                self.shared.stats.datagrams_out.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.shared
                    .report(Error::Transport(format!("send to {endpoint}: {e}")));
            }
        }
    }

    fn send_oversized(&self, endpoint: SocketAddr, frame: Vec<u8>) {
        let frame_len = frame.len();
        match fallback::serve_oneshot(
            frame,
            self.fallback.accept_timeout(),
            self.shared.errors_tx.clone(),
        ) {
            Ok(listener_port) => {
                log::debug!(
                    "Diverting {frame_len} byte frame for {endpoint} through fallback port {listener_port}"
                );
                self.shared.stats.fallback_served.fetch_add(1, Ordering::Relaxed);
                let control = fallback::format_control(listener_port, frame_len);
                let control_frame = encode(&Message::new(MessageKind::Tcp, control));
                self.transmit(endpoint, &control_frame);
            }
            Err(e) => {
                // No ephemeral port available - the oversized send is lost.
                log::warn!("Dropping {frame_len} byte frame for {endpoint}: {e}");
            }
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.dispose();
        if let Some(handle) = self.recv_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Create the datagram socket with address reuse and close-on-exec set
/// before bind.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_socket(port: u16) -> std::io::Result<UdpSocket> {
    use std::os::fd::FromRawFd;

    // SAFETY: plain socket/setsockopt/bind syscalls; the fd is checked at
    // every step and handed to UdpSocket exactly once.
    unsafe {
        let fd = libc::socket(
            libc::AF_INET,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
            libc::IPPROTO_UDP,
        );
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&raw const one).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) != 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(Ipv4Addr::UNSPECIFIED).to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            (&raw const addr).cast(),
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) != 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(UdpSocket::from_raw_fd(fd))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_socket(port: u16) -> std::io::Result<UdpSocket> {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
}

/// Receive loop body. Re-arms after every iteration - success, decode
/// failure, or recoverable socket error; only the disposed state ends it.
fn receive_loop(shared: &Shared, fetch_timeout: Duration) {
    log::debug!("Receive loop started");
    let mut buf = [0u8; RECV_BUFFER_SIZE];

    loop {
        if *shared.closed.lock() {
            break;
        }

        match shared.socket.recv_from(&mut buf) {
            Ok((n, origin)) => {
                shared.stats.datagrams_in.fetch_add(1, Ordering::Relaxed);
                handle_datagram(shared, &buf[..n], origin, fetch_timeout);
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                // Read timeout - just re-check the closed flag.
            }
            Err(e) => {
                if *shared.closed.lock() {
                    break;
                }
                shared.report(Error::Transport(format!("recv: {e}")));
                // Back off briefly so a persistent socket error cannot
                // spin the thread.
                thread::sleep(Duration::from_millis(10));
            }
        }
    }

    log::debug!("Receive loop stopped");
}

fn handle_datagram(shared: &Shared, datagram: &[u8], origin: SocketAddr, fetch_timeout: Duration) {
    let mut msg = match decode(datagram) {
        Ok(msg) => msg,
        Err(e) => {
            shared.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
            shared.report(e);
            return;
        }
    };

    if msg.kind == MessageKind::Tcp {
        msg = match fetch_streamed(&msg.payload, fetch_timeout) {
            Ok(real) => real,
            Err(e) => {
                shared.report(e);
                return;
            }
        };
        shared.stats.fallback_fetched.fetch_add(1, Ordering::Relaxed);
    }

    msg.origin = Some(origin);
    if shared.inbound.push(msg).is_err() {
        log::warn!("Inbound queue full, dropping message from {origin}");
    }
}

/// Resolve a fallback control frame into the real message it announces.
/// The announced length is bounded before any buffer is allocated - the
/// control payload comes off the wire and cannot be trusted.
fn fetch_streamed(control: &str, fetch_timeout: Duration) -> Result<Message> {
    let (port, length) = fallback::parse_control(control)?;
    if length > MAX_FRAME_SIZE {
        return Err(Error::Decode(format!(
            "fallback length {length} exceeds frame limit {MAX_FRAME_SIZE}"
        )));
    }
    let body = fallback::fetch(port, length, fetch_timeout)?;
    decode(&body)
}
