//! One-shot TCP fallback channel for oversized frames
//!
//! A frame that does not fit in a datagram is parked behind an ephemeral
//! TCP listener; the receiver is told `"<port>:<length>"` in a small control
//! datagram and fetches the frame with a single connect + exact-length read.
//! The listener serves exactly one connector and is torn down afterwards,
//! or after a timeout if nobody connects (the frame is lost - best-effort
//! semantics, no retry).

use crate::error::{Error, Result};
use crossbeam_channel::Sender;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

/// Poll interval while waiting for the single connector.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Build the control payload announcing a parked frame.
pub fn format_control(port: u16, length: usize) -> String {
    format!("{port}:{length}")
}

/// Parse a `"<port>:<length>"` control payload.
pub fn parse_control(payload: &str) -> Result<(u16, usize)> {
    let (port_str, len_str) = payload
        .split_once(':')
        .ok_or_else(|| Error::Decode(format!("malformed fallback control: {payload:?}")))?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| Error::Decode(format!("bad fallback port: {port_str:?}")))?;
    let length: usize = len_str
        .parse()
        .map_err(|_| Error::Decode(format!("bad fallback length: {len_str:?}")))?;
    Ok((port, length))
}

/// Park `frame` behind a one-shot listener on an ephemeral localhost port.
///
/// Returns the listener port. A named thread serves the frame to the first
/// connector, then exits; if nobody connects within `accept_timeout` the
/// listener is dropped, the frame lost, and an [`Error::FallbackTimeout`]
/// event posted to `errors` (try_send, never blocking).
pub fn serve_oneshot(
    frame: Vec<u8>,
    accept_timeout: Duration,
    errors: Sender<Error>,
) -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let port = listener.local_addr()?.port();
    listener.set_nonblocking(true)?;

    thread::Builder::new()
        .name("fallback-serve".to_string())
        .spawn(move || serve_loop(listener, frame, accept_timeout, &errors))?;

    Ok(port)
}

fn serve_loop(
    listener: TcpListener,
    frame: Vec<u8>,
    accept_timeout: Duration,
    errors: &Sender<Error>,
) {
    let deadline = Instant::now() + accept_timeout;

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::debug!(
                    "Fallback listener serving {} bytes to {peer}",
                    frame.len()
                );
                serve_connection(stream, &frame);
                // Exactly one fetch; drop the listener immediately.
                return;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    log::warn!(
                        "Fallback listener on port {} timed out, dropping {} byte frame",
                        listener.local_addr().map(|a| a.port()).unwrap_or(0),
                        frame.len()
                    );
                    let _ = errors.try_send(Error::FallbackTimeout(accept_timeout));
                    return;
                }
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                log::error!("Fallback listener accept error: {e}");
                return;
            }
        }
    }
}

fn serve_connection(mut stream: TcpStream, frame: &[u8]) {
    if let Err(e) = stream.set_nonblocking(false) {
        log::warn!("Failed to set fallback stream blocking: {e}");
    }
    if let Err(e) = stream
        .write_all(frame)
        .and_then(|()| stream.flush())
    {
        log::warn!("Failed to serve fallback frame: {e}");
    }
    let _ = stream.shutdown(Shutdown::Both);
}

/// Fetch a parked frame: connect to the announced localhost port and read
/// exactly `length` bytes.
pub fn fetch(port: u16, length: usize, timeout: Duration) -> Result<Vec<u8>> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| Error::Transport(format!("fallback connect to {addr} failed: {e}")))?;
    stream.set_read_timeout(Some(timeout))?;

    let mut body = vec![0u8; length];
    stream
        .read_exact(&mut body)
        .map_err(|e| Error::Transport(format!("fallback read of {length} bytes failed: {e}")))?;
    Ok(body)
}
