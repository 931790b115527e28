//! Message codec for the datagram protocol
//!
//! # Wire Format
//!
//! Every message is a compact binary frame:
//!
//! ```text
//! ┌──────────────────┬──────────────────┬────────────────────┐
//! │ Kind (4 bytes)   │ Length (4 bytes) │ Payload (variable) │
//! │ Big-endian i32   │ Big-endian u32   │ UTF-8 string       │
//! └──────────────────┴──────────────────┴────────────────────┘
//! ```
//!
//! There is no version field; `MessageKind` values are append-only and act
//! as the version surface. Unknown kind values decode successfully (older
//! peers must not be crashed by broadcasts of newer kinds) and carry their
//! raw value so they re-encode unchanged.
//!
//! The sender's network endpoint is attached by the transport after decode;
//! the codec itself never sees it.

use crate::error::{Error, Result};
use std::net::SocketAddr;

/// Minimum frame size: kind (4) + payload length (4).
pub const MIN_FRAME_SIZE: usize = 8;

/// Maximum accepted payload length. Protects against unbounded allocation
/// from malformed length fields on the streamed fallback path.
pub const MAX_PAYLOAD_SIZE: u32 = 8 * 1024 * 1024;

/// Largest frame a well-formed peer can produce. Announced fallback lengths
/// above this are rejected before any buffer is allocated.
pub const MAX_FRAME_SIZE: usize = MIN_FRAME_SIZE + MAX_PAYLOAD_SIZE as usize;

/// Closed, versioned message kind enumeration. Values are append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Liveness probe from a client
    Ping,
    /// Liveness reply
    Pong,
    /// Enter play mode
    Play,
    /// Pause play mode
    Pause,
    /// Resume from pause
    Unpause,
    /// Exit play mode
    Stop,
    /// Request an asset refresh (coalesced across requesters)
    Refresh,
    /// Forwarded info-level log line
    Info,
    /// Forwarded warning-level log line
    Warning,
    /// Forwarded error-level log line
    Error,
    /// Host version query/reply
    Version,
    /// Project path query/reply
    ProjectPath,
    /// Integration package name query/reply
    PackageName,
    /// Host began compiling
    CompilationStarted,
    /// Host finished compiling
    CompilationFinished,
    /// Play state broadcast, payload "true"/"false"
    PlayStateChanged,
    /// Request the test tree for a mode
    RetrieveTestList,
    /// Test tree reply, payload `"<mode>:<json>"`
    TestListRetrieved,
    /// Run tests, payload `"<mode>:<filter>"`
    ExecuteTests,
    /// Test run began
    RunStarted,
    /// Single test began
    TestStarted,
    /// Single test finished
    TestFinished,
    /// Test run finished
    RunFinished,
    /// Endpoint came online
    Online,
    /// Endpoint is going away
    Offline,
    /// Streaming-fallback control frame, payload `"<port>:<length>"`.
    /// Consumed by the transport, never delivered to the dispatch loop.
    Tcp,
    /// Kind value from a newer peer; routed to a no-op handler
    Unknown(i32),
}

impl MessageKind {
    /// Wire value for this kind.
    pub fn to_wire(self) -> i32 {
        match self {
            MessageKind::Ping => 0,
            MessageKind::Pong => 1,
            MessageKind::Play => 2,
            MessageKind::Pause => 3,
            MessageKind::Unpause => 4,
            MessageKind::Stop => 5,
            MessageKind::Refresh => 6,
            MessageKind::Info => 7,
            MessageKind::Warning => 8,
            MessageKind::Error => 9,
            MessageKind::Version => 10,
            MessageKind::ProjectPath => 11,
            MessageKind::PackageName => 12,
            MessageKind::CompilationStarted => 13,
            MessageKind::CompilationFinished => 14,
            MessageKind::PlayStateChanged => 15,
            MessageKind::RetrieveTestList => 16,
            MessageKind::TestListRetrieved => 17,
            MessageKind::ExecuteTests => 18,
            MessageKind::RunStarted => 19,
            MessageKind::TestStarted => 20,
            MessageKind::TestFinished => 21,
            MessageKind::RunFinished => 22,
            MessageKind::Online => 23,
            MessageKind::Offline => 24,
            MessageKind::Tcp => 25,
            MessageKind::Unknown(raw) => raw,
        }
    }

    /// Decode a wire value. Unrecognized values become `Unknown` so that
    /// frames from newer peers still decode.
    pub fn from_wire(raw: i32) -> Self {
        match raw {
            0 => MessageKind::Ping,
            1 => MessageKind::Pong,
            2 => MessageKind::Play,
            3 => MessageKind::Pause,
            4 => MessageKind::Unpause,
            5 => MessageKind::Stop,
            6 => MessageKind::Refresh,
            7 => MessageKind::Info,
            8 => MessageKind::Warning,
            9 => MessageKind::Error,
            10 => MessageKind::Version,
            11 => MessageKind::ProjectPath,
            12 => MessageKind::PackageName,
            13 => MessageKind::CompilationStarted,
            14 => MessageKind::CompilationFinished,
            15 => MessageKind::PlayStateChanged,
            16 => MessageKind::RetrieveTestList,
            17 => MessageKind::TestListRetrieved,
            18 => MessageKind::ExecuteTests,
            19 => MessageKind::RunStarted,
            20 => MessageKind::TestStarted,
            21 => MessageKind::TestFinished,
            22 => MessageKind::RunFinished,
            23 => MessageKind::Online,
            24 => MessageKind::Offline,
            25 => MessageKind::Tcp,
            other => MessageKind::Unknown(other),
        }
    }
}

/// A single protocol message.
///
/// `origin` is assigned by the transport when the frame arrives and is never
/// serialized. Every message handed to the dispatch loop has `Some` origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: String,
    pub origin: Option<SocketAddr>,
}

impl Message {
    /// Create an outbound message (no origin).
    pub fn new(kind: MessageKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            origin: None,
        }
    }
}

/// Encode a message to a wire frame.
pub fn encode(msg: &Message) -> Vec<u8> {
    let payload = msg.payload.as_bytes();
    let mut frame = Vec::with_capacity(MIN_FRAME_SIZE + payload.len());
    frame.extend_from_slice(&msg.kind.to_wire().to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Decode a wire frame. The returned message has no origin; the transport
/// attaches one before queueing.
///
/// Malformed frames (short buffer, truncated payload, length field larger
/// than the buffer, invalid UTF-8) are `Error::Decode` - callers drop the
/// message and continue.
pub fn decode(buf: &[u8]) -> Result<Message> {
    if buf.len() < MIN_FRAME_SIZE {
        return Err(Error::Decode(format!(
            "frame too short: {} bytes (min {MIN_FRAME_SIZE})",
            buf.len()
        )));
    }

    let kind_raw = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

    if len > MAX_PAYLOAD_SIZE {
        return Err(Error::Decode(format!(
            "payload length {len} exceeds limit {MAX_PAYLOAD_SIZE}"
        )));
    }

    let body = &buf[MIN_FRAME_SIZE..];
    if body.len() < len as usize {
        return Err(Error::Decode(format!(
            "truncated payload: have {} bytes, length field says {len}",
            body.len()
        )));
    }

    let payload = std::str::from_utf8(&body[..len as usize])
        .map_err(|e| Error::Decode(format!("payload is not UTF-8: {e}")))?
        .to_string();

    Ok(Message {
        kind: MessageKind::from_wire(kind_raw),
        payload,
        origin: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: [MessageKind; 26] = [
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Play,
        MessageKind::Pause,
        MessageKind::Unpause,
        MessageKind::Stop,
        MessageKind::Refresh,
        MessageKind::Info,
        MessageKind::Warning,
        MessageKind::Error,
        MessageKind::Version,
        MessageKind::ProjectPath,
        MessageKind::PackageName,
        MessageKind::CompilationStarted,
        MessageKind::CompilationFinished,
        MessageKind::PlayStateChanged,
        MessageKind::RetrieveTestList,
        MessageKind::TestListRetrieved,
        MessageKind::ExecuteTests,
        MessageKind::RunStarted,
        MessageKind::TestStarted,
        MessageKind::TestFinished,
        MessageKind::RunFinished,
        MessageKind::Online,
        MessageKind::Offline,
        MessageKind::Tcp,
    ];

    #[test]
    fn roundtrip_all_kinds() {
        for kind in ALL_KINDS {
            let msg = Message::new(kind, "payload");
            let decoded = decode(&encode(&msg)).unwrap();
            assert_eq!(decoded, msg, "kind {kind:?} did not round-trip");
        }
    }

    #[test]
    fn roundtrip_empty_payload() {
        let msg = Message::new(MessageKind::Ping, "");
        let decoded = decode(&encode(&msg)).unwrap();
        assert_eq!(decoded.payload, "");
        assert_eq!(decoded.kind, MessageKind::Ping);
    }

    #[test]
    fn roundtrip_payload_with_delimiters() {
        // Payloads may legally contain the compound-grammar delimiter and
        // bytes that look like length prefixes.
        let tricky = "56123:8192:\u{0}\u{1}\u{2}\u{3}:more";
        let msg = Message::new(MessageKind::Tcp, tricky);
        let decoded = decode(&encode(&msg)).unwrap();
        assert_eq!(decoded.payload, tricky);
    }

    #[test]
    fn roundtrip_multibyte_utf8() {
        let msg = Message::new(MessageKind::Info, "компиляция 完了 ✓");
        let decoded = decode(&encode(&msg)).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn unknown_kind_decodes() {
        let mut frame = encode(&Message::new(MessageKind::Ping, "future"));
        // Patch in a kind value from a hypothetical newer peer.
        frame[..4].copy_from_slice(&9999i32.to_be_bytes());
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.kind, MessageKind::Unknown(9999));
        assert_eq!(decoded.payload, "future");
    }

    #[test]
    fn unknown_kind_reencodes_to_same_value() {
        let msg = Message::new(MessageKind::Unknown(4242), "x");
        let frame = encode(&msg);
        assert_eq!(decode(&frame).unwrap().kind, MessageKind::Unknown(4242));
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[0, 0, 0]).is_err());
        assert!(decode(&[0, 0, 0, 1, 0, 0, 0]).is_err());
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut frame = encode(&Message::new(MessageKind::Info, "hello world"));
        frame.truncate(frame.len() - 4);
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn rejects_oversized_length_field() {
        let mut frame = vec![0, 0, 0, 0];
        frame.extend_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn rejects_invalid_utf8() {
        let mut frame = vec![0, 0, 0, 7]; // Info
        frame.extend_from_slice(&2u32.to_be_bytes());
        frame.extend_from_slice(&[0xFF, 0xFE]);
        assert!(decode(&frame).is_err());
    }

    #[test]
    fn origin_is_not_serialized() {
        let mut msg = Message::new(MessageKind::Pong, "data");
        msg.origin = Some("127.0.0.1:9999".parse().unwrap());
        let decoded = decode(&encode(&msg)).unwrap();
        assert_eq!(decoded.origin, None);
    }

    #[test]
    fn trailing_bytes_after_payload_are_ignored() {
        // A datagram buffer may be larger than the frame it carries.
        let mut frame = encode(&Message::new(MessageKind::Pong, "ok"));
        frame.extend_from_slice(&[0u8; 16]);
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.payload, "ok");
    }
}
