// Crate-wide error taxonomy. See spec.md §7: nothing propagates across a
// connection boundary, so these are caught and logged at the handler/transport
// boundary rather than bubbled up to callers outside this crate.

use thiserror::Error;

/// Transport-level failures (§7: bind is fatal, dial/I/O is recoverable).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dial to {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dial to {addr} timed out")]
    DialTimeout { addr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out")]
    Timeout,
}

/// Wire-codec failures (§7: malformed JSON/base64/binary payload).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed envelope JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed base64 payload: {0}")]
    Base64(String),

    #[error("malformed binary payload: {0}")]
    BinaryPayload(&'static str),

    #[error("unknown action {0:?}")]
    UnknownAction(String),

    #[error("connection closed before a full frame was received")]
    Eof,
}

/// Everything that can go wrong reading or writing one envelope on a
/// connection: either the transport misbehaved or what arrived didn't decode.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Failures from driving the initiator side of the handshake in
/// [`crate::net::peer::Peer::add_peer`].
#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("peer closed the connection before completing the handshake")]
    ConnectionClosed,

    #[error("peer did not reply with PONG")]
    HandshakeFailed,
}
