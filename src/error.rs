//! The crate-wide error and result types.

use std::fmt;

use tokio::sync::mpsc::error::SendError;

/// The crate-wide result type, using [`Error`] as the default error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The errors that may occur in the engine.
///
/// Network and protocol errors are localized to the peer session that
/// produced them and are not propagated further up than the swarm manager,
/// which logs them and decides whether to reconnect. Storage errors
/// escalate to the owning torrent's status. Descriptor and magnet errors
/// propagate directly to the caller of the engine's `add_*` methods.
#[derive(Debug)]
pub enum Error {
    /// A magnet URL was missing `xt=urn:btih:`, used a namespace other than
    /// `btih`, or was otherwise not a valid `magnet:?` URL.
    MalformedMagnet,
    /// A descriptor failed its internal consistency checks (piece count,
    /// piece hash count, file length sum).
    DescriptorInvalid(String),
    /// The tracker could not be reached (connection refused, timed out, DNS
    /// failure, non-200 status).
    TrackerUnavailable(String),
    /// The tracker responded but rejected the request (`failure_reason` was
    /// set, or the response body could not be parsed as the expected JSON
    /// shape).
    TrackerRejected(String),
    /// The peer handshake failed: a socket error occurred, the deadline
    /// elapsed, or the peer's protocol string or info hash didn't match.
    HandshakeError,
    /// The info hash advertised by a peer does not match the torrent we're
    /// downloading.
    InvalidPeerInfoHash,
    /// A message from a peer did not conform to the wire protocol: an
    /// invalid length, an unknown message id with a non-empty body, an
    /// oversized frame, or a malformed fixed-size body.
    Protocol(String),
    /// A frame or block exceeded a hard size limit (2 MiB frames, 128 KiB
    /// blocks).
    CapacityExceeded,
    /// The peer's TCP connection was closed or reset.
    ConnectionLost,
    /// A per-request or per-session deadline elapsed.
    SessionTimeout,
    /// A downloaded piece's SHA-1 digest didn't match the expected hash.
    HashMismatch,
    /// A piece or block index/offset/length was out of bounds for the
    /// torrent's storage layout.
    InvalidPieceIndex,
    /// The torrent referenced by an operation is not known to the engine.
    InvalidTorrentId,
    /// An I/O error occurred while reading or writing piece storage.
    Io(std::io::Error),
    /// A channel used internally for event fan-out was closed unexpectedly.
    ChannelClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedMagnet => write!(f, "malformed magnet url"),
            Self::DescriptorInvalid(reason) => {
                write!(f, "invalid descriptor: {}", reason)
            }
            Self::TrackerUnavailable(reason) => {
                write!(f, "tracker unavailable: {}", reason)
            }
            Self::TrackerRejected(reason) => {
                write!(f, "tracker rejected request: {}", reason)
            }
            Self::HandshakeError => write!(f, "peer handshake failed"),
            Self::InvalidPeerInfoHash => {
                write!(f, "peer advertised invalid info hash")
            }
            Self::Protocol(reason) => write!(f, "protocol error: {}", reason),
            Self::CapacityExceeded => {
                write!(f, "frame or block exceeded size limit")
            }
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::SessionTimeout => write!(f, "session timed out"),
            Self::HashMismatch => write!(f, "piece hash mismatch"),
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::ChannelClosed => write!(f, "internal channel closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl<T> From<SendError<T>> for Error {
    fn from(_: SendError<T>) -> Self {
        Self::ChannelClosed
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::DescriptorInvalid(e.to_string())
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::DescriptorInvalid(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::TrackerUnavailable(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_is_chained_as_source() {
        let io_err =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = Error::from(io_err);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn non_io_variants_have_no_source() {
        assert!(std::error::Error::source(&Error::HashMismatch).is_none());
    }
}
