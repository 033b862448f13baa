//! Error taxonomy for proxy sessions.
//!
//! Every variant is session-local: it terminates the connection handler that
//! produced it and nothing else.  The acceptor loop and the other workers keep
//! running.

use crate::handshake::Reply;
use std::net::SocketAddr;

/// Errors that can end a proxy session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The server was already at capacity when the connection was accepted.
    #[error("Active connections count reached capacity, refused connection {}", .peer.port())]
    AdmissionRejected { peer: SocketAddr },
    /// The client spoke a SOCKS version other than 4.
    #[error("Unsupported Socks protocol version (got {0:02x})")]
    UnsupportedVersion(u8),
    /// The client asked for something other than CONNECT.
    #[error("Unsupported Socks command (got {0:02x})")]
    UnsupportedCommand(u8),
    /// The destination did not accept the connection within the deadline.
    #[error("connect to {destination} timed out")]
    ConnectTimeout { destination: String },
    /// The destination refused or otherwise failed the connection.
    #[error("connect to {destination} failed: {source}")]
    ConnectFailed {
        destination: String,
        #[source]
        source: std::io::Error,
    },
    /// A SOCKS4A hostname could not be resolved.
    #[error("could not resolve {host}")]
    AddressResolutionFailure {
        host: String,
        #[source]
        source: Option<std::io::Error>,
    },
    /// A peer stayed idle past its read deadline.
    #[error("connection timed out")]
    ReadTimeout,
    /// Malformed handshake, header or chunk framing.
    #[error("protocol framing: {0}")]
    ProtocolFraming(String),
    /// Any other socket error.
    #[error("IO error: {0}")]
    Io(#[source] std::io::Error),
}

impl Error {
    /// The handshake reply owed to the client when this error ends a session.
    ///
    /// `None` means the connection is closed without writing anything.
    pub fn reply(&self) -> Option<Reply> {
        match self {
            Error::UnsupportedVersion(5)
            | Error::UnsupportedCommand(_)
            | Error::ConnectTimeout { .. }
            | Error::ConnectFailed { .. }
            | Error::AddressResolutionFailure { .. } => Some(Reply::Rejected),
            _ => None,
        }
    }

    pub(crate) fn framing(message: impl Into<String>) -> Self {
        Error::ProtocolFraming(message.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            // read deadlines surface as either kind depending on the platform
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Error::ReadTimeout,
            std::io::ErrorKind::UnexpectedEof => Error::framing("unexpected end of stream"),
            _ => Error::Io(e),
        }
    }
}
