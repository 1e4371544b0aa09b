// src/error.rs

use std::fmt;
use std::io;

/// Convenience alias for bus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by bus operations.
///
/// Call-site errors are returned to the local caller. Protocol errors seen by
/// a read loop terminate that read loop, which is the sole signal of peer
/// loss; they never surface through this type directly.
#[derive(Debug)]
pub enum Error {
    /// Operation invoked after the local endpoint was shut down.
    SocketClosed,

    /// No local object and no remote reservation answers for the path.
    PathNotFound(String),

    /// The peer reported that nothing is published at the path.
    ObjectNotFound(String),

    /// The method is missing, or exists but is not externally visible.
    MethodNotFound {
        /// Name the caller asked for.
        name: String,
        /// Whether the name exists as a private method.
        private: bool,
    },

    /// The callee raised while running the method.
    MethodError(String),

    /// A payload failed to encode or decode.
    Encoding(String),

    /// The stream failed, or ended in the middle of a frame.
    Transport(io::Error),

    /// Publish/unpublish collision: nothing is registered under the path.
    DuplicateRegistration(String),

    /// A proxy with no callable surface was published.
    NilTarget,

    /// The plugin already holds a live connection to the host.
    AlreadyConnected,

    /// The plugin id is not present in the host roster.
    NotRegistered(String),

    /// The peer answered a handshake round-trip with a non-OK result.
    HandshakeFailed(String),

    /// No response arrived within the caller's deadline.
    Timeout,
}

impl Error {
    pub(crate) fn encoding(message: impl fmt::Display) -> Self {
        Error::Encoding(message.to_string())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SocketClosed => write!(f, "socket is already closed"),
            Error::PathNotFound(path) => {
                write!(f, "there is no object in path '{}'", path)
            }
            Error::ObjectNotFound(path) => {
                write!(f, "peer has no object in path '{}'", path)
            }
            Error::MethodNotFound { name, private } => {
                if *private {
                    write!(f, "method '{}' is private", name)
                } else {
                    write!(f, "method '{}' is undefined", name)
                }
            }
            Error::MethodError(detail) => write!(f, "method call failed: {}", detail),
            Error::Encoding(detail) => write!(f, "encoding error: {}", detail),
            Error::Transport(err) => write!(f, "transport error: {}", err),
            Error::DuplicateRegistration(detail) => write!(f, "{}", detail),
            Error::NilTarget => write!(f, "can't register an object with no methods"),
            Error::AlreadyConnected => write!(f, "plugin is already connected to host"),
            Error::NotRegistered(id) => {
                write!(f, "plugin id '{}' is not registered", id)
            }
            Error::HandshakeFailed(detail) => write!(f, "{}", detail),
            Error::Timeout => write!(f, "no response arrived before the deadline"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Transport(err)
    }
}
