//! Error taxonomy for the transport and the roles riding on it.
//!
//! Transport-fatal conditions (`TransportError`) tear the connection down.
//! Per-operation failures never appear here: they travel inside the control
//! protocol (spawn-failure exit status, file-push error string) and reach
//! the caller through its handler.

use std::io;

/// Fatal conditions for one transport connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer sent a preamble that is not ours.
    #[error("preamble mismatch: peer sent {0:02x?}")]
    PreambleMismatch([u8; 9]),

    /// The peer did not complete the preamble exchange in time.
    #[error("timed out waiting for peer preamble")]
    ConnectTimeout,

    /// Read or write failure on the physical pipe.
    #[error("pipe error: {0}")]
    Io(#[from] io::Error),

    /// The peer and we no longer agree on the protocol state. Unknown
    /// correlation ids and undecodable control payloads land here.
    #[error("protocol desync: {0}")]
    Desync(String),

    /// The transport was shut down while the operation was in flight.
    #[error("transport closed")]
    Closed,
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        TransportError::Desync(err.to_string())
    }
}

/// Write attempted on a channel whose stream has ended.
#[derive(Debug, thiserror::Error)]
#[error("channel closed")]
pub struct ChannelClosed;

/// Channel registry failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("channel id {0} already registered")]
    Duplicate(i64),
}

/// Control-message decode failures.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown command tag {0}")]
    UnknownTag(i32),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("control payload truncated mid-message")]
    Truncated,

    #[error("field exceeds its 16-bit length prefix")]
    FieldTooLong,
}

/// Failures surfaced at the orchestration boundary.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The executor reported a file-push failure.
    #[error("file push to {path} failed: {message}")]
    Push { path: String, message: String },

    /// The remote process could not be started; its stderr channel
    /// carries the reason.
    #[error("remote process could not be started")]
    SpawnFailed,

    /// The connection died before the operation's response arrived.
    #[error("connection lost before the operation completed")]
    ConnectionLost,
}
