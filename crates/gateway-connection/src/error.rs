//! Error types of the gateway connection core.

use tradfri_protocol::{Code, DeviceId};

/// Errors from opening a secure session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    /// The gateway refused the identity/key pair during the handshake.
    #[error("gateway rejected the credential")]
    AuthRejected,

    #[error("handshake timed out")]
    Timeout,
}

/// Errors from an exchange on an open session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("gateway answered {0}")]
    Status(Code),

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("request queue full")]
    QueueFull,

    #[error("not connected to the gateway")]
    NotConnected,
}

/// Errors from a device command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The exchange could not complete.
    #[error(transparent)]
    Transport(#[from] SessionError),

    /// The gateway, or the local capability check, refused the command.
    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
}

/// Errors from exchanging a security code for a credential.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    /// Malformed code, or the gateway refused it during the handshake.
    #[error("invalid security code: {0}")]
    InvalidCode(String),

    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    #[error("pairing timed out")]
    Timeout,

    #[error("gateway refused the pairing request ({0})")]
    Rejected(Code),

    #[error("unexpected pairing reply: {0}")]
    Protocol(String),
}

/// Errors from the credential file.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid key encoding: {0}")]
    Key(#[from] base64::DecodeError),
}
