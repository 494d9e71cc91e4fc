//! Error types for netcli.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Main error type for netcli operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level errors (connect, auth, socket)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Channel/expect errors (pattern matching on the byte stream)
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Session-level errors (command execution, prompts, dialogs)
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Tunnel errors (jump host, forwarded connections)
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

impl Error {
    /// Whether this error is an expect/read timeout, at any nesting level.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Channel(ChannelError::ExpectTimeout { .. }) => true,
            Error::Transport(TransportError::ConnectTimeout(_)) => true,
            Error::Session(SessionError::Command { source, .. }) => source.is_timeout(),
            _ => false,
        }
    }

    /// Whether this error was caused by cancellation, at any nesting level.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Channel(ChannelError::Cancelled { .. }) => true,
            Error::Session(SessionError::Command { source, .. }) => source.is_cancelled(),
            _ => false,
        }
    }

    /// Whether the underlying transport is gone (closed or connection lost).
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Error::Transport(TransportError::Closed) => true,
            Error::Channel(ChannelError::ConnectionLost { .. }) => true,
            Error::Session(SessionError::Command { source, .. }) => source.is_connection_lost(),
            _ => false,
        }
    }

    /// Buffer snapshot captured at failure time, if the error carries one.
    pub fn buffer_snapshot(&self) -> Option<&[u8]> {
        match self {
            Error::Channel(ChannelError::ExpectTimeout { buffer, .. })
            | Error::Channel(ChannelError::Cancelled { buffer })
            | Error::Channel(ChannelError::ConnectionLost { buffer }) => Some(buffer.as_bytes()),
            Error::Session(SessionError::PromptNotFound { buffer }) => Some(buffer.as_bytes()),
            Error::Session(SessionError::Command { source, .. }) => source.buffer_snapshot(),
            _ => None,
        }
    }
}

/// Transport layer errors (connection, authentication, raw I/O).
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connect-level network failure
    #[error("Endpoint {endpoint} unreachable: {source}")]
    Unreachable {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Every credential was rejected. Not retriable with the same credentials.
    #[error("Authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// SSH protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Private key could not be loaded or decoded
    #[error("SSH key error: {0}")]
    Key(String),

    /// known_hosts lookup failed
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// Host key differs from the recorded one
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    HostKeyChanged { host: String, port: u16, line: usize },

    /// Host not present in known_hosts under strict checking
    #[error("No host key for {host}:{port} in known_hosts")]
    HostKeyUnknown { host: String, port: u16 },

    /// Transport was closed (by peer or by an earlier `close()`)
    #[error("Transport closed")]
    Closed,

    /// Connect did not complete within the configured timeout
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Operation not available on this transport (e.g. file transfer on telnet)
    #[error("Operation '{operation}' is not supported by this transport")]
    NotSupported { operation: &'static str },

    /// File transfer failure
    #[error("SFTP error: {0}")]
    Sftp(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Channel layer errors from the expect engine.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// No pattern matched before the deadline. Carries everything read so far.
    #[error("No pattern matched within {elapsed:?}; buffer: {buffer}")]
    ExpectTimeout {
        elapsed: Duration,
        buffer: BufferSnapshot,
    },

    /// The operation was cancelled by the caller's token.
    #[error("Cancelled; buffer: {buffer}")]
    Cancelled { buffer: BufferSnapshot },

    /// The transport closed mid-expect.
    #[error("Connection lost while waiting for a pattern; buffer: {buffer}")]
    ConnectionLost { buffer: BufferSnapshot },

    /// A pattern failed to compile
    #[error("Invalid regex pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Session layer errors (command execution and dialog handling).
#[derive(Error, Debug)]
pub enum SessionError {
    /// Session not connected - call connect() first
    #[error("Session not connected - call connect() first")]
    NotConnected,

    /// Session already connected
    #[error("Session already connected")]
    AlreadyConnected,

    /// The device prompt never appeared after login.
    #[error("Prompt not found; buffer: {buffer}")]
    PromptNotFound { buffer: BufferSnapshot },

    /// A question pattern matched but no answer was configured for it.
    #[error("No answer for device question: {question:?}")]
    UnansweredQuestion { question: String },

    /// A device error pattern matched and the caller opted into hard failures.
    #[error("Device reported an error ({pattern}): {output}")]
    DeviceError { pattern: String, output: String },

    /// Failure during a specific command, with the command attached for context.
    #[error("Command {command:?} failed: {source}")]
    Command {
        command: String,
        #[source]
        source: Box<Error>,
    },
}

/// Tunnel errors.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Tunnel not connected - call connect() first
    #[error("Tunnel not connected - call connect() first")]
    NotConnected,

    /// Tunnel was closed; `close()` is terminal.
    #[error("Tunnel is closed")]
    Closed,

    /// The external control-master client failed.
    #[error("Control master failure: {message}")]
    ControlMaster { message: String },

    /// SSH failure on the jump connection
    #[error("SSH error on jump host: {0}")]
    Ssh(#[from] russh::Error),

    /// I/O error on a forwarded connection
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Bytes captured from the read buffer when an expect fails.
///
/// Displays as lossy UTF-8, truncated to keep log lines readable. The full
/// bytes stay available through [`as_bytes`](Self::as_bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSnapshot(Vec<u8>);

impl BufferSnapshot {
    const DISPLAY_LIMIT: usize = 256;

    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for BufferSnapshot {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for BufferSnapshot {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl std::fmt::Display for BufferSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = String::from_utf8_lossy(&self.0);
        if text.len() > Self::DISPLAY_LIMIT {
            // The interesting bytes (partial prompt, error text) are at the end.
            let tail_start = text.len() - Self::DISPLAY_LIMIT;
            let mut start = tail_start;
            while !text.is_char_boundary(start) {
                start += 1;
            }
            write!(f, "...{:?}", &text[start..])
        } else {
            write!(f, "{:?}", text)
        }
    }
}

/// Result type alias using netcli's Error.
pub type Result<T> = std::result::Result<T, Error>;
