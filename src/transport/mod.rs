//! Transport layer: the streamer contract and its SSH, telnet, and mock
//! implementations.
//!
//! A [`Streamer`] is an authenticated byte-duplex connection to a device.
//! The expect engine drives it through `read_chunk`/`write_all`; everything
//! protocol-specific (key exchange, telnet option negotiation, in-band
//! login) stays behind `connect`.

pub mod config;
pub mod mock;
mod sftp;
pub(crate) mod ssh;
mod telnet;
mod trace;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::error::{Result, TransportError};

pub use config::{
    AlgorithmSuite, Endpoint, HostKeyVerification, Network, SshConfig, TelnetConfig,
    TerminalSettings,
};
pub use ssh::SshStreamer;
pub use telnet::TelnetStreamer;
pub use trace::{trace_to_writer, TraceDirection, TraceSink};

/// Byte stream usable as a transport substrate (a TCP/Unix socket, a
/// forwarded tunnel connection, a child process's stdio pair).
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

impl std::fmt::Debug for dyn Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Conn")
    }
}

/// Owned, boxed connection handed out by dialers.
pub type BoxConn = Box<dyn Conn>;

/// Connection factory. Implemented by plain TCP/Unix dialing and by
/// [`Tunnel`](crate::tunnel::Tunnel) for jump-host forwarding.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: Network, addr: &str) -> Result<BoxConn>;
}

/// Direct dialer: TCP or Unix sockets, no intermediary.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, network: Network, addr: &str) -> Result<BoxConn> {
        match network {
            Network::Tcp => {
                let stream = TcpStream::connect(addr).await.map_err(|source| {
                    TransportError::Unreachable {
                        endpoint: addr.to_string(),
                        source,
                    }
                })?;
                stream.set_nodelay(true).ok();
                Ok(Box::new(stream) as BoxConn)
            }
            Network::Unix => {
                let stream = UnixStream::connect(addr).await.map_err(|source| {
                    TransportError::Unreachable {
                        endpoint: addr.to_string(),
                        source,
                    }
                })?;
                Ok(Box::new(stream) as BoxConn)
            }
            Network::StreamPipe => Err(TransportError::NotSupported {
                operation: "dial streampipe",
            }
            .into()),
        }
    }
}

/// An authenticated byte-duplex connection to a device.
///
/// Implementations: [`SshStreamer`], [`TelnetStreamer`], and
/// [`mock::MockStreamer`] for tests. The contract is genuinely polymorphic -
/// sessions hold `Box<dyn Streamer>`.
///
/// Cancellation: every method is a plain future; callers wrap calls in
/// `tokio::select!` against their cancellation token (the expect engine does
/// this for reads). Implementations must keep each await point cancel-safe.
#[async_trait]
pub trait Streamer: Send {
    /// Open and authenticate the connection to the endpoint.
    async fn connect(&mut self) -> Result<()>;

    /// Read the next chunk of session bytes.
    ///
    /// Blocks until data is available. Never returns an empty chunk: end of
    /// stream is [`TransportError::Closed`].
    async fn read_chunk(&mut self) -> Result<Vec<u8>>;

    /// Write all of `data`. Short writes are errors.
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Close the connection. Idempotent.
    async fn close(&mut self) -> Result<()>;

    /// Fetch remote files. SSH only.
    async fn download(&mut self, paths: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        let _ = paths;
        Err(TransportError::NotSupported {
            operation: "download",
        }
        .into())
    }

    /// Store remote files. SSH only.
    async fn upload(&mut self, files: &HashMap<String, Vec<u8>>) -> Result<()> {
        let _ = files;
        Err(TransportError::NotSupported { operation: "upload" }.into())
    }

    /// Install a byte-level trace sink. Replaces any previous sink.
    fn set_trace(&mut self, sink: TraceSink);
}
