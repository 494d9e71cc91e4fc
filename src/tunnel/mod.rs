//! Jump-host tunneling: one SSH connection fanned out into many forwarded
//! device connections.
//!
//! Two modes. Direct mode opens its own SSH client to the jump endpoint and
//! forwards through `direct-tcpip` channels. Control-master mode reuses a
//! preauthenticated OpenSSH multiplex socket by spawning `ssh -W` children.
//! Either way, [`Tunnel`] implements [`Dialer`], so device streamers route
//! through it transparently.

mod control;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::debug;
use russh::client::Handle;
use tokio::sync::Mutex;

use crate::credentials::Credentials;
use crate::error::{Result, TransportError, TunnelError};
use crate::transport::ssh::{authenticate, open_client, SshHandler};
use crate::transport::{BoxConn, Dialer, Network, SshConfig, TcpDialer, TraceSink};

pub use control::ControlMasterStream;

/// Buffer size per direction of a forwarded connection. Bounded on purpose:
/// when one peer stalls, the copier suspends instead of buffering the world.
const FORWARD_BUFFER: usize = 64 * 1024;

enum TunnelState {
    Idle,
    /// Own SSH client to the jump host.
    Direct(Handle<SshHandler>),
    /// Reusing an external control-master socket.
    Control,
    Closed,
}

/// A jump connection through which device sessions are opened.
///
/// `connect` once, then `dial_remote` from any number of tasks. `close` is
/// terminal: the open flag never flips back.
pub struct Tunnel {
    config: SshConfig,
    credentials: Credentials,
    control_socket: Option<PathBuf>,
    trace: Option<TraceSink>,
    state: Mutex<TunnelState>,
    is_open: AtomicBool,
}

impl Tunnel {
    /// Tunnel in direct mode: its own SSH client to `config.endpoint`.
    pub fn new(config: SshConfig, credentials: Credentials) -> Self {
        Self {
            config,
            credentials,
            control_socket: None,
            trace: None,
            state: Mutex::new(TunnelState::Idle),
            is_open: AtomicBool::new(false),
        }
    }

    /// Reuse the OpenSSH control-master socket at `path` instead of opening
    /// a new jump connection.
    pub fn with_control_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_socket = Some(path.into());
        self
    }

    /// Trace sink for the `ssh -W` children's stderr.
    pub fn with_trace(mut self, sink: TraceSink) -> Self {
        self.trace = Some(sink);
        self
    }

    /// Establish the jump connection. Guarded: concurrent calls serialize,
    /// and a second call on an open tunnel is a no-op.
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match *state {
            TunnelState::Closed => return Err(TunnelError::Closed.into()),
            TunnelState::Direct(_) | TunnelState::Control => {
                debug!("tunnel already connected");
                return Ok(());
            }
            TunnelState::Idle => {}
        }

        if self.control_socket.is_some() {
            // Children are spawned per forward; nothing to open up front.
            *state = TunnelState::Control;
        } else {
            let mut handle = open_client(&self.config, &TcpDialer).await?;
            authenticate(&mut handle, &self.credentials).await?;
            debug!("tunnel connected to {}", self.config.endpoint);
            *state = TunnelState::Direct(handle);
        }
        self.is_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    /// Open a forwarded connection to `addr` (`host:port`) at the far side
    /// of the jump. Safe to call concurrently after `connect`.
    pub async fn dial_remote(&self, network: Network, addr: &str) -> Result<BoxConn> {
        if network != Network::Tcp {
            return Err(TransportError::NotSupported {
                operation: "non-tcp forward",
            }
            .into());
        }
        let (host, port) = split_host_port(addr)?;

        let state = self.state.lock().await;
        match &*state {
            TunnelState::Idle => Err(TunnelError::NotConnected.into()),
            TunnelState::Closed => Err(TunnelError::Closed.into()),
            TunnelState::Control => {
                let socket = self
                    .control_socket
                    .as_ref()
                    .expect("control state implies a socket");
                let jump = match self.credentials.primary_username() {
                    "" => self.config.endpoint.host().to_string(),
                    user => format!("{}@{}", user, self.config.endpoint.host()),
                };
                let stream = ControlMasterStream::spawn(
                    socket,
                    &jump,
                    &host,
                    port,
                    self.trace.clone(),
                )?;
                Ok(Box::new(stream) as BoxConn)
            }
            TunnelState::Direct(handle) => {
                let channel = handle
                    .channel_open_direct_tcpip(&host, u32::from(port), "127.0.0.1", 0)
                    .await
                    .map_err(TunnelError::Ssh)?;
                debug!("tunnel forward started to {}", addr);

                // Bounded pair: the handed-out end is an ordinary stream,
                // and a stalled peer backpressures the copier.
                let (local, bridge) = tokio::io::duplex(FORWARD_BUFFER);
                let label = addr.to_string();
                tokio::spawn(async move {
                    let mut channel_stream = channel.into_stream();
                    let mut bridge = bridge;
                    match tokio::io::copy_bidirectional(&mut channel_stream, &mut bridge).await {
                        Ok((up, down)) => {
                            debug!("tunnel forward to {} done ({}B up, {}B down)", label, up, down)
                        }
                        Err(err) => debug!("tunnel forward to {} ended: {}", label, err),
                    }
                });
                Ok(Box::new(local) as BoxConn)
            }
        }
    }

    /// Tear down the jump connection. Terminal; forwarded connections
    /// already handed out live on until their own ends close.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        self.is_open.store(false, Ordering::SeqCst);
        match std::mem::replace(&mut *state, TunnelState::Closed) {
            TunnelState::Direct(handle) => {
                if let Err(err) = handle
                    .disconnect(russh::Disconnect::ByApplication, "", "en")
                    .await
                {
                    debug!("tunnel disconnect reported: {}", err);
                }
                debug!("tunnel closed");
            }
            TunnelState::Control => debug!("tunnel closed"),
            TunnelState::Idle | TunnelState::Closed => debug!("tunnel already closed"),
        }
    }
}

#[async_trait]
impl Dialer for Tunnel {
    async fn dial(&self, network: Network, addr: &str) -> Result<BoxConn> {
        self.dial_remote(network, addr).await
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| TunnelError::ControlMaster {
        message: format!("invalid forward address {:?}", addr),
    })?;
    let port = port.parse::<u16>().map_err(|_| TunnelError::ControlMaster {
        message: format!("invalid forward port {:?}", addr),
    })?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_host_port_accepts_host_colon_port() {
        assert_eq!(
            split_host_port("10.0.0.1:830").unwrap(),
            ("10.0.0.1".to_string(), 830)
        );
    }

    #[test]
    fn split_host_port_rejects_garbage() {
        assert!(split_host_port("no-port").is_err());
        assert!(split_host_port("host:notanumber").is_err());
    }

    #[tokio::test]
    async fn dial_before_connect_is_rejected() {
        let tunnel = Tunnel::new(
            SshConfig::host("jump.example"),
            Credentials::basic("jump", "pw"),
        );
        let err = tunnel.dial_remote(Network::Tcp, "10.0.0.1:22").await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Tunnel(TunnelError::NotConnected)
        ));
        assert!(!tunnel.is_connected());
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let tunnel = Tunnel::new(
            SshConfig::host("jump.example"),
            Credentials::basic("jump", "pw"),
        );
        tunnel.close().await;
        assert!(!tunnel.is_connected());
        let err = tunnel.connect().await.unwrap_err();
        assert!(matches!(err, crate::Error::Tunnel(TunnelError::Closed)));
        let err = tunnel.dial_remote(Network::Tcp, "10.0.0.1:22").await.unwrap_err();
        assert!(matches!(err, crate::Error::Tunnel(TunnelError::Closed)));
    }
}
