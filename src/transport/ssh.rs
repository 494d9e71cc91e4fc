//! SSH streamer implementation using russh.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, trace, warn};
use russh::client::{self, Handle, Msg};
use russh::keys::{decode_secret_key, load_secret_key, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Pty};

use super::config::{HostKeyVerification, SshConfig};
use super::sftp;
use super::trace::{self, TraceDirection, TraceSink};
use super::{BoxConn, Dialer, Streamer, TcpDialer};
use crate::credentials::{Credentials, PrivateKeySource};
use crate::error::{Result, TransportError};

/// SSH streamer: an authenticated shell channel over a russh client.
///
/// Authentication walks the credential set in order - agent (when a socket
/// is configured), then each private key, then each password - and stops at
/// the first method the server accepts.
pub struct SshStreamer {
    config: SshConfig,
    credentials: Credentials,
    dialer: Arc<dyn Dialer>,
    trace: Option<TraceSink>,
    state: Option<SshState>,
}

struct SshState {
    handle: Handle<SshHandler>,
    channel: Channel<Msg>,
}

impl SshStreamer {
    pub fn new(config: SshConfig, credentials: Credentials) -> Self {
        Self {
            config,
            credentials,
            dialer: Arc::new(TcpDialer),
            trace: None,
            state: None,
        }
    }

    /// Route the connection through `dialer` (typically a
    /// [`Tunnel`](crate::tunnel::Tunnel)).
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Open the interactive channel: PTY plus shell.
    async fn open_shell(&self, handle: &Handle<SshHandler>) -> Result<Channel<Msg>> {
        let channel = handle
            .channel_open_session()
            .await
            .map_err(TransportError::Ssh)?;

        let terminal = &self.config.terminal;
        let modes: &[(Pty, u32)] = if terminal.echo_off {
            &[(Pty::ECHO, 0)]
        } else {
            &[]
        };
        channel
            .request_pty(
                true,
                &terminal.term,
                terminal.width,
                terminal.height,
                0,
                0,
                modes,
            )
            .await
            .map_err(TransportError::Ssh)?;
        channel
            .request_shell(true)
            .await
            .map_err(TransportError::Ssh)?;
        Ok(channel)
    }

    fn state_mut(&mut self) -> Result<&mut SshState> {
        self.state
            .as_mut()
            .ok_or_else(|| TransportError::Closed.into())
    }
}

#[async_trait]
impl Streamer for SshStreamer {
    async fn connect(&mut self) -> Result<()> {
        let mut handle = open_client(&self.config, self.dialer.as_ref()).await?;
        authenticate(&mut handle, &self.credentials).await?;
        let channel = self.open_shell(&handle).await?;
        debug!("SSH session open to {}", self.config.endpoint);
        self.state = Some(SshState { handle, channel });
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<Vec<u8>> {
        let trace_sink = self.trace.clone();
        let state = self.state_mut()?;
        loop {
            match state.channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    trace::emit(&trace_sink, TraceDirection::Read, &data);
                    return Ok(data.to_vec());
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    trace::emit(&trace_sink, TraceDirection::Read, &data);
                    return Ok(data.to_vec());
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    return Err(TransportError::Closed.into());
                }
                Some(other) => {
                    trace!("ignoring channel message: {:?}", other);
                }
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let trace_sink = self.trace.clone();
        let state = self.state_mut()?;
        state
            .channel
            .data(data)
            .await
            .map_err(|_| TransportError::Closed)?;
        trace::emit(&trace_sink, TraceDirection::Write, data);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(state) = self.state.take() {
            let _ = state.channel.eof().await;
            let _ = state.channel.close().await;
            if let Err(err) = state
                .handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await
            {
                debug!("disconnect reported: {}", err);
            }
        }
        Ok(())
    }

    async fn download(&mut self, paths: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        let state = self.state_mut()?;
        sftp::download(&state.handle, paths).await
    }

    async fn upload(&mut self, files: &HashMap<String, Vec<u8>>) -> Result<()> {
        let state = self.state_mut()?;
        sftp::upload(&state.handle, files).await
    }

    fn set_trace(&mut self, sink: TraceSink) {
        self.trace = Some(sink);
    }
}

/// Establish the TCP/stream connection and run key exchange.
///
/// Shared between [`SshStreamer`] and [`Tunnel`](crate::tunnel::Tunnel) -
/// a jump connection is the same client, it just never opens a shell.
pub(crate) async fn open_client(
    config: &SshConfig,
    dialer: &dyn Dialer,
) -> Result<Handle<SshHandler>> {
    let endpoint = &config.endpoint;
    let stream: BoxConn = dialer.dial(endpoint.network(), &endpoint.addr()).await?;

    let mut ssh_config = client::Config {
        inactivity_timeout: config.inactivity_timeout,
        keepalive_interval: config.keepalive_interval,
        keepalive_max: config.keepalive_max,
        ..Default::default()
    };
    if let Some(ref suite) = config.algorithms {
        ssh_config.preferred = suite.to_preferred();
    }

    let host_key_error: Arc<Mutex<Option<TransportError>>> = Arc::new(Mutex::new(None));
    let handler = SshHandler {
        host: endpoint.host().to_string(),
        port: endpoint.port(),
        verification: config.host_key_verification.clone(),
        known_hosts_path: config.known_hosts_path.clone(),
        host_key_error: host_key_error.clone(),
    };

    let handle = tokio::time::timeout(
        config.connect_timeout,
        client::connect_stream(Arc::new(ssh_config), stream, handler),
    )
    .await
    .map_err(|_| TransportError::ConnectTimeout(config.connect_timeout))?
    .map_err(|err| {
        // Prefer the detailed host-key error stored by check_server_key
        // over russh's generic UnknownKey.
        match host_key_error.lock().unwrap().take() {
            Some(hk_err) => hk_err,
            None => TransportError::Ssh(err),
        }
    })?;

    Ok(handle)
}

/// Walk the credential ladder until the server accepts something: agent,
/// then each private key, then each password, per username in order.
pub(crate) async fn authenticate(
    handle: &mut Handle<SshHandler>,
    credentials: &Credentials,
) -> Result<()> {
    let usernames = credentials.usernames();
    if usernames.is_empty() {
        return Err(TransportError::AuthenticationFailed {
            user: String::new(),
        }
        .into());
    }

    for user in usernames {
        if let Some(socket) = credentials.agent_socket() {
            if try_agent(handle, user, socket).await? {
                debug!("authenticated {:?} via agent", user);
                return Ok(());
            }
        }
        for key in credentials.private_keys() {
            if try_key(handle, user, key, credentials.passphrase()).await? {
                debug!("authenticated {:?} via private key", user);
                return Ok(());
            }
        }
        for password in credentials.passwords() {
            let accepted = handle
                .authenticate_password(user, password)
                .await
                .map_err(TransportError::Ssh)?
                .success();
            if accepted {
                debug!("authenticated {:?} via password", user);
                return Ok(());
            }
        }
    }

    Err(TransportError::AuthenticationFailed {
        user: usernames.last().cloned().unwrap_or_default(),
    }
    .into())
}

#[cfg(unix)]
async fn try_agent(
    handle: &mut Handle<SshHandler>,
    user: &str,
    socket: &PathBuf,
) -> Result<bool> {
    use russh::keys::agent::client::AgentClient;

    let mut agent = match AgentClient::connect_uds(socket).await {
        Ok(agent) => agent,
        Err(err) => {
            warn!("SSH agent at {} unavailable: {}", socket.display(), err);
            return Ok(false);
        }
    };
    let identities = match agent.request_identities().await {
        Ok(identities) => identities,
        Err(err) => {
            warn!("SSH agent identity listing failed: {}", err);
            return Ok(false);
        }
    };

    for identity in identities {
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .map_err(TransportError::Ssh)?
            .flatten();
        match handle
            .authenticate_publickey_with(user, identity, hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => {}
            Err(err) => debug!("agent identity rejected for {:?}: {}", user, err),
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn try_agent(
    _handle: &mut Handle<SshHandler>,
    _user: &str,
    _socket: &PathBuf,
) -> Result<bool> {
    warn!("SSH agent authentication is unix-only");
    Ok(false)
}

async fn try_key(
    handle: &mut Handle<SshHandler>,
    user: &str,
    source: &PrivateKeySource,
    passphrase: Option<&str>,
) -> Result<bool> {
    let key = match source {
        PrivateKeySource::Pem(pem) => decode_secret_key(pem, passphrase),
        PrivateKeySource::File(path) => load_secret_key(path, passphrase),
    };
    let key = match key {
        Ok(key) => key,
        Err(err) => {
            warn!("skipping unloadable private key: {}", err);
            return Ok(false);
        }
    };

    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .map_err(TransportError::Ssh)?
        .flatten();
    let accepted = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await
        .map_err(TransportError::Ssh)?
        .success();
    Ok(accepted)
}

/// russh client handler implementing host-key policy.
pub(crate) struct SshHandler {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) verification: HostKeyVerification,
    pub(crate) known_hosts_path: Option<PathBuf>,
    /// Detailed host-key failure, surfaced by connect in place of russh's
    /// generic UnknownKey.
    pub(crate) host_key_error: Arc<Mutex<Option<TransportError>>>,
}

impl SshHandler {
    /// `Ok(true)` when the key is on record, `Ok(false)` when the host is
    /// unknown, `Err(HostKeyChanged)` when the recorded key differs.
    fn check_known_hosts(&self, key: &PublicKey) -> std::result::Result<bool, TransportError> {
        let result = if let Some(ref path) = self.known_hosts_path {
            russh::keys::check_known_hosts_path(&self.host, self.port, key, path)
        } else {
            russh::keys::check_known_hosts(&self.host, self.port, key)
        };
        match result {
            Ok(found) => Ok(found),
            Err(russh::keys::Error::KeyChanged { line }) => Err(TransportError::HostKeyChanged {
                host: self.host.clone(),
                port: self.port,
                line,
            }),
            Err(err) => Err(TransportError::KnownHosts(err.to_string())),
        }
    }

    fn learn_host_key(&self, key: &PublicKey) -> std::result::Result<(), TransportError> {
        let result = if let Some(ref path) = self.known_hosts_path {
            russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, key, path)
        } else {
            russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, key)
        };
        result.map_err(|err| TransportError::KnownHosts(err.to_string()))
    }

    fn reject(&self, err: TransportError) -> bool {
        *self.host_key_error.lock().unwrap() = Some(err);
        false
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.verification {
            HostKeyVerification::Disabled => Ok(true),
            HostKeyVerification::AcceptNew => match self.check_known_hosts(server_public_key) {
                Ok(true) => Ok(true),
                Ok(false) => {
                    if let Err(err) = self.learn_host_key(server_public_key) {
                        warn!("could not record host key: {}", err);
                    }
                    Ok(true)
                }
                Err(err) => Ok(self.reject(err)),
            },
            HostKeyVerification::Strict => match self.check_known_hosts(server_public_key) {
                Ok(true) => Ok(true),
                Ok(false) => Ok(self.reject(TransportError::HostKeyUnknown {
                    host: self.host.clone(),
                    port: self.port,
                })),
                Err(err) => Ok(self.reject(err)),
            },
        }
    }
}
