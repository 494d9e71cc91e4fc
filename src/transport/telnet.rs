//! Telnet streamer: RFC 854/855 IAC framing, option negotiation, and
//! in-band login.
//!
//! The codec accepts suppress-go-ahead (both directions), server-side echo,
//! and terminal-type (offering the configured terminal on subnegotiation),
//! and refuses every other option. Negotiation bytes never reach the
//! session buffer; `IAC IAC` unescapes to a literal 0xFF.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, trace as log_trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::config::TelnetConfig;
use super::trace::{self, TraceDirection, TraceSink};
use super::{BoxConn, Dialer, Streamer, TcpDialer};
use crate::channel::{ExpectSet, ReadBuffer};
use crate::credentials::Credentials;
use crate::error::{ChannelError, Result, TransportError};

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;
const OPT_TTYPE: u8 = 24;

const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;

#[derive(Debug)]
enum DecodeState {
    Data,
    Iac,
    Negotiate(u8),
    Sub {
        option: Option<u8>,
        payload: Vec<u8>,
        iac: bool,
    },
}

/// Streaming IAC decoder plus the fixed negotiation policy.
#[derive(Debug)]
struct TelnetCodec {
    state: DecodeState,
    term: Vec<u8>,
}

impl TelnetCodec {
    fn new(term: &str) -> Self {
        Self {
            state: DecodeState::Data,
            term: term.as_bytes().to_vec(),
        }
    }

    /// Feed raw wire bytes; session data lands in `data`, protocol
    /// responses to send back land in `replies`.
    fn decode(&mut self, input: &[u8], data: &mut Vec<u8>, replies: &mut Vec<u8>) {
        for &byte in input {
            match &mut self.state {
                DecodeState::Data => {
                    if byte == IAC {
                        self.state = DecodeState::Iac;
                    } else {
                        data.push(byte);
                    }
                }
                DecodeState::Iac => match byte {
                    IAC => {
                        data.push(IAC);
                        self.state = DecodeState::Data;
                    }
                    DO | DONT | WILL | WONT => {
                        self.state = DecodeState::Negotiate(byte);
                    }
                    SB => {
                        self.state = DecodeState::Sub {
                            option: None,
                            payload: Vec::new(),
                            iac: false,
                        };
                    }
                    _ => {
                        // NOP, GA, and friends carry nothing for us.
                        self.state = DecodeState::Data;
                    }
                },
                DecodeState::Negotiate(command) => {
                    let command = *command;
                    self.negotiate(command, byte, replies);
                    self.state = DecodeState::Data;
                }
                DecodeState::Sub {
                    option,
                    payload,
                    iac,
                } => {
                    if *iac {
                        match byte {
                            SE => {
                                let option = *option;
                                let payload = std::mem::take(payload);
                                self.state = DecodeState::Data;
                                if let Some(option) = option {
                                    self.subnegotiate(option, &payload, replies);
                                }
                            }
                            IAC => {
                                payload.push(IAC);
                                *iac = false;
                            }
                            _ => {
                                // Malformed subnegotiation; bail back to data.
                                self.state = DecodeState::Data;
                            }
                        }
                    } else if byte == IAC {
                        *iac = true;
                    } else if option.is_none() {
                        *option = Some(byte);
                    } else {
                        payload.push(byte);
                    }
                }
            }
        }
    }

    fn negotiate(&mut self, command: u8, option: u8, replies: &mut Vec<u8>) {
        let reply = match (command, option) {
            // Server asks us to enable an option.
            (DO, OPT_SGA) | (DO, OPT_TTYPE) => WILL,
            (DO, _) => WONT,
            (DONT, _) => WONT,
            // Server announces an option on its side.
            (WILL, OPT_ECHO) | (WILL, OPT_SGA) => DO,
            (WILL, _) => DONT,
            (WONT, _) => DONT,
            _ => return,
        };
        log_trace!(
            "telnet negotiate: peer {} {} -> {} {}",
            command_name(command),
            option,
            command_name(reply),
            option
        );
        replies.extend_from_slice(&[IAC, reply, option]);
    }

    fn subnegotiate(&mut self, option: u8, payload: &[u8], replies: &mut Vec<u8>) {
        if option == OPT_TTYPE && payload.first() == Some(&TTYPE_SEND) {
            log_trace!("telnet: offering terminal type {:?}", String::from_utf8_lossy(&self.term));
            replies.extend_from_slice(&[IAC, SB, OPT_TTYPE, TTYPE_IS]);
            replies.extend_from_slice(&self.term);
            replies.extend_from_slice(&[IAC, SE]);
        }
    }
}

fn command_name(command: u8) -> &'static str {
    match command {
        DO => "DO",
        DONT => "DONT",
        WILL => "WILL",
        WONT => "WONT",
        _ => "?",
    }
}

/// Escape outgoing data: literal 0xFF doubles to `IAC IAC`.
fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        if byte == IAC {
            out.push(IAC);
        }
        out.push(byte);
    }
    out
}

/// Telnet streamer with in-band login.
///
/// `connect` performs the login dialog itself (login prompt, username,
/// password prompt, password) using the patterns in [`TelnetConfig`]; the
/// session layer then discovers the device prompt as with any transport.
pub struct TelnetStreamer {
    config: TelnetConfig,
    credentials: Credentials,
    dialer: Arc<dyn Dialer>,
    trace: Option<TraceSink>,
    conn: Option<BoxConn>,
    codec: TelnetCodec,
    /// Decoded bytes not yet handed to the session (login-dialog residue).
    pending: BytesMut,
}

impl TelnetStreamer {
    pub fn new(config: TelnetConfig, credentials: Credentials) -> Self {
        let codec = TelnetCodec::new(&config.terminal.term);
        Self {
            config,
            credentials,
            dialer: Arc::new(TcpDialer),
            trace: None,
            conn: None,
            codec,
            pending: BytesMut::new(),
        }
    }

    /// Route the connection through `dialer`.
    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Read and decode until session data appears. Negotiation-only
    /// segments are answered and skipped.
    async fn read_decoded(&mut self) -> Result<Vec<u8>> {
        loop {
            let conn = self
                .conn
                .as_mut()
                .ok_or(TransportError::Closed)?;
            let mut raw = [0u8; 4096];
            let n = conn.read(&mut raw).await.map_err(TransportError::Io)?;
            if n == 0 {
                return Err(TransportError::Closed.into());
            }
            trace::emit(&self.trace, TraceDirection::Read, &raw[..n]);

            let mut data = Vec::new();
            let mut replies = Vec::new();
            self.codec.decode(&raw[..n], &mut data, &mut replies);

            if !replies.is_empty() {
                let conn = self.conn.as_mut().ok_or(TransportError::Closed)?;
                conn.write_all(&replies).await.map_err(TransportError::Io)?;
                trace::emit(&self.trace, TraceDirection::Write, &replies);
            }
            if !data.is_empty() {
                return Ok(data);
            }
        }
    }

    /// Wait until `pattern` matches the decoded stream, consuming through
    /// the match.
    async fn login_expect(&mut self, pattern: &str, buf: &mut ReadBuffer) -> Result<()> {
        let set = ExpectSet::single("login", pattern)?;
        loop {
            if let Some(found) = buf.scan(&set) {
                buf.consume(found.end);
                return Ok(());
            }
            let window = self.config.login_timeout;
            let chunk = tokio::time::timeout(window, self.read_decoded())
                .await
                .map_err(|_| ChannelError::ExpectTimeout {
                    elapsed: window,
                    buffer: buf.pending().into(),
                })??;
            buf.append(&chunk);
        }
    }

    async fn write_raw(&mut self, data: &[u8], hidden: bool) -> Result<()> {
        let escaped = escape(data);
        let conn = self
            .conn
            .as_mut()
            .ok_or(TransportError::Closed)?;
        conn.write_all(&escaped).await.map_err(TransportError::Io)?;
        if hidden {
            trace::emit(&self.trace, TraceDirection::Write, b"<hidden>");
        } else {
            trace::emit(&self.trace, TraceDirection::Write, &escaped);
        }
        Ok(())
    }

    /// Expect the login prompt, send the username, expect the password
    /// prompt, send the password. Residual bytes (the device banner or an
    /// early prompt) stay queued for the session layer.
    async fn login(&mut self) -> Result<()> {
        let username = self.credentials.primary_username().to_string();
        if username.is_empty() {
            debug!("telnet: no username configured, skipping login dialog");
            return Ok(());
        }
        let password = self.credentials.primary_password().to_string();
        let login_pattern = self.config.login_prompt_pattern.clone();
        let password_pattern = self.config.password_prompt_pattern.clone();

        let mut buf = ReadBuffer::new();
        self.login_expect(&login_pattern, &mut buf).await?;
        self.write_raw(format!("{}\n", username).as_bytes(), false)
            .await?;

        if !password.is_empty() {
            self.login_expect(&password_pattern, &mut buf).await?;
            self.write_raw(format!("{}\n", password).as_bytes(), true)
                .await?;
        }

        // Anything already decoded past the last prompt belongs to the session.
        self.pending.extend_from_slice(buf.pending());
        debug!("telnet: login dialog complete");
        Ok(())
    }
}

#[async_trait]
impl Streamer for TelnetStreamer {
    async fn connect(&mut self) -> Result<()> {
        let endpoint = self.config.endpoint.clone();
        let conn = tokio::time::timeout(
            self.config.connect_timeout,
            self.dialer.dial(endpoint.network(), &endpoint.addr()),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout(self.config.connect_timeout))??;

        self.conn = Some(conn);
        debug!("telnet connected to {}", endpoint);
        self.login().await
    }

    async fn read_chunk(&mut self) -> Result<Vec<u8>> {
        if !self.pending.is_empty() {
            return Ok(self.pending.split().to_vec());
        }
        self.read_decoded().await
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.write_raw(data, false).await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.shutdown().await;
        }
        Ok(())
    }

    fn set_trace(&mut self, sink: TraceSink) {
        self.trace = Some(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut TelnetCodec, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut data = Vec::new();
        let mut replies = Vec::new();
        codec.decode(input, &mut data, &mut replies);
        (data, replies)
    }

    #[test]
    fn plain_data_passes_through() {
        let mut codec = TelnetCodec::new("xterm");
        let (data, replies) = decode_all(&mut codec, b"router> ");
        assert_eq!(data, b"router> ");
        assert!(replies.is_empty());
    }

    #[test]
    fn accepts_sga_and_ttype_requests() {
        let mut codec = TelnetCodec::new("xterm");
        let (_, replies) = decode_all(&mut codec, &[IAC, DO, OPT_SGA, IAC, DO, OPT_TTYPE]);
        assert_eq!(
            replies,
            vec![IAC, WILL, OPT_SGA, IAC, WILL, OPT_TTYPE]
        );
    }

    #[test]
    fn refuses_unknown_do_requests() {
        let mut codec = TelnetCodec::new("xterm");
        // 31 = NAWS, which this client does not implement.
        let (_, replies) = decode_all(&mut codec, &[IAC, DO, 31]);
        assert_eq!(replies, vec![IAC, WONT, 31]);
    }

    #[test]
    fn accepts_server_echo_and_sga() {
        let mut codec = TelnetCodec::new("xterm");
        let (_, replies) = decode_all(&mut codec, &[IAC, WILL, OPT_ECHO, IAC, WILL, OPT_SGA]);
        assert_eq!(replies, vec![IAC, DO, OPT_ECHO, IAC, DO, OPT_SGA]);
    }

    #[test]
    fn refuses_unknown_will_announcements() {
        let mut codec = TelnetCodec::new("xterm");
        let (_, replies) = decode_all(&mut codec, &[IAC, WILL, 32]);
        assert_eq!(replies, vec![IAC, DONT, 32]);
    }

    #[test]
    fn answers_terminal_type_subnegotiation() {
        let mut codec = TelnetCodec::new("xterm");
        let (_, replies) = decode_all(
            &mut codec,
            &[IAC, SB, OPT_TTYPE, TTYPE_SEND, IAC, SE],
        );
        let mut expected = vec![IAC, SB, OPT_TTYPE, TTYPE_IS];
        expected.extend_from_slice(b"xterm");
        expected.extend_from_slice(&[IAC, SE]);
        assert_eq!(replies, expected);
    }

    #[test]
    fn escaped_iac_becomes_literal() {
        let mut codec = TelnetCodec::new("xterm");
        let (data, replies) = decode_all(&mut codec, &[b'a', IAC, IAC, b'b']);
        assert_eq!(data, vec![b'a', IAC, b'b']);
        assert!(replies.is_empty());
    }

    #[test]
    fn negotiation_split_across_reads() {
        let mut codec = TelnetCodec::new("xterm");
        let (data, replies) = decode_all(&mut codec, &[b'x', IAC]);
        assert_eq!(data, b"x");
        assert!(replies.is_empty());
        let (data, replies) = decode_all(&mut codec, &[DO]);
        assert!(data.is_empty());
        assert!(replies.is_empty());
        let (data, replies) = decode_all(&mut codec, &[OPT_SGA, b'y']);
        assert_eq!(data, b"y");
        assert_eq!(replies, vec![IAC, WILL, OPT_SGA]);
    }

    #[test]
    fn write_escaping_doubles_iac() {
        assert_eq!(escape(&[1, IAC, 2]), vec![1, IAC, IAC, 2]);
        assert_eq!(escape(b"plain"), b"plain".to_vec());
    }
}
