//! Telnet transport driven end-to-end over an in-memory stream: option
//! negotiation, in-band login, prompt discovery, and a command.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use netcli::transport::{BoxConn, Dialer, Network, TelnetConfig};
use netcli::{Credentials, DeviceProfile, Result, Session, TelnetStreamer};

const IAC: u8 = 255;
const DO: u8 = 253;
const WILL: u8 = 251;
const OPT_ECHO: u8 = 1;
const OPT_TTYPE: u8 = 24;

/// Hands out a pre-built stream exactly once.
struct OneShotDialer(Mutex<Option<DuplexStream>>);

#[async_trait]
impl Dialer for OneShotDialer {
    async fn dial(&self, _network: Network, _addr: &str) -> Result<BoxConn> {
        let stream = self
            .0
            .lock()
            .unwrap()
            .take()
            .expect("dialer used more than once");
        Ok(Box::new(stream) as BoxConn)
    }
}

/// Scripted peer: send bytes, wait for expected bytes, record everything.
struct ScriptServer {
    stream: DuplexStream,
    seen: Vec<u8>,
    pos: usize,
}

impl ScriptServer {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            seen: Vec::new(),
            pos: 0,
        }
    }

    async fn send(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.unwrap();
    }

    /// Read until `needle` appears after the previous expectation.
    async fn expect(&mut self, needle: &[u8]) {
        loop {
            if let Some(at) = find(&self.seen[self.pos..], needle) {
                self.pos += at + needle.len();
                return;
            }
            let mut buf = [0u8; 256];
            let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("server read timed out")
                .unwrap();
            assert!(n > 0, "client closed before {:?}", String::from_utf8_lossy(needle));
            self.seen.extend_from_slice(&buf[..n]);
        }
    }
}

fn find(hay: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > hay.len() {
        return None;
    }
    hay.windows(needle.len()).position(|w| w == needle)
}

#[tokio::test]
async fn full_telnet_session() {
    let (client_end, server_end) = tokio::io::duplex(4096);
    let dialer = Arc::new(OneShotDialer(Mutex::new(Some(client_end))));

    let server = tokio::spawn(async move {
        let mut srv = ScriptServer::new(server_end);
        srv.send(&[IAC, DO, OPT_TTYPE, IAC, WILL, OPT_ECHO]).await;
        srv.send(b"switch login: ").await;
        srv.expect(b"admin\n").await;
        srv.send(b"Password: ").await;
        srv.expect(b"secret\n").await;
        // The session layer probes with a newline to discover the prompt.
        srv.expect(b"\n").await;
        srv.send(b"\r\nswitch# ").await;
        srv.expect(b"show clock\n").await;
        srv.send(b"show clock\r\n12:00:00 UTC\r\nswitch# ").await;

        // The client must have answered both negotiation requests.
        assert!(
            find(&srv.seen, &[IAC, WILL, OPT_TTYPE]).is_some(),
            "no WILL TERMINAL-TYPE reply"
        );
        assert!(
            find(&srv.seen, &[IAC, DO, OPT_ECHO]).is_some(),
            "no DO ECHO reply"
        );
    });

    let profile = DeviceProfile::new("switch", r"switch# $");
    let config = TelnetConfig::host("device.example").with_profile(&profile);
    let streamer =
        TelnetStreamer::new(config, Credentials::basic("admin", "secret")).with_dialer(dialer);

    let mut session = Session::new(Box::new(streamer), profile).unwrap();
    session.connect().await.unwrap();

    let result = session.cmd("show clock").await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.output, b"12:00:00 UTC\r\n");
    assert_eq!(result.prompt, "switch#");

    session.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn telnet_without_credentials_skips_login() {
    let (client_end, server_end) = tokio::io::duplex(4096);
    let dialer = Arc::new(OneShotDialer(Mutex::new(Some(client_end))));

    let server = tokio::spawn(async move {
        let mut srv = ScriptServer::new(server_end);
        // Straight to a shell, no login dialog.
        srv.expect(b"\n").await;
        srv.send(b"\r\n$ ").await;
        srv.expect(b"echo hi\n").await;
        srv.send(b"echo hi\r\nhi\r\n$ ").await;
    });

    let profile = DeviceProfile::new("shell", r"\$ $");
    let config = TelnetConfig::host("device.example");
    let streamer = TelnetStreamer::new(config, Credentials::new()).with_dialer(dialer);

    let mut session = Session::new(Box::new(streamer), profile).unwrap();
    session.connect().await.unwrap();
    let result = session.cmd("echo hi").await.unwrap();
    assert_eq!(result.output, b"hi\r\n");

    session.close().await.unwrap();
    server.await.unwrap();
}
