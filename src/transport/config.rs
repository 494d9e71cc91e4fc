//! Transport configuration: endpoints, terminal settings, SSH options.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use russh::Preferred;

/// Address family for a device or jump-host connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    /// Plain TCP.
    #[default]
    Tcp,

    /// Unix domain socket; the endpoint host is the socket path.
    Unix,

    /// Pre-established byte stream (control-master stdio forwarding).
    StreamPipe,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Unix => f.write_str("unix"),
            Self::StreamPipe => f.write_str("streampipe"),
        }
    }
}

/// Where to connect. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    network: Network,
}

impl Endpoint {
    /// Standard SSH port, used when callers give only a host.
    pub const DEFAULT_SSH_PORT: u16 = 22;

    /// Standard telnet port.
    pub const DEFAULT_TELNET_PORT: u16 = 23;

    pub fn new(host: impl Into<String>, port: u16, network: Network) -> Self {
        Self {
            host: host.into(),
            port,
            network,
        }
    }

    /// TCP endpoint on the default SSH port.
    pub fn ssh(host: impl Into<String>) -> Self {
        Self::new(host, Self::DEFAULT_SSH_PORT, Network::Tcp)
    }

    /// TCP endpoint on the default telnet port.
    pub fn telnet(host: impl Into<String>) -> Self {
        Self::new(host, Self::DEFAULT_TELNET_PORT, Network::Tcp)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// `host:port` form used by dialers.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.network, self.host, self.port)
    }
}

/// Host key verification mode, analogous to OpenSSH's `StrictHostKeyChecking`.
///
/// The default is `Disabled`: network device fleets routinely regenerate keys
/// and most deployments pin trust elsewhere. Configure a known-hosts source
/// to opt into checking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum HostKeyVerification {
    /// Reject unknown and changed keys.
    Strict,

    /// Accept and auto-learn unknown keys, but reject changed keys.
    AcceptNew,

    /// Accept all keys without checking.
    #[default]
    Disabled,
}

/// Kex/cipher preference presets for the SSH transport.
///
/// Ancient devices negotiate only long-deprecated suites; this is the
/// configuration surface that keeps them reachable without touching the
/// protocol implementation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlgorithmSuite {
    pub kex: Option<Vec<russh::kex::Name>>,
    pub cipher: Option<Vec<russh::cipher::Name>>,
}

impl AlgorithmSuite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kex(mut self, algorithms: Vec<russh::kex::Name>) -> Self {
        self.kex = Some(algorithms);
        self
    }

    pub fn cipher(mut self, algorithms: Vec<russh::cipher::Name>) -> Self {
        self.cipher = Some(algorithms);
        self
    }

    /// Preferences for devices with outdated SSH stacks.
    pub fn legacy() -> Self {
        Self::new()
            .kex(vec![
                russh::kex::CURVE25519_PRE_RFC_8731,
                russh::kex::DH_G14_SHA256,
                russh::kex::DH_G14_SHA1,
                russh::kex::DH_G1_SHA1,
                russh::kex::DH_GEX_SHA256,
                russh::kex::DH_GEX_SHA1,
            ])
            .cipher(vec![
                russh::cipher::AES_256_CTR,
                russh::cipher::AES_128_CTR,
                russh::cipher::AES_256_CBC,
                russh::cipher::AES_192_CBC,
                russh::cipher::AES_128_CBC,
            ])
    }

    /// Current-generation preferences.
    pub fn modern() -> Self {
        Self::new()
            .kex(vec![
                russh::kex::CURVE25519,
                russh::kex::ECDH_SHA2_NISTP256,
                russh::kex::DH_G14_SHA256,
            ])
            .cipher(vec![
                russh::cipher::CHACHA20_POLY1305,
                russh::cipher::AES_256_GCM,
                russh::cipher::AES_256_CTR,
            ])
    }

    pub(crate) fn to_preferred(&self) -> Preferred {
        let mut preferred = Preferred::default();
        if let Some(ref kex) = self.kex {
            preferred.kex = std::borrow::Cow::Owned(kex.clone());
        }
        if let Some(ref cipher) = self.cipher {
            preferred.cipher = std::borrow::Cow::Owned(cipher.clone());
        }
        preferred
    }
}

/// Interactive terminal parameters requested at session open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalSettings {
    /// Terminal type sent in the PTY request / telnet TERMINAL-TYPE offer.
    pub term: String,

    /// Terminal width in columns.
    pub width: u32,

    /// Terminal height in rows.
    pub height: u32,

    /// Request server-side echo off on the PTY.
    pub echo_off: bool,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            width: 200,
            height: 200,
            echo_off: false,
        }
    }
}

/// SSH transport configuration.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Target endpoint.
    pub endpoint: Endpoint,

    /// Terminal parameters for the PTY request.
    pub terminal: TerminalSettings,

    /// Connect (and key-exchange) timeout.
    pub connect_timeout: Duration,

    /// Host key verification mode.
    pub host_key_verification: HostKeyVerification,

    /// Path to known_hosts; `None` uses the user default.
    pub known_hosts_path: Option<PathBuf>,

    /// Keepalive interval; `None` disables keepalive packets.
    pub keepalive_interval: Option<Duration>,

    /// Unanswered keepalives tolerated before the peer counts as dead.
    pub keepalive_max: usize,

    /// Close the connection after this much silence in either direction.
    pub inactivity_timeout: Option<Duration>,

    /// Kex/cipher preferences; `None` takes russh defaults.
    pub algorithms: Option<AlgorithmSuite>,
}

impl SshConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            terminal: TerminalSettings::default(),
            connect_timeout: Duration::from_secs(30),
            host_key_verification: HostKeyVerification::default(),
            known_hosts_path: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            inactivity_timeout: None,
            algorithms: None,
        }
    }

    /// TCP target on the default SSH port.
    pub fn host(host: impl Into<String>) -> Self {
        Self::new(Endpoint::ssh(host))
    }
}

/// Telnet transport configuration.
///
/// The login/password prompt patterns usually come straight from a
/// [`DeviceProfile`](crate::DeviceProfile); telnet authenticates in-band, so
/// the transport needs them at connect time.
#[derive(Debug, Clone)]
pub struct TelnetConfig {
    /// Target endpoint.
    pub endpoint: Endpoint,

    /// Terminal type offered during TERMINAL-TYPE negotiation.
    pub terminal: TerminalSettings,

    /// Connect timeout.
    pub connect_timeout: Duration,

    /// Pattern announcing the username prompt.
    pub login_prompt_pattern: String,

    /// Pattern announcing the password prompt.
    pub password_prompt_pattern: String,

    /// Per-read timeout for the login dialog.
    pub login_timeout: Duration,
}

impl TelnetConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            terminal: TerminalSettings::default(),
            connect_timeout: Duration::from_secs(30),
            login_prompt_pattern: r"(?i)(login|username):\s*$".to_string(),
            password_prompt_pattern: r"(?i)password:\s*$".to_string(),
            login_timeout: Duration::from_secs(15),
        }
    }

    /// TCP target on the default telnet port.
    pub fn host(host: impl Into<String>) -> Self {
        Self::new(Endpoint::telnet(host))
    }

    /// Take the login dialog patterns from a device profile.
    pub fn with_profile(mut self, profile: &crate::DeviceProfile) -> Self {
        self.login_prompt_pattern = profile.login_prompt_pattern.clone();
        self.password_prompt_pattern = profile.password_prompt_pattern.clone();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_addr_formats_host_port() {
        let ep = Endpoint::new("198.51.100.7", 2022, Network::Tcp);
        assert_eq!(ep.addr(), "198.51.100.7:2022");
        assert_eq!(ep.to_string(), "tcp://198.51.100.7:2022");
    }

    #[test]
    fn default_ports() {
        assert_eq!(Endpoint::ssh("r1").port(), 22);
        assert_eq!(Endpoint::telnet("r1").port(), 23);
    }

    #[test]
    fn terminal_defaults_are_xterm_200() {
        let t = TerminalSettings::default();
        assert_eq!(t.term, "xterm");
        assert_eq!((t.width, t.height), (200, 200));
        assert!(!t.echo_off);
    }
}
