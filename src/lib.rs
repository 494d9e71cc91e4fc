//! # netcli
//!
//! Async CLI automation for network devices over SSH and telnet.
//!
//! netcli turns a raw duplex connection into prompt-delimited command
//! executions: it discovers the device prompt, matches concurrent regex
//! alternatives on the growing byte stream, answers questions, pages
//! through `--More--` interrupts, detects device error vocabulary, and
//! gets you structured results back - across vendors whose prompts and
//! error strings all differ.
//!
//! ## Features
//!
//! - Async SSH via russh (agent, key, and password auth, tried in order)
//! - Telnet with RFC 854 option negotiation and in-band login
//! - An expect engine with deterministic earliest-match semantics
//! - Jump-host tunneling, including reuse of an OpenSSH control-master socket
//! - Two-level timeouts (per-read and per-command) and cancellation tokens
//! - A scripted mock transport for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use netcli::{Credentials, DeviceProfile, Session, SshConfig, SshStreamer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), netcli::Error> {
//!     let streamer = SshStreamer::new(
//!         SshConfig::host("192.0.2.1"),
//!         Credentials::basic("admin", "secret"),
//!     );
//!
//!     let mut session = Session::new(Box::new(streamer), DeviceProfile::ios_like())?;
//!     session.connect().await?;
//!
//!     let result = session.cmd("show version").await?;
//!     println!("{}", result.output_lossy());
//!
//!     session.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Through a jump host
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use netcli::{Credentials, DeviceProfile, Session, SshConfig, SshStreamer, Tunnel};
//!
//! # async fn example() -> Result<(), netcli::Error> {
//! let tunnel = Arc::new(Tunnel::new(
//!     SshConfig::host("bastion.example.net"),
//!     Credentials::basic("jump", "jumppw"),
//! ));
//! tunnel.connect().await?;
//!
//! let streamer = SshStreamer::new(
//!     SshConfig::host("10.0.0.5"),
//!     Credentials::basic("admin", "secret"),
//! )
//! .with_dialer(tunnel.clone());
//!
//! let mut session = Session::new(Box::new(streamer), DeviceProfile::generic())?;
//! session.connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod credentials;
pub mod error;
pub mod profile;
pub mod session;
pub mod transport;
pub mod tunnel;

// Re-export main types for convenience
pub use channel::{Expect, ExpectSet, ExpectedMatch, PatternMatch, ReadBuffer};
pub use credentials::{Credentials, PrivateKeySource};
pub use error::{
    ChannelError, Error, Result, SessionError, TransportError, TunnelError,
};
pub use profile::DeviceProfile;
pub use session::{CmdOptions, CmdResult, CmdStatus, DetectedError, Session, SessionBuilder};
pub use transport::{
    AlgorithmSuite, Endpoint, HostKeyVerification, Network, SshConfig, SshStreamer, Streamer,
    TelnetConfig, TelnetStreamer, TraceDirection,
};
pub use tunnel::Tunnel;
