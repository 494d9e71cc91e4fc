//! Stdio forwarding through an existing OpenSSH control-master socket.
//!
//! Spawns `ssh -S <socket> -W <host>:<port> <jump>` and presents the
//! child's stdin/stdout as a byte stream. The master connection is
//! preauthenticated outside this process, so no credentials are involved.

use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::{Result, TunnelError};
use crate::transport::{TraceDirection, TraceSink};

/// A forwarded connection backed by an `ssh -W` child process.
///
/// Reads and writes map to the child's stdio. Dropping the stream kills the
/// child; stderr drains to the trace sink (and the log) in the background.
pub struct ControlMasterStream {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl ControlMasterStream {
    /// Spawn the stdio-forward child for `target` through the master at
    /// `socket`.
    pub(crate) fn spawn(
        socket: &Path,
        jump_host: &str,
        target_host: &str,
        target_port: u16,
        trace: Option<TraceSink>,
    ) -> Result<Self> {
        let forward = format!("{}:{}", target_host, target_port);
        debug!(
            "control master: ssh -S {} -W {} {}",
            socket.display(),
            forward,
            jump_host
        );
        let mut child = Command::new("ssh")
            .arg("-S")
            .arg(socket)
            .arg("-W")
            .arg(&forward)
            .arg(jump_host)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TunnelError::ControlMaster {
                message: format!("spawning ssh failed: {}", err),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| TunnelError::ControlMaster {
            message: "child stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| TunnelError::ControlMaster {
            message: "child stdout unavailable".to_string(),
        })?;

        if let Some(mut stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            debug!(
                                "control master stderr: {}",
                                String::from_utf8_lossy(&buf[..n]).trim_end()
                            );
                            if let Some(ref sink) = trace {
                                sink(TraceDirection::Aux, &buf[..n]);
                            }
                        }
                    }
                }
            });
        }

        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }
}

impl AsyncRead for ControlMasterStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.stdout).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if buf.filled().len() == before => {
                // EOF: if the child already failed, say so instead of
                // reporting a silent close.
                if let Ok(Some(status)) = self.child.try_wait() {
                    if !status.success() {
                        return Poll::Ready(Err(std::io::Error::other(format!(
                            "control master ssh exited with {}",
                            status
                        ))));
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl AsyncWrite for ControlMasterStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}

impl Drop for ControlMasterStream {
    fn drop(&mut self) {
        // kill_on_drop reaps the child; this just makes the signal prompt.
        let _ = self.child.start_kill();
    }
}
