//! The expect engine: wait until one of a set of patterns matches the live
//! stream.
//!
//! This is a single driver loop, not a callback tree: scan, read, append,
//! repeat. Two clocks bound each call - the per-read window (rearmed on
//! every received chunk, it bounds peer silence) and an optional overall
//! deadline. A cancellation token preempts both.

use std::time::Duration;

use log::trace;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::buffer::ReadBuffer;
use super::patterns::ExpectSet;
use crate::error::{ChannelError, Error, Result, TransportError};
use crate::transport::Streamer;

/// A completed expect: which pattern fired and the bytes around it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedMatch {
    /// Name of the winning pattern.
    pub name: String,

    /// Bytes between the consume checkpoint and the match start ("output
    /// before match").
    pub before: Vec<u8>,

    /// The matched bytes themselves.
    pub matched: Vec<u8>,

    /// Capture group bytes for the winning pattern, group 0 first.
    pub groups: Vec<Option<Vec<u8>>>,
}

impl ExpectedMatch {
    /// Matched bytes as lossy UTF-8.
    pub fn matched_lossy(&self) -> String {
        String::from_utf8_lossy(&self.matched).into_owned()
    }

    /// Named-by-position group as lossy UTF-8.
    pub fn group_lossy(&self, index: usize) -> Option<String> {
        self.groups
            .get(index)?
            .as_ref()
            .map(|g| String::from_utf8_lossy(g).into_owned())
    }
}

/// Expect engine bound to one streamer.
///
/// Owns the transport and the read buffer; a [`Session`](crate::Session)
/// owns the engine. Calls are not re-entrant - one expect at a time.
pub struct Expect {
    streamer: Box<dyn Streamer>,
    buffer: ReadBuffer,
}

impl Expect {
    pub fn new(streamer: Box<dyn Streamer>) -> Self {
        Self {
            streamer,
            buffer: ReadBuffer::new(),
        }
    }

    pub fn buffer(&self) -> &ReadBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut ReadBuffer {
        &mut self.buffer
    }

    pub fn streamer_mut(&mut self) -> &mut dyn Streamer {
        self.streamer.as_mut()
    }

    /// Write through to the transport.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.streamer.write_all(data).await
    }

    /// Close the underlying transport.
    pub async fn close(&mut self) -> Result<()> {
        self.streamer.close().await
    }

    /// Wait until one of `set` matches the stream.
    ///
    /// `read_timeout` bounds silence between chunks; `deadline`, when set,
    /// bounds the whole call; `cancel` preempts immediately. On success the
    /// buffer is consumed through the end of the match. On failure the
    /// error carries a snapshot of everything read but not consumed.
    pub async fn expect(
        &mut self,
        set: &ExpectSet,
        read_timeout: Duration,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<ExpectedMatch> {
        let started = Instant::now();
        loop {
            if let Some(found) = self.buffer.scan(set) {
                trace!(
                    "expect: pattern {:?} matched at {}..{}",
                    found.name,
                    found.start,
                    found.end
                );
                let before = self.buffer.peek(found.start).to_vec();
                let matched = self.buffer.peek(found.end)[found.start..].to_vec();
                let groups = found
                    .groups
                    .iter()
                    .map(|g| g.map(|(s, e)| self.buffer.peek(e)[s..].to_vec()))
                    .collect();
                self.buffer.consume(found.end);
                return Ok(ExpectedMatch {
                    name: found.name,
                    before,
                    matched,
                    groups,
                });
            }

            // One read window: the silence bound, clipped by the deadline.
            let mut window = read_timeout;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(self.timeout_error(started));
                }
                window = window.min(remaining);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ChannelError::Cancelled {
                        buffer: self.buffer.pending().into(),
                    }
                    .into());
                }
                read = tokio::time::timeout(window, self.streamer.read_chunk()) => {
                    match read {
                        Err(_elapsed) => return Err(self.timeout_error(started)),
                        Ok(Err(err)) => return Err(self.read_error(err)),
                        Ok(Ok(chunk)) => {
                            trace!("expect: +{} bytes", chunk.len());
                            self.buffer.append(&chunk);
                        }
                    }
                }
            }
        }
    }

    /// One opportunistic read with a bounded window, appended to the buffer.
    ///
    /// Used to pick up trailing context after an error-pattern hit. Returns
    /// `false` when the window elapses or the stream ends; only
    /// cancellation is an error.
    pub async fn read_more(
        &mut self,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChannelError::Cancelled {
                buffer: self.buffer.pending().into(),
            }
            .into()),
            read = tokio::time::timeout(window, self.streamer.read_chunk()) => {
                match read {
                    Err(_elapsed) => Ok(false),
                    Ok(Err(err)) if is_closed(&err) => Ok(false),
                    Ok(Err(err)) => Err(err),
                    Ok(Ok(chunk)) => {
                        self.buffer.append(&chunk);
                        Ok(true)
                    }
                }
            }
        }
    }

    fn timeout_error(&self, started: Instant) -> Error {
        ChannelError::ExpectTimeout {
            elapsed: started.elapsed(),
            buffer: self.buffer.pending().into(),
        }
        .into()
    }

    fn read_error(&self, err: Error) -> Error {
        if is_closed(&err) {
            ChannelError::ConnectionLost {
                buffer: self.buffer.pending().into(),
            }
            .into()
        } else {
            err
        }
    }
}

fn is_closed(err: &Error) -> bool {
    matches!(err, Error::Transport(TransportError::Closed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockStreamer;

    fn set(patterns: &[(&str, &str)]) -> ExpectSet {
        let mut s = ExpectSet::new();
        for (name, pat) in patterns {
            s.insert(*name, pat).unwrap();
        }
        s
    }

    #[tokio::test]
    async fn matches_across_chunk_boundary() {
        let mock = MockStreamer::new().reads(&[b"rout".as_slice(), b"er> ".as_slice()]);
        let mut expect = Expect::new(Box::new(mock));
        let cancel = CancellationToken::new();

        let m = expect
            .expect(
                &set(&[("prompt", r"router> ")]),
                Duration::from_secs(1),
                None,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(m.name, "prompt");
        assert_eq!(m.matched, b"router> ");
        assert!(m.before.is_empty());
    }

    #[tokio::test]
    async fn before_bytes_are_returned_and_consumed() {
        let mock = MockStreamer::new().reads(&[b"some output\nrouter> ".as_slice()]);
        let mut expect = Expect::new(Box::new(mock));
        let cancel = CancellationToken::new();

        let m = expect
            .expect(
                &set(&[("prompt", r"router> ")]),
                Duration::from_secs(1),
                None,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(m.before, b"some output\n");
        assert!(expect.buffer().pending().is_empty());
    }

    #[tokio::test]
    async fn silence_times_out_within_read_window() {
        let mock = MockStreamer::new().reads(&[b"partial".as_slice()]).then_silent();
        let mut expect = Expect::new(Box::new(mock));
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let err = expect
            .expect(
                &set(&[("prompt", r"router> ")]),
                Duration::from_millis(100),
                None,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(err.buffer_snapshot(), Some(&b"partial"[..]));
    }

    #[tokio::test]
    async fn deadline_clips_read_window() {
        let mock = MockStreamer::new().then_silent();
        let mut expect = Expect::new(Box::new(mock));
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let err = expect
            .expect(
                &set(&[("prompt", r"router> ")]),
                Duration::from_secs(10),
                Some(Instant::now() + Duration::from_millis(80)),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn cancellation_preempts_with_snapshot() {
        let mock = MockStreamer::new().reads(&[b"seen".as_slice()]).then_silent();
        let mut expect = Expect::new(Box::new(mock));
        let cancel = CancellationToken::new();

        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
        });

        let started = Instant::now();
        let err = expect
            .expect(
                &set(&[("prompt", r"router> ")]),
                Duration::from_secs(10),
                None,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(err.buffer_snapshot(), Some(&b"seen"[..]));
    }

    #[tokio::test]
    async fn closed_stream_is_connection_lost() {
        let mock = MockStreamer::new().reads(&[b"bye".as_slice()]).then_eof();
        let mut expect = Expect::new(Box::new(mock));
        let cancel = CancellationToken::new();

        let err = expect
            .expect(
                &set(&[("prompt", r"router> ")]),
                Duration::from_secs(1),
                None,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_connection_lost());
        assert_eq!(err.buffer_snapshot(), Some(&b"bye"[..]));
    }

    #[tokio::test]
    async fn earliest_match_consumes_only_through_winner() {
        let mock = MockStreamer::new().reads(&[b"a --More-- b\nrouter> ".as_slice()]);
        let mut expect = Expect::new(Box::new(mock));
        let cancel = CancellationToken::new();
        let patterns = set(&[("prompt", r"router> "), ("pager", r"--More--")]);

        let m = expect
            .expect(&patterns, Duration::from_secs(1), None, &cancel)
            .await
            .unwrap();
        assert_eq!(m.name, "pager");
        // The prompt bytes are still pending for the next call.
        let m = expect
            .expect(&patterns, Duration::from_secs(1), None, &cancel)
            .await
            .unwrap();
        assert_eq!(m.name, "prompt");
        assert_eq!(m.before, b" b\n");
    }
}
