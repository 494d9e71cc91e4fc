//! Scripted in-memory streamer for tests.
//!
//! A [`MockStreamer`] replays a scripted device: queued read chunks, delays,
//! EOF, and write-triggered responses ("when the session sends X, emit Y").
//! Recorded sessions replayed through it reproduce real `Cmd` results
//! byte-for-byte, which is how the scenario tests in `tests/` work.
//!
//! # Example
//!
//! ```rust
//! use netcli::transport::mock::MockStreamer;
//!
//! let mock = MockStreamer::new()
//!     .reads(&[b"router> ".as_slice()])
//!     .on_write(b"show version\n", &[b"show version\nIOS 15.2\nrouter> ".as_slice()]);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::trace::{self, TraceDirection, TraceSink};
use crate::error::{Result, TransportError};
use crate::transport::Streamer;

#[derive(Debug, Clone)]
enum MockEvent {
    Data(Vec<u8>),
    Delay(Duration),
    Eof,
}

/// What a read does once the scripted events run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    /// Block forever (device goes silent).
    Silent,

    /// Report the stream closed.
    Eof,
}

/// Scripted streamer. Build with the chained constructors, then hand to a
/// session or expect engine as `Box<dyn Streamer>`.
pub struct MockStreamer {
    events: VecDeque<MockEvent>,
    on_write: Vec<(Vec<u8>, Vec<MockEvent>)>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    tail: Tail,
    closed: bool,
    trace: Option<TraceSink>,
}

impl MockStreamer {
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
            on_write: Vec::new(),
            writes: Arc::new(Mutex::new(Vec::new())),
            tail: Tail::Silent,
            closed: false,
            trace: None,
        }
    }

    /// Queue chunks returned by successive reads.
    pub fn reads(mut self, chunks: &[&[u8]]) -> Self {
        for chunk in chunks {
            self.events.push_back(MockEvent::Data(chunk.to_vec()));
        }
        self
    }

    /// Queue a pause before the next queued chunk.
    pub fn delay(mut self, duration: Duration) -> Self {
        self.events.push_back(MockEvent::Delay(duration));
        self
    }

    /// When the exact bytes `expected` are written, queue `responses`.
    pub fn on_write(mut self, expected: &[u8], responses: &[&[u8]]) -> Self {
        let events = responses
            .iter()
            .map(|chunk| MockEvent::Data(chunk.to_vec()))
            .collect();
        self.on_write.push((expected.to_vec(), events));
        self
    }

    /// Like [`on_write`](Self::on_write), with a delay before the response.
    pub fn on_write_delayed(
        mut self,
        expected: &[u8],
        delay: Duration,
        responses: &[&[u8]],
    ) -> Self {
        let mut events = vec![MockEvent::Delay(delay)];
        events.extend(
            responses
                .iter()
                .map(|chunk| MockEvent::Data(chunk.to_vec())),
        );
        self.on_write.push((expected.to_vec(), events));
        self
    }

    /// Go silent after the scripted events (default).
    pub fn then_silent(mut self) -> Self {
        self.tail = Tail::Silent;
        self
    }

    /// Close the stream after the scripted events.
    pub fn then_eof(mut self) -> Self {
        self.tail = Tail::Eof;
        self
    }

    /// Handle for inspecting recorded writes after the mock has been moved
    /// into a session.
    pub fn writes_handle(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        self.writes.clone()
    }
}

impl Default for MockStreamer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Streamer for MockStreamer {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<Vec<u8>> {
        loop {
            if self.closed {
                return Err(TransportError::Closed.into());
            }
            match self.events.pop_front() {
                Some(MockEvent::Data(chunk)) => {
                    trace::emit(&self.trace, TraceDirection::Read, &chunk);
                    return Ok(chunk);
                }
                Some(MockEvent::Delay(duration)) => {
                    tokio::time::sleep(duration).await;
                }
                Some(MockEvent::Eof) => return Err(TransportError::Closed.into()),
                None => match self.tail {
                    Tail::Eof => return Err(TransportError::Closed.into()),
                    Tail::Silent => {
                        // Scripted silence: block until cancelled from above.
                        std::future::pending::<()>().await;
                    }
                },
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TransportError::Closed.into());
        }
        trace::emit(&self.trace, TraceDirection::Write, data);
        self.writes.lock().unwrap().push(data.to_vec());

        if let Some(pos) = self.on_write.iter().position(|(expected, _)| expected == data) {
            let (_, events) = self.on_write.remove(pos);
            self.events.extend(events);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn set_trace(&mut self, sink: TraceSink) {
        self.trace = Some(sink);
    }
}
