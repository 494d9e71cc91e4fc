//! Byte-level trace sink for audit and debugging.
//!
//! A trace sink receives every byte a transport reads or writes, tagged with
//! direction. Transports also route auxiliary streams here (the
//! control-master child's stderr arrives as [`TraceDirection::Aux`]).

use std::io::Write;
use std::sync::{Arc, Mutex};

use log::warn;

/// Direction of a traced byte record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceDirection {
    /// Bytes read from the peer.
    Read,

    /// Bytes written to the peer.
    Write,

    /// Side-channel bytes (e.g. external process stderr).
    Aux,
}

impl TraceDirection {
    fn tag(self) -> &'static str {
        match self {
            Self::Read => "<<",
            Self::Write => ">>",
            Self::Aux => "!!",
        }
    }
}

/// Shared trace sink handed to transports via `set_trace`.
pub type TraceSink = Arc<dyn Fn(TraceDirection, &[u8]) + Send + Sync>;

/// Build a sink that writes direction-tagged, escaped lines to `writer`.
///
/// Output looks like:
///
/// ```text
/// >> "show version\n"
/// << "Cisco IOS ...\nrouter> "
/// ```
pub fn trace_to_writer<W>(writer: W) -> TraceSink
where
    W: Write + Send + 'static,
{
    let writer = Arc::new(Mutex::new(writer));
    Arc::new(move |direction, bytes| {
        let mut guard = match writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let text = String::from_utf8_lossy(bytes);
        if let Err(err) = writeln!(guard, "{} {:?}", direction.tag(), text) {
            warn!("trace sink write failed: {}", err);
        }
    })
}

/// Emit a record if a sink is installed. Helper for transports.
pub(crate) fn emit(sink: &Option<TraceSink>, direction: TraceDirection, bytes: &[u8]) {
    if let Some(sink) = sink {
        sink(direction, bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writer_sink_tags_directions() {
        let buf = SharedBuf::default();
        let sink = trace_to_writer(buf.clone());
        sink(TraceDirection::Write, b"show version\n");
        sink(TraceDirection::Read, b"router> ");
        sink(TraceDirection::Aux, b"child stderr");

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains(">> \"show version\\n\""));
        assert!(text.contains("<< \"router> \""));
        assert!(text.contains("!! \"child stderr\""));
    }
}
