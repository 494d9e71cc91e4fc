//! Append-only read buffer with checkpoint/consume semantics.
//!
//! The buffer is a growing byte log plus two offsets: `consumed` marks bytes
//! the session has accepted (command echo, collected output, matched
//! tokens); `cursor` is the high-water mark of the current expect scan.
//! Invariant: `consumed <= cursor <= len`.
//!
//! Scans always run over `log[consumed..]`, never from the previous scan
//! position - a pattern that straddles an append boundary must still match
//! once the rest of it arrives.

use super::patterns::{ExpectSet, PatternMatch};

/// Drop already-consumed bytes once they pass this size.
const COMPACT_THRESHOLD: usize = 64 * 1024;

/// Growing byte log for one session's expect engine. Single-writer.
#[derive(Debug, Default)]
pub struct ReadBuffer {
    log: Vec<u8>,
    consumed: usize,
    cursor: usize,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes to the log.
    pub fn append(&mut self, data: &[u8]) {
        self.log.extend_from_slice(data);
    }

    /// Bytes not yet consumed.
    pub fn pending(&self) -> &[u8] {
        &self.log[self.consumed..]
    }

    /// Bytes between the consume checkpoint and the scan high-water mark.
    pub fn snapshot(&self) -> &[u8] {
        &self.log[self.consumed..self.cursor]
    }

    /// Total unconsumed length.
    pub fn pending_len(&self) -> usize {
        self.log.len() - self.consumed
    }

    /// Scan `log[consumed..]` for the earliest match in `set`.
    ///
    /// The earliest start offset wins; among equal starts, the pattern
    /// declared first wins. Offsets in the returned match are relative to
    /// `consumed`. Advances `cursor` to the end of the log when nothing
    /// matches, or to the match start when something does.
    pub fn scan(&mut self, set: &ExpectSet) -> Option<PatternMatch> {
        let hay = &self.log[self.consumed..];
        match set.find_earliest(hay) {
            Some(found) => {
                self.cursor = self.consumed + found.start;
                Some(found)
            }
            None => {
                self.cursor = self.log.len();
                None
            }
        }
    }

    /// Accept `n` bytes (relative to the current checkpoint) as processed.
    pub fn consume(&mut self, n: usize) {
        self.consumed = (self.consumed + n).min(self.log.len());
        if self.cursor < self.consumed {
            self.cursor = self.consumed;
        }
        self.maybe_compact();
    }

    /// Copy out `log[consumed..consumed + n]` without consuming.
    pub fn peek(&self, n: usize) -> &[u8] {
        let end = (self.consumed + n).min(self.log.len());
        &self.log[self.consumed..end]
    }

    /// Rewind the scan high-water mark to the consume checkpoint.
    pub fn reset(&mut self) {
        self.cursor = self.consumed;
    }

    fn maybe_compact(&mut self) {
        if self.consumed >= COMPACT_THRESHOLD {
            self.log.drain(..self.consumed);
            self.cursor -= self.consumed;
            self.consumed = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(patterns: &[(&str, &str)]) -> ExpectSet {
        let mut s = ExpectSet::new();
        for (name, pat) in patterns {
            s.insert(*name, pat).unwrap();
        }
        s
    }

    #[test]
    fn earliest_match_wins() {
        let mut buf = ReadBuffer::new();
        buf.append(b"aaa LATER bbb FIRST");
        // "LATER" appears earlier in the stream even though declared second.
        let patterns = set(&[("first", "FIRST"), ("later", "LATER")]);
        let m = buf.scan(&patterns).unwrap();
        assert_eq!(m.name, "later");
        assert_eq!(m.start, 4);
    }

    #[test]
    fn declaration_order_breaks_ties() {
        let mut buf = ReadBuffer::new();
        buf.append(b"router# ");
        let patterns = set(&[("broad", r"[#>]"), ("narrow", r"router#")]);
        // Both match; "broad" at offset 6, "narrow" at offset 0.
        let m = buf.scan(&patterns).unwrap();
        assert_eq!(m.name, "narrow");
    }

    #[test]
    fn straddling_append_boundary_eventually_matches() {
        let mut buf = ReadBuffer::new();
        let patterns = set(&[("prompt", r"router> ")]);
        buf.append(b"rou");
        assert!(buf.scan(&patterns).is_none());
        buf.append(b"ter> ");
        let m = buf.scan(&patterns).unwrap();
        assert_eq!((m.start, m.end), (0, 8));
    }

    #[test]
    fn byte_at_a_time_equals_whole_feed() {
        let stream = b"line1\n--More--\nline2\nrouter> ";
        let patterns = set(&[("pager", "--More--"), ("prompt", r"router> ")]);

        let collect = |chunks: &[&[u8]]| {
            let mut buf = ReadBuffer::new();
            let mut matches = Vec::new();
            for chunk in chunks {
                buf.append(chunk);
                while let Some(m) = buf.scan(&patterns) {
                    matches.push((m.name.clone(), m.start, m.end));
                    buf.consume(m.end);
                }
            }
            matches
        };

        let whole = collect(&[stream]);
        let bytes: Vec<&[u8]> = stream.chunks(1).collect();
        let one_at_a_time = collect(&bytes);
        assert_eq!(whole, one_at_a_time);
        assert_eq!(whole.len(), 2);
        assert_eq!(whole[0].0, "pager");
        assert_eq!(whole[1].0, "prompt");
    }

    #[test]
    fn consume_advances_checkpoint_and_offsets_stay_relative() {
        let mut buf = ReadBuffer::new();
        buf.append(b"echo\nprompt> ");
        let patterns = set(&[("prompt", r"prompt> ")]);
        let m = buf.scan(&patterns).unwrap();
        assert_eq!(m.start, 5);
        buf.consume(m.end);
        assert!(buf.pending().is_empty());

        buf.append(b"more\nprompt> ");
        let m = buf.scan(&patterns).unwrap();
        // Relative to the new checkpoint, not the log start.
        assert_eq!(m.start, 5);
    }

    #[test]
    fn snapshot_covers_checkpoint_to_cursor() {
        let mut buf = ReadBuffer::new();
        buf.append(b"partial output");
        let patterns = set(&[("prompt", r"never-matches-xyz")]);
        assert!(buf.scan(&patterns).is_none());
        assert_eq!(buf.snapshot(), b"partial output");
        buf.reset();
        assert!(buf.snapshot().is_empty());
    }

    #[test]
    fn compaction_is_unobservable() {
        let mut buf = ReadBuffer::new();
        let patterns = set(&[("prompt", r"end> ")]);
        // Push well past the compaction threshold in consumed bytes.
        for _ in 0..40 {
            buf.append(&vec![b'x'; 4096]);
            let n = buf.pending_len();
            buf.consume(n);
        }
        buf.append(b"tail end> ");
        let m = buf.scan(&patterns).unwrap();
        assert_eq!(m.start, 5);
        buf.consume(m.end);
        assert!(buf.pending().is_empty());
    }

    #[test]
    fn groups_capture_relative_ranges() {
        let mut buf = ReadBuffer::new();
        buf.append(b"xx host-a1> ");
        let patterns = set(&[("prompt", r"(?P<prompt>[\w-]+)> ")]);
        let m = buf.scan(&patterns).unwrap();
        // Group 0 is the whole match, group 1 the prompt name.
        assert_eq!(m.groups[0], Some((3, 12)));
        assert_eq!(m.groups[1], Some((3, 10)));
    }
}
