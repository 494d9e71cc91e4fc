//! Named pattern sets for the expect engine.

use indexmap::IndexMap;
use regex::bytes::{Regex, RegexBuilder};

use crate::error::{ChannelError, Result};

/// One pattern hit on the unconsumed buffer region.
///
/// All offsets are relative to the buffer's consume checkpoint at scan time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    /// Name of the pattern that matched.
    pub name: String,

    /// Match start.
    pub start: usize,

    /// Match end (exclusive).
    pub end: usize,

    /// Capture group ranges, group 0 first. `None` for groups that did not
    /// participate in the match.
    pub groups: Vec<Option<(usize, usize)>>,
}

/// Ordered mapping of pattern name to compiled regex.
///
/// Order is part of the contract: when several patterns match at the same
/// earliest offset, the one declared first wins. Patterns compile with
/// multi-line mode, so `^`/`$` anchor at line boundaries - the natural frame
/// for prompt and error vocabularies.
#[derive(Debug, Clone, Default)]
pub struct ExpectSet {
    patterns: IndexMap<String, Regex>,
}

impl ExpectSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and append a pattern. Replaces an existing pattern with the
    /// same name, keeping its original position.
    pub fn insert(&mut self, name: impl Into<String>, pattern: &str) -> Result<()> {
        let regex = compile(pattern)?;
        self.patterns.insert(name.into(), regex);
        Ok(())
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, pattern: &str) -> Result<Self> {
        self.insert(name, pattern)?;
        Ok(self)
    }

    /// Single-pattern set.
    pub fn single(name: impl Into<String>, pattern: &str) -> Result<Self> {
        Self::new().with(name, pattern)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.patterns.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Regex)> {
        self.patterns.iter().map(|(name, re)| (name.as_str(), re))
    }

    /// Find the earliest match across all patterns in `hay`.
    ///
    /// Smallest start offset wins; declaration order breaks ties. Capture
    /// groups are resolved only for the winning pattern.
    pub fn find_earliest(&self, hay: &[u8]) -> Option<PatternMatch> {
        let mut best: Option<(usize, usize, usize)> = None; // (start, decl_index, end)
        for (index, (_, regex)) in self.patterns.iter().enumerate() {
            if let Some(m) = regex.find(hay) {
                let candidate = (m.start(), index, m.end());
                let better = match best {
                    None => true,
                    Some((start, decl, _)) => {
                        m.start() < start || (m.start() == start && index < decl)
                    }
                };
                if better {
                    best = Some(candidate);
                }
            }
        }

        let (start, index, end) = best?;
        let (name, regex) = self.patterns.get_index(index)?;
        // Re-run at the known position for group ranges; find() above avoids
        // paying capture cost for the losing patterns.
        let groups = regex
            .captures(&hay[start..])
            .map(|caps| {
                caps.iter()
                    .map(|g| g.map(|m| (start + m.start(), start + m.end())))
                    .collect()
            })
            .unwrap_or_default();

        Some(PatternMatch {
            name: name.clone(),
            start,
            end,
            groups,
        })
    }
}

/// Compile one pattern with the engine's multi-line convention.
pub fn compile(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .multi_line(true)
        .build()
        .map_err(|e| ChannelError::InvalidPattern(e).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_pattern_is_rejected() {
        let mut set = ExpectSet::new();
        let err = set.insert("bad", "[unclosed").unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Channel(ChannelError::InvalidPattern(_))
        ));
    }

    #[test]
    fn caret_anchors_at_line_starts() {
        let set = ExpectSet::single("err", r"^% .*").unwrap();
        let m = set.find_earliest(b"bad cmd\n% Invalid input\n").unwrap();
        assert_eq!(&b"bad cmd\n% Invalid input\n"[m.start..m.end], b"% Invalid input");
    }

    #[test]
    fn reinsert_keeps_position() {
        let mut set = ExpectSet::new();
        set.insert("a", "aaa").unwrap();
        set.insert("b", "bbb").unwrap();
        set.insert("a", "zzz").unwrap();
        let names: Vec<&str> = set.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn find_earliest_returns_none_on_empty_set() {
        assert!(ExpectSet::new().find_earliest(b"anything").is_none());
    }

    #[test]
    fn groups_only_for_winner() {
        let set = ExpectSet::new()
            .with("q", r"(confirm)\?")
            .unwrap()
            .with("p", r"(router)> ")
            .unwrap();
        let m = set.find_earliest(b"reload confirm? router> ").unwrap();
        assert_eq!(m.name, "q");
        assert_eq!(m.groups.len(), 2);
    }
}
