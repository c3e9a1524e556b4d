use std::cmp::Reverse;
use std::fmt;
use std::ops::Range;

use aho_corasick::{AhoCorasick, Input, MatchKind};
use regex::Regex;

use crate::consolidate::IMAGE_SENTINEL;
use crate::error::Error;

#[derive(Clone, Debug)]
pub enum TokenKey {
    Literal(String),
    Pattern(Regex),
}

impl TokenKey {
    pub fn as_str(&self) -> &str {
        match self {
            TokenKey::Literal(s) => s,
            TokenKey::Pattern(re) => re.as_str(),
        }
    }
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
struct Entry {
    key: TokenKey,
    value: String,
}

/// Marker → replacement mapping. Literal keys and regex keys share one
/// insertion order, which breaks ties between equally long matches.
#[derive(Clone, Debug)]
pub struct TokenMap {
    entries: Vec<Entry>,
    literals: Option<AhoCorasick>,
    /// Aho-Corasick pattern id → entry index.
    literal_entries: Vec<usize>,
    patterns: Vec<usize>,
}

#[derive(Default)]
pub struct TokenMapBuilder {
    entries: Vec<(String, String, bool)>,
}

impl TokenMapBuilder {
    pub fn literal(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.push((key.into(), value.into(), false));
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.push((pattern.into(), value.into(), true));
        self
    }

    pub fn build(self) -> Result<TokenMap, Error> {
        let mut entries: Vec<Entry> = Vec::with_capacity(self.entries.len());
        let mut literal_keys = Vec::new();
        let mut literal_entries = Vec::new();
        let mut patterns = Vec::new();

        for (key, value, is_pattern) in self.entries {
            if key.is_empty() {
                return Err(Error::Config("token keys must not be empty".into()));
            }
            if key.contains(IMAGE_SENTINEL) {
                return Err(Error::Config(format!(
                    "token key {key:?} contains U+FFFC, which is reserved for images"
                )));
            }
            let duplicate = entries
                .iter()
                .any(|e| e.key.as_str() == key && matches!(e.key, TokenKey::Pattern(_)) == is_pattern);
            if duplicate {
                log::warn!("Token key {key:?} given twice, keeping the first value");
                continue;
            }
            let key = if is_pattern {
                patterns.push(entries.len());
                TokenKey::Pattern(Regex::new(&key)?)
            } else {
                literal_entries.push(entries.len());
                literal_keys.push(key.clone());
                TokenKey::Literal(key)
            };
            entries.push(Entry { key, value });
        }

        let literals = if literal_keys.is_empty() {
            None
        } else {
            Some(
                AhoCorasick::builder()
                    .match_kind(MatchKind::LeftmostLongest)
                    .build(&literal_keys)?,
            )
        };

        Ok(TokenMap {
            entries,
            literals,
            literal_entries,
            patterns,
        })
    }
}

/// One substitution against the logical text, in original byte offsets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextEdit {
    pub range: Range<usize>,
    pub replacement: String,
    pub source_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub text: String,
    pub edits: Vec<TextEdit>,
}

impl Resolution {
    pub fn is_unchanged(&self) -> bool {
        self.edits.is_empty()
    }
}

struct Candidate {
    range: Range<usize>,
    entry: usize,
}

impl TokenMap {
    pub fn builder() -> TokenMapBuilder {
        TokenMapBuilder::default()
    }

    pub fn from_literals<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self, Error>
    where
        K: Into<String>,
        V: Into<String>,
    {
        pairs
            .into_iter()
            .fold(TokenMap::builder(), |b, (k, v)| b.literal(k, v))
            .build()
    }

    pub fn empty() -> Self {
        TokenMap {
            entries: Vec::new(),
            literals: None,
            literal_entries: Vec::new(),
            patterns: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TokenKey> {
        self.entries.iter().map(|e| &e.key)
    }

    /// Appends the substitutions found in `text[range]` to `edits`.
    ///
    /// Scans left to right. At each step the earliest match wins, then the
    /// longest, then the key inserted first. Scanning resumes after the
    /// match, so replacement values are never rescanned.
    pub fn find_edits(&self, text: &str, range: Range<usize>, edits: &mut Vec<TextEdit>) {
        let haystack = &text[..range.end];
        let mut pos = range.start;
        while pos < range.end {
            let Some(found) = self.next_match(haystack, pos) else {
                break;
            };
            let entry = &self.entries[found.entry];
            pos = found.range.end;
            edits.push(TextEdit {
                range: found.range,
                replacement: entry.value.clone(),
                source_key: entry.key.as_str().to_string(),
            });
        }
    }

    fn next_match(&self, haystack: &str, pos: usize) -> Option<Candidate> {
        let literal = self.literals.as_ref().and_then(|ac| {
            ac.find(Input::new(haystack).range(pos..))
                .map(|m| Candidate {
                    range: m.range(),
                    entry: self.literal_entries[m.pattern().as_usize()],
                })
        });
        let patterns = self.patterns.iter().filter_map(|&entry| match &self.entries[entry].key {
            TokenKey::Pattern(re) => {
                first_non_empty(re, haystack, pos).map(|range| Candidate { range, entry })
            }
            TokenKey::Literal(_) => None,
        });
        literal
            .into_iter()
            .chain(patterns)
            .min_by_key(|c| (c.range.start, Reverse(c.range.len()), c.entry))
    }

    /// Whether any key occurs anywhere in `text`.
    pub fn mentions(&self, text: &str) -> bool {
        let mut edits = Vec::new();
        for segment in segments(text, &[]) {
            self.find_edits(text, segment, &mut edits);
            if !edits.is_empty() {
                return true;
            }
        }
        false
    }
}

fn first_non_empty(re: &Regex, haystack: &str, mut at: usize) -> Option<Range<usize>> {
    while at <= haystack.len() {
        let m = re.find_at(haystack, at)?;
        if !m.is_empty() {
            return Some(m.range());
        }
        at = m.end() + haystack[m.end()..].chars().next().map_or(1, char::len_utf8);
    }
    None
}

/// Splits `text` into the ranges tokens may match in: everything except
/// image sentinels and the `blocked` ranges (sorted, non-overlapping).
pub fn segments(text: &str, blocked: &[Range<usize>]) -> Vec<Range<usize>> {
    let mut cuts: Vec<Range<usize>> = text
        .match_indices(IMAGE_SENTINEL)
        .map(|(i, s)| i..i + s.len())
        .chain(blocked.iter().cloned())
        .collect();
    cuts.sort_by_key(|r| r.start);

    let mut out = Vec::new();
    let mut start = 0;
    for cut in cuts {
        if cut.start > start {
            out.push(start..cut.start);
        }
        start = start.max(cut.end);
    }
    if start < text.len() {
        out.push(start..text.len());
    }
    out
}

/// Applies `edits` (sorted, non-overlapping) to `text`.
pub fn apply_edits(text: &str, edits: &[TextEdit]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    for edit in edits {
        out.push_str(&text[pos..edit.range.start]);
        out.push_str(&edit.replacement);
        pos = edit.range.end;
    }
    out.push_str(&text[pos..]);
    out
}

/// Single substitution pass over `text`; image sentinels are never matched
/// across.
pub fn resolve(text: &str, tokens: &TokenMap) -> Resolution {
    let mut edits = Vec::new();
    for segment in segments(text, &[]) {
        tokens.find_edits(text, segment, &mut edits);
    }
    Resolution {
        text: apply_edits(text, &edits),
        edits,
    }
}
