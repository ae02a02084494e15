//! Text segmentation into bounded-length utterances.
//!
//! Text is normalized (whitespace runs collapsed, ends trimmed) and cut at
//! sentence endings first. A sentence longer than the limit is cut at the last
//! space that fits; a single token longer than the limit is hard-split at the
//! character limit. The chunker is incremental: every call to
//! [`Chunker::next_chunk`] takes the limit in force *now*, so a limit that
//! shrinks mid-run only affects the text not yet emitted.

use serde::Serialize;

use crate::error::{Result, StreamError};

/// A bounded unit of text submitted as one synthesis request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub is_last: bool,
    /// The chunk continues a token hard-split at the end of the previous
    /// chunk, so no space separates them in the source text.
    pub joins_previous: bool,
}

impl Chunk {
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

const TERMINATORS: [char; 3] = ['.', '!', '?'];
const CLOSERS: [char; 5] = ['"', '\'', ')', ']', '\u{201D}'];

/// Collapse runs of whitespace into single spaces and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone)]
pub struct Chunker {
    chars: Vec<char>,
    pos: usize,
    next_index: usize,
    glue_next: bool,
}

impl Chunker {
    /// Normalize `text`. Empty or whitespace-only input is a validation error.
    pub fn new(text: &str) -> Result<Self> {
        let normalized = normalize_whitespace(text);
        if normalized.is_empty() {
            return Err(StreamError::validation("Text cannot be empty"));
        }
        Ok(Self {
            chars: normalized.chars().collect(),
            pos: 0,
            next_index: 0,
            glue_next: false,
        })
    }

    pub fn is_done(&self) -> bool {
        self.pos >= self.chars.len()
    }

    pub fn remaining_chars(&self) -> usize {
        self.chars.len().saturating_sub(self.pos)
    }

    /// Next chunk of at most `max_chars` characters, or `None` once all text
    /// has been emitted.
    pub fn next_chunk(&mut self, max_chars: usize) -> Result<Option<Chunk>> {
        if max_chars == 0 {
            return Err(StreamError::validation("max_chars must be positive"));
        }
        if self.is_done() {
            return Ok(None);
        }

        let rest = &self.chars[self.pos..];
        let sentence_len = sentence_end(rest);

        let (take, hard_split) = if sentence_len <= max_chars {
            (sentence_len, false)
        } else {
            // A space at index `max_chars` still leaves whole words in front of it.
            match rest[..=max_chars].iter().rposition(|c| *c == ' ') {
                Some(space) if space > 0 => (space, false),
                _ => (max_chars, true),
            }
        };

        Ok(Some(self.emit(take, hard_split)))
    }

    /// Everything not yet emitted as one chunk (chunking disabled).
    pub fn rest(&mut self) -> Option<Chunk> {
        if self.is_done() {
            return None;
        }
        let take = self.remaining_chars();
        Some(self.emit(take, false))
    }

    fn emit(&mut self, take: usize, hard_split: bool) -> Chunk {
        let text: String = self.chars[self.pos..self.pos + take].iter().collect();
        self.pos += take;
        if !hard_split && self.pos < self.chars.len() && self.chars[self.pos] == ' ' {
            self.pos += 1;
        }

        let chunk = Chunk {
            index: self.next_index,
            text,
            is_last: self.is_done(),
            joins_previous: self.glue_next,
        };
        self.next_index += 1;
        self.glue_next = hard_split;
        chunk
    }
}

/// Length of the first sentence in `chars`: up to and including a run of
/// terminators (plus closing quotes/brackets) that is followed by a space or
/// the end of the text.
fn sentence_end(chars: &[char]) -> usize {
    let n = chars.len();
    let mut i = 0;
    while i < n {
        if TERMINATORS.contains(&chars[i]) {
            let mut j = i + 1;
            while j < n && (TERMINATORS.contains(&chars[j]) || CLOSERS.contains(&chars[j])) {
                j += 1;
            }
            if j == n || chars[j] == ' ' {
                return j;
            }
            i = j;
        } else {
            i += 1;
        }
    }
    n
}

/// Split `text` into chunks of at most `max_chars` characters.
pub fn split(text: &str, max_chars: usize) -> Result<Vec<Chunk>> {
    if max_chars == 0 {
        return Err(StreamError::validation("max_chars must be positive"));
    }
    let mut chunker = Chunker::new(text)?;
    let mut chunks = Vec::new();
    while let Some(chunk) = chunker.next_chunk(max_chars)? {
        chunks.push(chunk);
    }
    Ok(chunks)
}

/// Chunking disabled: exactly one chunk holding the normalized text.
pub fn split_whole(text: &str) -> Result<Vec<Chunk>> {
    let mut chunker = Chunker::new(text)?;
    Ok(chunker.rest().into_iter().collect())
}

/// Rebuild the normalized text from its chunks.
pub fn rejoin(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        if i > 0 && !chunk.joins_previous {
            out.push(' ');
        }
        out.push_str(&chunk.text);
    }
    out
}
