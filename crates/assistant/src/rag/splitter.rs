use std::collections::VecDeque;
use tracing::warn;

use crate::{Error, Result};

/// Separators tried in priority order: paragraph, line, word, character.
pub const DEFAULT_SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Recursive character splitter.
///
/// Text is split on the largest separator present, pieces that are still too
/// long are split again with the next separator, and the resulting small
/// pieces are merged back into chunks of at most `chunk_size` characters.
/// Each chunk after the first starts with up to `chunk_overlap` characters
/// carried over from the end of the previous one. Lengths count chars, not
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::Config("chunk size must be positive".to_string()));
        }
        if chunk_overlap >= chunk_size {
            return Err(Error::Config(format!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                chunk_overlap, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &DEFAULT_SEPARATORS)
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let mut separator = "";
        let mut remaining: &[&str] = &[];
        for (i, sep) in separators.iter().enumerate() {
            if sep.is_empty() {
                break;
            }
            if text.contains(sep) {
                separator = sep;
                remaining = &separators[i + 1..];
                break;
            }
        }

        let pieces: Vec<&str> = if separator.is_empty() {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split(separator).filter(|piece| !piece.is_empty()).collect()
        };

        let mut chunks = Vec::new();
        let mut short_pieces: Vec<&str> = Vec::new();

        for piece in pieces {
            if char_len(piece) < self.chunk_size {
                short_pieces.push(piece);
                continue;
            }

            if !short_pieces.is_empty() {
                chunks.extend(self.merge_pieces(&short_pieces, separator));
                short_pieces.clear();
            }

            if remaining.is_empty() {
                if let Some(chunk) = trimmed(piece) {
                    chunks.push(chunk);
                }
            } else {
                chunks.extend(self.split_recursive(piece, remaining));
            }
        }

        if !short_pieces.is_empty() {
            chunks.extend(self.merge_pieces(&short_pieces, separator));
        }

        chunks
    }

    /// Greedily join pieces with `separator` into chunks, keeping an overlap window.
    fn merge_pieces(&self, pieces: &[&str], separator: &str) -> Vec<String> {
        let separator_len = char_len(separator);
        let mut chunks = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for &piece in pieces {
            let len = char_len(piece);
            let joiner = |window: &VecDeque<&str>| if window.is_empty() { 0 } else { separator_len };

            if total + len + joiner(&window) > self.chunk_size {
                if total > self.chunk_size {
                    warn!(
                        "Created a chunk of size {}, which is longer than the specified {}",
                        total, self.chunk_size
                    );
                }

                if !window.is_empty() {
                    if let Some(chunk) = join_window(&window, separator) {
                        chunks.push(chunk);
                    }

                    // Drop pieces from the front until only the overlap remains
                    // and the next piece fits.
                    while total > self.chunk_overlap
                        || (total > 0 && total + len + joiner(&window) > self.chunk_size)
                    {
                        let Some(first) = window.pop_front() else {
                            break;
                        };
                        let dropped = char_len(first) + if window.is_empty() { 0 } else { separator_len };
                        total = total.saturating_sub(dropped);
                    }
                }
            }

            window.push_back(piece);
            total += len + if window.len() > 1 { separator_len } else { 0 };
        }

        if let Some(chunk) = join_window(&window, separator) {
            chunks.push(chunk);
        }

        chunks
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn trimmed(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

fn join_window(window: &VecDeque<&str>, separator: &str) -> Option<String> {
    let pieces: Vec<&str> = window.iter().copied().collect();
    trimmed(&pieces.join(separator))
}
