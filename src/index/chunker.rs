//! Splits document text into retrieval-sized chunks.
//!
//! Chunks are packed from paragraph units first, falling back to
//! sentence units and finally to hard character windows for text with
//! no usable boundaries. The walk is a pure function of its input, so
//! a restarted index run produces identical chunks.

const APPROX_CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    pub target_tokens: usize,
    pub max_tokens: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            target_tokens: 450,
            max_tokens: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPiece {
    pub index: usize,
    pub text: String,
    pub token_count: usize,
}

/// Rough corpus heuristic: ~4 characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    chars.div_ceil(APPROX_CHARS_PER_TOKEN)
}

pub fn chunk_text(text: &str, limits: ChunkLimits) -> ChunkIter<'_> {
    ChunkIter {
        text,
        units: segment_units(text, limits.max_tokens),
        cursor: 0,
        next_index: 0,
        limits,
    }
}

/// Lazy chunk sequence over precomputed unit boundaries. Chunk strings
/// are only materialized as the iterator advances.
#[derive(Debug, Clone)]
pub struct ChunkIter<'a> {
    text: &'a str,
    units: Vec<Unit>,
    cursor: usize,
    next_index: usize,
    limits: ChunkLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Unit {
    start: usize,
    end: usize,
    tokens: usize,
}

impl Iterator for ChunkIter<'_> {
    type Item = ChunkPiece;

    fn next(&mut self) -> Option<ChunkPiece> {
        if self.cursor >= self.units.len() {
            return None;
        }

        let first = self.units[self.cursor];
        let mut last = first;
        let mut tokens = first.tokens;
        self.cursor += 1;

        while self.cursor < self.units.len() && tokens < self.limits.target_tokens {
            let candidate = self.units[self.cursor];
            if tokens + candidate.tokens > self.limits.max_tokens {
                break;
            }
            tokens += candidate.tokens;
            last = candidate;
            self.cursor += 1;
        }

        // Chunks are spans of the original text, so source whitespace
        // and punctuation survive verbatim.
        let span = self.text[first.start..last.end].trim();
        let piece = ChunkPiece {
            index: self.next_index,
            text: span.to_string(),
            token_count: estimate_tokens(span),
        };
        self.next_index += 1;
        Some(piece)
    }
}

fn segment_units(text: &str, max_tokens: usize) -> Vec<Unit> {
    let mut units = Vec::new();
    for (start, end) in paragraph_ranges(text) {
        let tokens = estimate_tokens(&text[start..end]);
        if tokens <= max_tokens {
            units.push(Unit { start, end, tokens });
            continue;
        }
        for (s_start, s_end) in sentence_ranges(text, start, end) {
            let s_tokens = estimate_tokens(&text[s_start..s_end]);
            if s_tokens <= max_tokens {
                units.push(Unit {
                    start: s_start,
                    end: s_end,
                    tokens: s_tokens,
                });
                continue;
            }
            for (h_start, h_end) in hard_ranges(text, s_start, s_end, max_tokens) {
                units.push(Unit {
                    start: h_start,
                    end: h_end,
                    tokens: estimate_tokens(&text[h_start..h_end]),
                });
            }
        }
    }
    units
}

/// Maximal runs of non-blank lines, as byte ranges into `text`.
fn paragraph_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut offset = 0;
    let mut current: Option<(usize, usize)> = None;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        if line.trim().is_empty() {
            if let Some(range) = current.take() {
                ranges.push(range);
            }
            continue;
        }
        let line_end = line_start + line.trim_end_matches('\n').len();
        current = Some(match current {
            Some((start, _)) => (start, line_end),
            None => (line_start, line_end),
        });
    }
    if let Some(range) = current {
        ranges.push(range);
    }
    ranges
}

/// Sentence boundaries within `[start, end)`: a terminator ('.', '!',
/// '?') followed by whitespace, or a line break.
fn sentence_ranges(text: &str, start: usize, end: usize) -> Vec<(usize, usize)> {
    let slice = &text[start..end];
    let mut ranges = Vec::new();
    let mut sentence_start = start;
    let mut prev: Option<(usize, char)> = None;

    for (byte_idx, ch) in slice.char_indices() {
        let absolute = start + byte_idx;
        let after_terminator = matches!(prev, Some((_, '.' | '!' | '?')));
        if (ch.is_whitespace() && after_terminator) || ch == '\n' {
            if sentence_start < absolute {
                ranges.push((sentence_start, absolute));
            }
            sentence_start = absolute + ch.len_utf8();
        }
        prev = Some((absolute, ch));
    }
    if sentence_start < end {
        ranges.push((sentence_start, end));
    }
    ranges
}

/// Fixed character windows for boundary-free text, cut on char
/// boundaries.
fn hard_ranges(text: &str, start: usize, end: usize, max_tokens: usize) -> Vec<(usize, usize)> {
    let max_chars = max_tokens * APPROX_CHARS_PER_TOKEN;
    let mut ranges = Vec::new();
    let mut window_start = start;
    let mut chars_in_window = 0;

    for (byte_idx, _) in text[start..end].char_indices() {
        if chars_in_window == max_chars {
            let absolute = start + byte_idx;
            ranges.push((window_start, absolute));
            window_start = absolute;
            chars_in_window = 0;
        }
        chars_in_window += 1;
    }
    if window_start < end {
        ranges.push((window_start, end));
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(target: usize, max: usize) -> ChunkLimits {
        ChunkLimits {
            target_tokens: target,
            max_tokens: max,
        }
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let pieces: Vec<ChunkPiece> =
            chunk_text("one short paragraph", ChunkLimits::default()).collect();
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].index, 0);
        assert_eq!(pieces[0].text, "one short paragraph");
    }

    #[test]
    fn empty_and_blank_text_yield_no_chunks() {
        assert_eq!(chunk_text("", ChunkLimits::default()).count(), 0);
        assert_eq!(chunk_text("  \n\n  \n", ChunkLimits::default()).count(), 0);
    }

    #[test]
    fn paragraphs_pack_up_to_the_target_without_crossing_max() {
        // Each paragraph is ~25 tokens (100 chars).
        let paragraph = "x".repeat(100);
        let text = vec![paragraph; 8].join("\n\n");
        let pieces: Vec<ChunkPiece> = chunk_text(&text, limits(50, 60)).collect();
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(piece.token_count <= 60, "chunk over max: {}", piece.token_count);
        }
    }

    #[test]
    fn oversized_paragraph_splits_on_sentence_boundaries() {
        let sentence = format!("{}. ", "word ".repeat(30).trim_end());
        let text = sentence.repeat(12);
        let pieces: Vec<ChunkPiece> = chunk_text(&text, limits(60, 70)).collect();
        assert!(pieces.len() > 1);
        for piece in &pieces[..pieces.len() - 1] {
            assert!(piece.text.ends_with('.'), "mid-sentence cut: {:?}", piece.text);
        }
    }

    #[test]
    fn boundary_free_text_hard_splits_on_char_windows() {
        let text = "a".repeat(5000);
        let pieces: Vec<ChunkPiece> = chunk_text(&text, limits(100, 120)).collect();
        assert!(pieces.len() > 1);
        for piece in &pieces {
            assert!(piece.token_count <= 120);
        }
        let total: usize = pieces.iter().map(|piece| piece.text.len()).sum();
        assert_eq!(total, 5000);
    }

    #[test]
    fn restarting_the_walk_reproduces_identical_chunks() {
        let text = "First sentence. Second sentence.\n\nAnother paragraph here.";
        let first: Vec<ChunkPiece> = chunk_text(text, ChunkLimits::default()).collect();
        let second: Vec<ChunkPiece> = chunk_text(text, ChunkLimits::default()).collect();
        assert_eq!(first, second);
    }
}
