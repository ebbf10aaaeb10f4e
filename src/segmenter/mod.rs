//! Streaming text segmentation for low-latency synthesis.
//!
//! Language model fragments are pushed into a [`StreamingSegmenter`] as they
//! arrive. The first segment of a reply is cut aggressively so the caller
//! hears something quickly; later segments wait for whole sentences. Segment
//! text is kept exactly as produced, so joining every emitted segment gives
//! back the reply (minus any dropped noise).

mod boundary;

use crate::config::SegmenterConfig;
use boundary::{
    absorb_closers, first_strong, first_weak, last_short_word, last_whitespace,
    meaningful_chars, nearest, strong_positions, weak_positions, whitespace_positions,
};

/// Pieces with fewer letters or digits than this are noise.
const MIN_MEANINGFUL: usize = 2;

/// A synthesis-ready chunk of reply text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    /// Raw text, including any leading whitespace carried from the reply.
    pub text: String,
    /// Position within the reply, starting at 0.
    pub index: usize,
    /// Whether this is the final segment of the reply.
    pub is_last: bool,
    /// Synthesis priority; lower is earlier.
    pub priority: u32,
}

impl TextSegment {
    fn new(text: String, index: usize, is_last: bool) -> Self {
        Self {
            text,
            index,
            is_last,
            priority: u32::try_from(index).unwrap_or(u32::MAX),
        }
    }

    /// Text with surrounding whitespace removed, as sent to the synthesizer.
    pub fn speakable(&self) -> &str {
        self.text.trim()
    }
}

/// Incremental segmenter for one reply.
#[derive(Debug, Clone)]
pub struct StreamingSegmenter {
    config: SegmenterConfig,
    buffer: String,
    next_index: usize,
}

impl StreamingSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
            next_index: 0,
        }
    }

    /// Append a model fragment and return every segment that became ready.
    pub fn push(&mut self, fragment: &str) -> Vec<TextSegment> {
        self.buffer.push_str(fragment);
        let mut ready = Vec::new();
        while let Some(cut) = self.next_cut() {
            let piece = self.take_chars(cut);
            if self.next_index > 0 && meaningful_chars(&piece) < MIN_MEANINGFUL {
                tracing::trace!(piece = %piece, "dropping noise segment");
                continue;
            }
            ready.push(TextSegment::new(piece, self.next_index, false));
            self.next_index += 1;
        }
        ready
    }

    /// Flush the remainder when the model stream closes.
    ///
    /// Returns `None` when the remainder is empty, whitespace, or noise
    /// following an earlier segment.
    pub fn finish(&mut self) -> Option<TextSegment> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.trim().is_empty() {
            return None;
        }
        if self.next_index > 0 && meaningful_chars(&rest) < MIN_MEANINGFUL {
            tracing::trace!(piece = %rest, "dropping trailing noise");
            return None;
        }
        let seg = TextSegment::new(rest, self.next_index, true);
        self.next_index += 1;
        Some(seg)
    }

    /// Discard buffered text and start a new reply.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.next_index = 0;
    }

    /// Segments emitted so far for this reply.
    pub fn emitted(&self) -> usize {
        self.next_index
    }

    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    /// Number of leading chars to cut, if a segment is ready.
    fn next_cut(&self) -> Option<usize> {
        let chars: Vec<char> = self.buffer.chars().collect();
        let end = if self.next_index == 0 {
            self.first_boundary(&chars)?
        } else {
            self.sentence_boundary(&chars)?
        };
        Some(absorb_closers(&chars, end) + 1)
    }

    /// Aggressive first cut: weak punctuation, strong punctuation, a short
    /// trailing word, whitespace, then a hard cut. The last three only
    /// apply once the buffer has reached `first_max_chars`, otherwise more
    /// text may still bring punctuation.
    fn first_boundary(&self, chars: &[char]) -> Option<usize> {
        let min = self.config.first_min_chars;
        let max = self.config.first_max_chars.max(min);
        if chars.len() < min {
            return None;
        }
        let window = chars.len().min(max);
        if let Some(i) = first_weak(chars, window, MIN_MEANINGFUL) {
            return Some(i);
        }
        if let Some(i) = first_strong(chars, window, 1, MIN_MEANINGFUL) {
            return Some(i);
        }
        if chars.len() < max {
            return None;
        }
        last_short_word(chars, window, MIN_MEANINGFUL)
            .or_else(|| last_whitespace(chars, window, MIN_MEANINGFUL))
            .or(Some(max - 1))
    }

    /// Sentence-mode cut: the first sentence end with at least `min_chars`,
    /// or, once the buffer reaches `max_chars`, the boundary nearest the
    /// midpoint.
    fn sentence_boundary(&self, chars: &[char]) -> Option<usize> {
        let min = self.config.min_chars;
        if let Some(i) = first_strong(chars, chars.len(), min, MIN_MEANINGFUL) {
            return Some(i);
        }
        if chars.len() < self.config.max_chars.max(min) {
            return None;
        }
        let mid = chars.len() / 2;
        // Cutting at the final char would leave nothing to split.
        let inner = |i: &usize| *i + 1 < chars.len();
        nearest(strong_positions(chars).filter(inner), mid)
            .or_else(|| nearest(weak_positions(chars).filter(inner), mid))
            .or_else(|| nearest(whitespace_positions(chars).filter(inner), mid))
            .or(Some(mid))
    }

    /// Remove and return the first `n` chars of the buffer.
    fn take_chars(&mut self, n: usize) -> String {
        let byte = self
            .buffer
            .char_indices()
            .nth(n)
            .map_or(self.buffer.len(), |(b, _)| b);
        let rest = self.buffer.split_off(byte);
        std::mem::replace(&mut self.buffer, rest)
    }
}

/// Segment a complete reply in one call. The final segment is marked last.
pub fn segment(text: &str, config: &SegmenterConfig) -> Vec<TextSegment> {
    let mut segmenter = StreamingSegmenter::new(config.clone());
    let mut out = segmenter.push(text);
    match segmenter.finish() {
        Some(last) => out.push(last),
        None => {
            if let Some(last) = out.last_mut() {
                last.is_last = true;
            }
        }
    }
    out
}
