//! Character-level boundary classification.
//!
//! All positions are char indices into a `&[char]` view of the buffer. A
//! boundary at `i` means the segment ends after `chars[i]`.

/// Clause punctuation.
pub(crate) fn is_weak_punct(c: char) -> bool {
    matches!(
        c,
        ',' | ';' | ':' | '\u{2014}' | '\u{2013}' | '，' | '、' | '；' | '：'
    )
}

/// Sentence-ending punctuation.
pub(crate) fn is_strong_punct(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '\n' | '。' | '！' | '？' | '…')
}

/// Quotes and brackets that belong to the sentence they close.
fn is_closer(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | ']' | '”' | '’' | '」' | '』' | '）')
}

/// Letters and digits in any script.
pub(crate) fn meaningful_chars(text: &str) -> usize {
    text.chars().filter(|c| c.is_alphanumeric()).count()
}

fn meaningful_prefix(chars: &[char], end: usize) -> usize {
    chars[..=end].iter().filter(|c| c.is_alphanumeric()).count()
}

/// ASCII punctuation counts only once the next char shows it ends a clause
/// (whitespace or a closing quote). "3.5" and "1,000" never qualify, and a
/// mark at the end of the buffer waits for the next fragment.
fn ascii_punct_ok(chars: &[char], i: usize) -> bool {
    chars
        .get(i + 1)
        .is_some_and(|next| next.is_whitespace() || is_closer(*next))
}

fn boundary_ok(chars: &[char], i: usize) -> bool {
    if chars[i].is_ascii() && chars[i] != '\n' {
        ascii_punct_ok(chars, i)
    } else {
        true
    }
}

/// Extend a boundary over any closing quotes or brackets that follow it.
pub(crate) fn absorb_closers(chars: &[char], mut i: usize) -> usize {
    while let Some(&next) = chars.get(i + 1) {
        if !is_closer(next) {
            break;
        }
        i += 1;
    }
    i
}

/// First weak boundary in `chars[..limit]` whose prefix has at least
/// `min_meaningful` letters or digits.
pub(crate) fn first_weak(chars: &[char], limit: usize, min_meaningful: usize) -> Option<usize> {
    (0..limit.min(chars.len())).find(|&i| {
        is_weak_punct(chars[i]) && boundary_ok(chars, i) && meaningful_prefix(chars, i) >= min_meaningful
    })
}

/// First strong boundary in `chars[..limit]` whose prefix has at least
/// `min_len` chars and `min_meaningful` letters or digits.
pub(crate) fn first_strong(
    chars: &[char],
    limit: usize,
    min_len: usize,
    min_meaningful: usize,
) -> Option<usize> {
    (0..limit.min(chars.len())).find(|&i| {
        is_strong_punct(chars[i])
            && i + 1 >= min_len
            && boundary_ok(chars, i)
            && meaningful_prefix(chars, i) >= min_meaningful
    })
}

/// Short words after which a spoken pause sounds natural.
const SHORT_WORDS: &[&str] = &[
    "ok", "okay", "so", "and", "but", "or", "then", "well", "yes", "yeah", "no", "sure", "hi",
    "hey", "hello", "right", "now", "alright",
];

/// Sentence-final particles in CJK text, which has no spaces to split on.
const CJK_PARTICLES: &[char] = &['的', '了', '吗', '呢', '吧', '啊', '呀', '嗯', '哦', '嘛'];

/// Last recognized short-word boundary in `chars[..limit]`.
pub(crate) fn last_short_word(chars: &[char], limit: usize, min_meaningful: usize) -> Option<usize> {
    let limit = limit.min(chars.len());
    (0..limit).rev().find(|&i| {
        if meaningful_prefix(chars, i) < min_meaningful {
            return false;
        }
        if CJK_PARTICLES.contains(&chars[i]) {
            return i + 1 < chars.len();
        }
        if !chars[i].is_alphabetic() || !chars.get(i + 1).is_some_and(|c| c.is_whitespace()) {
            return false;
        }
        let start = (0..=i)
            .rev()
            .take_while(|&j| chars[j].is_alphabetic())
            .last()
            .unwrap_or(i);
        let word: String = chars[start..=i].iter().flat_map(|c| c.to_lowercase()).collect();
        SHORT_WORDS.contains(&word.as_str())
    })
}

/// Last whitespace in `chars[..limit]` whose prefix is meaningful.
pub(crate) fn last_whitespace(chars: &[char], limit: usize, min_meaningful: usize) -> Option<usize> {
    (0..limit.min(chars.len()))
        .rev()
        .find(|&i| chars[i].is_whitespace() && meaningful_prefix(chars, i) >= min_meaningful)
}

/// Index from `candidates` nearest to `target`, preferring the earlier on ties.
pub(crate) fn nearest(candidates: impl Iterator<Item = usize>, target: usize) -> Option<usize> {
    candidates.min_by_key(|&i| (i.abs_diff(target), i))
}

/// All strong boundaries in `chars` that pass the ASCII rules.
pub(crate) fn strong_positions(chars: &[char]) -> impl Iterator<Item = usize> + '_ {
    (0..chars.len()).filter(|&i| is_strong_punct(chars[i]) && boundary_ok(chars, i))
}

/// All weak boundaries in `chars` that pass the ASCII rules.
pub(crate) fn weak_positions(chars: &[char]) -> impl Iterator<Item = usize> + '_ {
    (0..chars.len()).filter(|&i| is_weak_punct(chars[i]) && boundary_ok(chars, i))
}

pub(crate) fn whitespace_positions(chars: &[char]) -> impl Iterator<Item = usize> + '_ {
    (0..chars.len()).filter(|&i| chars[i].is_whitespace())
}
