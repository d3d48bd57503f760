//! Immutable byte strings.
//!
//! Strings are raw byte sequences (no Unicode awareness). The hash is computed
//! lazily and cached in the payload, since strings are the keys of every namespace
//! and method dictionary.

use std::{cell::Cell, cmp::Ordering};

/// Heap payload of `str`.
#[derive(Debug, Default)]
pub(crate) struct Str {
    bytes: Vec<u8>,
    hash: Cell<Option<i64>>,
}

impl Str {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            hash: Cell::new(None),
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Lossy UTF-8 view, used for names and messages.
    #[must_use]
    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    /// Returns the cached hash, computing it on first use.
    #[must_use]
    pub fn hash(&self) -> i64 {
        if let Some(h) = self.hash.get() {
            return h;
        }
        let h = hash_bytes(&self.bytes);
        self.hash.set(Some(h));
        h
    }

    #[must_use]
    pub fn cmp_bytes(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }

    /// Estimated size for resource accounting.
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.bytes.len()
    }
}

impl From<&str> for Str {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes().to_vec())
    }
}

/// The string hash: `x = b[0] << 7`, then `x = (1000003 * x) ^ byte` per byte, `x ^= len`.
///
/// Wrapping 64-bit arithmetic; `-1` is reserved as an error marker and maps to `-2`.
#[must_use]
pub(crate) fn hash_bytes(bytes: &[u8]) -> i64 {
    let Some(&first) = bytes.first() else {
        return 0;
    };
    let mut x = i64::from(first) << 7;
    for &b in bytes {
        x = 1_000_003_i64.wrapping_mul(x) ^ i64::from(b);
    }
    x ^= bytes.len() as i64;
    if x == -1 { -2 } else { x }
}

// ============================================================================
// Searching
// ============================================================================

/// Direction of a substring search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchDir {
    Forward,
    Reverse,
}

/// Bloom-mask bit for a byte.
#[inline]
fn bloom_bit(b: u8) -> u64 {
    1u64 << (b & 63)
}

/// Finds `pattern` in `haystack`, returning the offset of the first (or last) match.
///
/// - empty pattern matches at the start (forward) or the end (reverse)
/// - one-byte patterns use a plain byte scan
/// - a pattern as long as the haystack is an equality test
/// - otherwise a Boyer-Moore-Horspool style search skipping on the last pattern byte,
///   with a 64-bit bloom mask over the pattern to skip whole windows
#[must_use]
pub(crate) fn find(haystack: &[u8], pattern: &[u8], dir: SearchDir) -> Option<usize> {
    let n = haystack.len();
    let m = pattern.len();
    if m == 0 {
        return Some(match dir {
            SearchDir::Forward => 0,
            SearchDir::Reverse => n,
        });
    }
    if m > n {
        return None;
    }
    if m == 1 {
        let needle = pattern[0];
        return match dir {
            SearchDir::Forward => haystack.iter().position(|&b| b == needle),
            SearchDir::Reverse => haystack.iter().rposition(|&b| b == needle),
        };
    }
    if m == n {
        return (haystack == pattern).then_some(0);
    }
    match dir {
        SearchDir::Forward => bm_forward(haystack, pattern),
        SearchDir::Reverse => bm_reverse(haystack, pattern),
    }
}

fn bm_forward(s: &[u8], p: &[u8]) -> Option<usize> {
    let n = s.len();
    let m = p.len();
    let mlast = m - 1;
    let last = p[mlast];
    let mut mask = 0u64;
    // distance from the last occurrence of `last` (excluding the final byte) to the end
    let mut skip = mlast.saturating_sub(1);
    for (j, &b) in p[..mlast].iter().enumerate() {
        mask |= bloom_bit(b);
        if b == last {
            skip = mlast - j - 1;
        }
    }
    mask |= bloom_bit(last);

    let w = n - m;
    let mut i = 0;
    while i <= w {
        if s[i + mlast] == last {
            if s[i..i + mlast] == p[..mlast] {
                return Some(i);
            }
            if i + m < n && mask & bloom_bit(s[i + m]) == 0 {
                i += m;
            } else {
                i += skip;
            }
        } else if i + m < n && mask & bloom_bit(s[i + m]) == 0 {
            i += m;
        }
        i += 1;
    }
    None
}

fn bm_reverse(s: &[u8], p: &[u8]) -> Option<usize> {
    let n = s.len();
    let m = p.len();
    let mlast = m - 1;
    let first = p[0];
    let mut mask = bloom_bit(first);
    let mut skip = mlast.saturating_sub(1);
    for j in (1..m).rev() {
        mask |= bloom_bit(p[j]);
        if p[j] == first {
            skip = j - 1;
        }
    }

    let mut i = (n - m) as isize;
    while i >= 0 {
        let iu = i as usize;
        if s[iu] == first {
            if s[iu + 1..iu + m] == p[1..] {
                return Some(iu);
            }
            if iu > 0 && mask & bloom_bit(s[iu - 1]) == 0 {
                i -= m as isize;
            } else {
                i -= skip as isize;
            }
        } else if iu > 0 && mask & bloom_bit(s[iu - 1]) == 0 {
            i -= m as isize;
        }
        i -= 1;
    }
    None
}

/// Resolves optional `start`/`end` arguments against a length, Python slice style.
#[must_use]
pub(crate) fn clamp_range(len: usize, start: Option<i64>, end: Option<i64>) -> (usize, usize) {
    let resolve = |v: i64| -> usize {
        if v < 0 {
            (len as i64 + v).max(0) as usize
        } else {
            (v as usize).min(len)
        }
    };
    (start.map_or(0, resolve), end.map_or(len, resolve))
}

/// Justification mode for `ljust`/`rjust`/`center`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Justify {
    Left,
    Right,
    Center,
}

/// Pads `bytes` to `width` with `fill`; `None` when it is already wide enough, in which
/// case the caller returns the original object.
#[must_use]
pub(crate) fn justify(bytes: &[u8], width: usize, fill: u8, mode: Justify) -> Option<Vec<u8>> {
    if bytes.len() >= width {
        return None;
    }
    let pad = width - bytes.len();
    let (left, right) = match mode {
        Justify::Left => (0, pad),
        Justify::Right => (pad, 0),
        // with odd padding the extra byte goes left only when the width is odd
        Justify::Center => {
            let left = pad / 2 + (pad & width & 1);
            (left, pad - left)
        }
    };
    let mut out = Vec::with_capacity(width);
    out.resize(left, fill);
    out.extend_from_slice(bytes);
    out.resize(left + bytes.len() + right, fill);
    Some(out)
}

/// Appends the `repr` of a byte string, choosing the quote like Python 2.
pub(crate) fn repr_bytes(bytes: &[u8], out: &mut String) {
    let quote = if bytes.contains(&b'\'') && !bytes.contains(&b'"') {
        '"'
    } else {
        '\''
    };
    out.push(quote);
    for &b in bytes {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b'\'' if quote == '\'' => out.push_str("\\'"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                use std::fmt::Write;
                let _ = write!(out, "\\x{b:02x}");
            }
        }
    }
    out.push(quote);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(s: &[u8], p: &[u8], dir: SearchDir) -> Option<usize> {
        if p.is_empty() {
            return Some(if dir == SearchDir::Forward { 0 } else { s.len() });
        }
        if p.len() > s.len() {
            return None;
        }
        let mut hits = (0..=s.len() - p.len()).filter(|&i| &s[i..i + p.len()] == p);
        match dir {
            SearchDir::Forward => hits.next(),
            SearchDir::Reverse => hits.last(),
        }
    }

    #[test]
    fn one_byte_pattern_matches_position() {
        let s = b"hello world";
        assert_eq!(find(s, b"o", SearchDir::Forward), Some(4));
        assert_eq!(find(s, b"o", SearchDir::Reverse), Some(7));
        assert_eq!(find(s, b"z", SearchDir::Forward), None);
    }

    #[test]
    fn full_length_pattern_is_equality() {
        assert_eq!(find(b"abc", b"abc", SearchDir::Forward), Some(0));
        assert_eq!(find(b"abc", b"abd", SearchDir::Reverse), None);
    }

    #[test]
    fn empty_pattern_matches_at_the_ends() {
        assert_eq!(find(b"abc", b"", SearchDir::Forward), Some(0));
        assert_eq!(find(b"abc", b"", SearchDir::Reverse), Some(3));
    }

    #[test]
    fn boyer_moore_agrees_with_naive_scan() {
        // deterministic xorshift so failures are reproducible
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };
        for _ in 0..2000 {
            let n = (next() % 40) as usize;
            let m = (next() % 6) as usize + 2;
            let s: Vec<u8> = (0..n).map(|_| b'a' + (next() % 3) as u8).collect();
            let p: Vec<u8> = (0..m).map(|_| b'a' + (next() % 3) as u8).collect();
            for dir in [SearchDir::Forward, SearchDir::Reverse] {
                assert_eq!(find(&s, &p, dir), naive(&s, &p, dir), "s={s:?} p={p:?} dir={dir:?}");
            }
        }
    }

    #[test]
    fn hash_matches_reference_values() {
        assert_eq!(hash_bytes(b""), 0);
        // hash('a') in a 64-bit CPython 2 build
        assert_eq!(hash_bytes(b"a"), 12_416_037_344);
        assert_eq!(Str::from("abc").hash(), hash_bytes(b"abc"));
    }

    #[test]
    fn justify_pads_and_reports_no_change() {
        assert_eq!(justify(b"ab", 5, b'*', Justify::Left), Some(b"ab***".to_vec()));
        assert_eq!(justify(b"ab", 5, b'*', Justify::Right), Some(b"***ab".to_vec()));
        assert_eq!(justify(b"ab", 5, b'*', Justify::Center), Some(b"**ab*".to_vec()));
        assert_eq!(justify(b"a", 4, b' ', Justify::Center), Some(b" a  ".to_vec()));
        assert_eq!(justify(b"abc", 2, b' ', Justify::Center), None);
    }

    #[test]
    fn repr_escapes_and_picks_quotes() {
        let mut out = String::new();
        repr_bytes(b"it's\n", &mut out);
        assert_eq!(out, "\"it's\\n\"");
        out.clear();
        repr_bytes(b"a'\"", &mut out);
        assert_eq!(out, "'a\\'\"'");
    }
}
