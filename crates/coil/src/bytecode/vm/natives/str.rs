//! `str` construction and methods. Strings are byte strings, as in Python 2.

use super::super::VM;
use crate::{
    args::ArgValues,
    exception_private::{ExcType, RunResult},
    heap::DropWithHeap,
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{
        Int,
        str::{Justify, SearchDir, clamp_range, find, justify},
    },
    value::Value,
};

/// Splits on runs of ASCII whitespace, at most `max_splits` times.
fn split_whitespace(bytes: &[u8], max_splits: Option<usize>) -> Vec<&[u8]> {
    let mut parts = Vec::new();
    let mut rest = bytes;
    loop {
        let start = rest.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(rest.len());
        rest = &rest[start..];
        if rest.is_empty() {
            break;
        }
        if max_splits.is_some_and(|max| parts.len() >= max) {
            // the remainder keeps its trailing whitespace
            parts.push(rest);
            break;
        }
        let end = rest.iter().position(u8::is_ascii_whitespace).unwrap_or(rest.len());
        parts.push(&rest[..end]);
        rest = &rest[end..];
    }
    parts
}

/// Splits on every occurrence of `sep`, at most `max_splits` times.
fn split_on<'a>(bytes: &'a [u8], sep: &[u8], max_splits: Option<usize>) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut rest = bytes;
    while max_splits.is_none_or(|max| parts.len() < max) {
        let Some(at) = find(rest, sep, SearchDir::Forward) else {
            break;
        };
        parts.push(&rest[..at]);
        rest = &rest[at + sep.len()..];
    }
    parts.push(rest);
    parts
}

/// Replaces the first `count` occurrences of `old` (all of them when `None`).
fn replace_bytes(bytes: &[u8], old: &[u8], new: &[u8], count: Option<usize>) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut rest = bytes;
    let mut done = 0;
    if old.is_empty() {
        // an empty pattern matches before every byte and at the end
        for &b in bytes {
            if count.is_some_and(|max| done >= max) {
                out.push(b);
                continue;
            }
            out.extend_from_slice(new);
            out.push(b);
            done += 1;
        }
        if count.is_none_or(|max| done < max) {
            out.extend_from_slice(new);
        }
        return out;
    }
    while count.is_none_or(|max| done < max) {
        let Some(at) = find(rest, old, SearchDir::Forward) else {
            break;
        };
        out.extend_from_slice(&rest[..at]);
        out.extend_from_slice(new);
        rest = &rest[at + old.len()..];
        done += 1;
    }
    out.extend_from_slice(rest);
    out
}

fn strip_bytes<'a>(bytes: &'a [u8], chars: Option<&[u8]>) -> &'a [u8] {
    let keep = |b: &u8| match chars {
        Some(chars) => !chars.contains(b),
        None => !b.is_ascii_whitespace(),
    };
    let start = bytes.iter().position(keep).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(keep).map_or(start, |i| i + 1);
    &bytes[start..end]
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// The bytes of `this`, which must be a `str`.
    fn this_bytes(&self, this: &Value, method: &str) -> RunResult<Vec<u8>> {
        self.heap.str_bytes(this).map(<[u8]>::to_vec).ok_or_else(|| {
            ExcType::type_error(format!(
                "descriptor '{method}' requires a 'str' object but received a '{}'",
                self.type_name(this)
            ))
        })
    }

    /// The bytes of a string argument.
    fn str_arg(&self, value: &Value, method: &str) -> RunResult<Vec<u8>> {
        self.heap.str_bytes(value).map(<[u8]>::to_vec).ok_or_else(|| {
            ExcType::type_error(format!(
                "{method}() argument must be str, not {}",
                self.type_name(value)
            ))
        })
    }

    /// An optional integer argument where `None` means absent.
    pub(super) fn opt_index(&self, value: Option<&Value>) -> RunResult<Option<i64>> {
        match value {
            None | Some(Value::None) => Ok(None),
            Some(value) => Int::from_value(value, self.heap)
                .map(|i| Some(i.saturating_i64()))
                .ok_or_else(|| {
                    ExcType::type_error("slice indices must be integers or None or have an __index__ method")
                }),
        }
    }

    /// `str(x='')`.
    pub(super) fn str_new(&mut self, _this: &Value, args: ArgValues) -> RunResult<Value> {
        let Some(value) = args.get_zero_one_arg("str", self.heap)? else {
            return Ok(self.heap.alloc_str("")?);
        };
        if self.is_str(&value) {
            return Ok(value);
        }
        let text = self.str_text_of(&value);
        value.drop_with_heap(self.heap);
        Ok(self.heap.alloc_str(&text?)?)
    }

    pub(super) fn str_join(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let sep = self.this_bytes(this, "join");
        let iterable = args.get_one_arg("join", self.heap)?;
        let items = sep.and_then(|sep| self.collect(&iterable).map(|items| (sep, items)));
        iterable.drop_with_heap(self.heap);
        let (sep, items) = items?;
        let mut out = Vec::new();
        let mut failed = None;
        for (i, item) in items.iter().enumerate() {
            let Some(bytes) = self.heap.str_bytes(item) else {
                failed = Some(ExcType::type_error(format!(
                    "sequence item {i}: expected string, {} found",
                    self.type_name(item)
                )));
                break;
            };
            if i > 0 {
                out.extend_from_slice(&sep);
            }
            out.extend_from_slice(bytes);
        }
        items.drop_with_heap(self.heap);
        if let Some(err) = failed {
            return Err(err);
        }
        self.check_result_size(out.len(), 1)?;
        Ok(self.heap.alloc_bytes(out)?)
    }

    /// `find`, `rfind`, `index` and `rindex`.
    pub(super) fn str_find(&mut self, this: &Value, args: ArgValues, reverse: bool, raise: bool) -> RunResult<Value> {
        let name = match (reverse, raise) {
            (false, false) => "find",
            (true, false) => "rfind",
            (false, true) => "index",
            (true, true) => "rindex",
        };
        let args = args.get_range(name, 1, 3, self.heap)?;
        let parsed = self.this_bytes(this, name).and_then(|hay| {
            let pattern = self.heap.str_bytes(&args[0]).map(<[u8]>::to_vec).ok_or_else(|| {
                ExcType::type_error("expected a character buffer object")
            })?;
            let start = self.opt_index(args.get(1))?;
            let end = self.opt_index(args.get(2))?;
            Ok((hay, pattern, start, end))
        });
        args.drop_with_heap(self.heap);
        let (hay, pattern, start, end) = parsed?;
        let (lo, hi) = clamp_range(hay.len(), start, end);
        let past_end = start.is_some_and(|s| s > i64::try_from(hay.len()).unwrap_or(i64::MAX));
        let dir = if reverse { SearchDir::Reverse } else { SearchDir::Forward };
        let found = if past_end || lo > hi {
            None
        } else {
            find(&hay[lo..hi], &pattern, dir).map(|at| at + lo)
        };
        match found {
            Some(at) => Ok(Value::Int(i64::try_from(at).unwrap_or(i64::MAX))),
            None if raise => Err(ExcType::value_error_substring_not_found()),
            None => Ok(Value::Int(-1)),
        }
    }

    /// `startswith` and `endswith`, with a string or a tuple of strings.
    pub(super) fn str_affix(&mut self, this: &Value, args: ArgValues, is_start: bool) -> RunResult<Value> {
        let name = if is_start { "startswith" } else { "endswith" };
        let args = args.get_range(name, 1, 3, self.heap)?;
        let parsed = self.this_bytes(this, name).and_then(|bytes| {
            let candidates: Vec<Vec<u8>> = if let Some(single) = self.heap.str_bytes(&args[0]) {
                vec![single.to_vec()]
            } else if self.is_tuple(&args[0]) {
                self.heap
                    .sequence_items(&args[0])
                    .unwrap_or_default()
                    .iter()
                    .map(|item| self.str_arg(item, name))
                    .collect::<RunResult<_>>()?
            } else {
                return Err(ExcType::type_error(format!(
                    "{name} first arg must be str or a tuple of str, not {}",
                    self.type_name(&args[0])
                )));
            };
            let start = self.opt_index(args.get(1))?;
            let end = self.opt_index(args.get(2))?;
            Ok((bytes, candidates, start, end))
        });
        args.drop_with_heap(self.heap);
        let (bytes, candidates, start, end) = parsed?;
        let (lo, hi) = clamp_range(bytes.len(), start, end);
        if lo > hi {
            return Ok(Value::Bool(false));
        }
        let window = &bytes[lo..hi];
        let hit = candidates.iter().any(|affix| {
            if is_start {
                window.starts_with(affix)
            } else {
                window.ends_with(affix)
            }
        });
        Ok(Value::Bool(hit))
    }

    /// `ljust`, `rjust` and `center`.
    pub(super) fn str_justify(&mut self, this: &Value, args: ArgValues, mode: Justify) -> RunResult<Value> {
        let name = match mode {
            Justify::Left => "ljust",
            Justify::Right => "rjust",
            Justify::Center => "center",
        };
        let args = args.get_range(name, 1, 2, self.heap)?;
        let parsed = self.this_bytes(this, name).and_then(|bytes| {
            let width = Int::from_value(&args[0], self.heap)
                .ok_or_else(|| ExcType::type_error("an integer is required"))?
                .saturating_i64();
            let fill = match args.get(1) {
                None => b' ',
                Some(fill) => match self.heap.str_bytes(fill) {
                    Some([byte]) => *byte,
                    _ => {
                        return Err(ExcType::type_error(
                            "The fill character must be exactly one character long",
                        ));
                    }
                },
            };
            Ok((bytes, width, fill))
        });
        args.drop_with_heap(self.heap);
        let (bytes, width, fill) = parsed?;
        let width = usize::try_from(width).unwrap_or(0);
        self.check_result_size(width, 1)?;
        match justify(&bytes, width, fill, mode) {
            Some(padded) => Ok(self.heap.alloc_bytes(padded)?),
            None => Ok(this.clone_with_heap(self.heap)),
        }
    }

    /// `split([sep[, maxsplit]])`.
    pub(super) fn str_split(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let args = args.get_range("split", 0, 2, self.heap)?;
        let parsed = self.this_bytes(this, "split").and_then(|bytes| {
            let sep = match args.first() {
                None | Some(Value::None) => None,
                Some(sep) => Some(self.str_arg(sep, "split")?),
            };
            let max = self.opt_index(args.get(1))?.and_then(|m| usize::try_from(m).ok());
            Ok((bytes, sep, max))
        });
        args.drop_with_heap(self.heap);
        let (bytes, sep, max) = parsed?;
        let parts = match &sep {
            None => split_whitespace(&bytes, max),
            Some(sep) if sep.is_empty() => return Err(ExcType::value_error("empty separator")),
            Some(sep) => split_on(&bytes, sep, max),
        };
        let mut items = Vec::with_capacity(parts.len());
        for part in parts {
            match self.heap.alloc_bytes(part.to_vec()) {
                Ok(item) => items.push(item),
                Err(err) => {
                    items.drop_with_heap(self.heap);
                    return Err(err.into());
                }
            }
        }
        Ok(self.heap.alloc_list(items)?)
    }

    /// `strip([chars])`.
    pub(super) fn str_strip(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let chars = args.get_zero_one_arg("strip", self.heap)?;
        let parsed = self.this_bytes(this, "strip").and_then(|bytes| {
            let chars = match &chars {
                None | Some(Value::None) => None,
                Some(chars) => Some(self.str_arg(chars, "strip")?),
            };
            Ok((bytes, chars))
        });
        chars.drop_with_heap(self.heap);
        let (bytes, chars) = parsed?;
        let stripped = strip_bytes(&bytes, chars.as_deref());
        if stripped.len() == bytes.len() {
            return Ok(this.clone_with_heap(self.heap));
        }
        Ok(self.heap.alloc_bytes(stripped.to_vec())?)
    }

    /// `upper` and `lower`.
    pub(super) fn str_map_bytes(
        &mut self,
        this: &Value,
        args: ArgValues,
        name: &str,
        map: fn(u8) -> u8,
    ) -> RunResult<Value> {
        args.check_zero_args(name, self.heap)?;
        let bytes = self.this_bytes(this, name)?;
        Ok(self.heap.alloc_bytes(bytes.into_iter().map(map).collect())?)
    }

    /// `replace(old, new[, count])`.
    pub(super) fn str_replace(&mut self, this: &Value, args: ArgValues) -> RunResult<Value> {
        let args = args.get_range("replace", 2, 3, self.heap)?;
        let parsed = self.this_bytes(this, "replace").and_then(|bytes| {
            let old = self.str_arg(&args[0], "replace")?;
            let new = self.str_arg(&args[1], "replace")?;
            let count = self.opt_index(args.get(2))?.and_then(|c| usize::try_from(c).ok());
            Ok((bytes, old, new, count))
        });
        args.drop_with_heap(self.heap);
        let (bytes, old, new, count) = parsed?;
        let grows = new.len().saturating_sub(old.len());
        self.check_result_size(bytes.len().saturating_add(grows.saturating_mul(bytes.len() + 1)), 1)?;
        Ok(self.heap.alloc_bytes(replace_bytes(&bytes, &old, &new, count))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_split_collapses_runs() {
        assert_eq!(split_whitespace(b"  a  b c ", None), vec![&b"a"[..], b"b", b"c"]);
        assert_eq!(split_whitespace(b"a b c", Some(1)), vec![&b"a"[..], b"b c"]);
        assert!(split_whitespace(b"   ", None).is_empty());
    }

    #[test]
    fn separator_split_keeps_empty_fields() {
        assert_eq!(split_on(b"a,,b", b",", None), vec![&b"a"[..], b"", b"b"]);
        assert_eq!(split_on(b"a,b,c", b",", Some(1)), vec![&b"a"[..], b"b,c"]);
        assert_eq!(split_on(b"", b",", None), vec![&b""[..]]);
    }

    #[test]
    fn replace_honors_count() {
        assert_eq!(replace_bytes(b"aaa", b"a", b"b", None), b"bbb");
        assert_eq!(replace_bytes(b"aaa", b"a", b"b", Some(2)), b"bba");
        assert_eq!(replace_bytes(b"ab", b"", b"-", None), b"-a-b-");
    }

    #[test]
    fn strip_defaults_to_whitespace() {
        assert_eq!(strip_bytes(b"  hi\n", None), b"hi");
        assert_eq!(strip_bytes(b"xxhixx", Some(b"x")), b"hi");
        assert_eq!(strip_bytes(b"   ", None), b"");
    }
}
