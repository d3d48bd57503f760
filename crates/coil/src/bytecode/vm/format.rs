//! `repr`/`str` conversion and the print statement opcodes.

use std::fmt::Write as _;

use super::{Step, VM};
use crate::{
    args::ArgValues,
    exception_private::{ExcType, RunError, RunResult, SimpleException},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    tracer::VmTracer,
    types::{DictIterKind, Int, str::repr_bytes},
    value::Value,
};

/// Converts a print writer failure into the IOError user code sees.
fn write_error(err: std::io::Error) -> RunError {
    SimpleException::new(ExcType::IOError, Some(err.to_string())).into()
}

/// Whether printing `text` leaves a space due before the next item.
fn leaves_softspace(text: &[u8]) -> bool {
    match text.last() {
        Some(&last) => last == b' ' || !last.is_ascii_whitespace(),
        None => true,
    }
}

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// `repr(value)`.
    pub(crate) fn repr(&mut self, value: &Value) -> RunResult<String> {
        let id = match value {
            Value::None => return Ok("None".to_owned()),
            Value::NotImplemented => return Ok("NotImplemented".to_owned()),
            Value::Bool(true) => return Ok("True".to_owned()),
            Value::Bool(false) => return Ok("False".to_owned()),
            Value::Int(v) => return Ok(v.to_string()),
            Value::Ref(id) => *id,
            #[cfg(feature = "ref-count-panic")]
            Value::Dereferenced => return Err(RunError::internal("repr of a dereferenced value")),
        };
        let address = value.id();
        let text = match self.heap.get(id) {
            HeapData::Str(s) => {
                let mut out = String::with_capacity(s.len() + 2);
                repr_bytes(s.as_bytes(), &mut out);
                out
            }
            HeapData::LongInt(li) => Int::Big(li.digits().to_vec()).to_string(),
            HeapData::Tuple(_) | HeapData::List(_) | HeapData::Dict(_) => return self.container_repr(id),
            HeapData::Instance(_) => return self.instance_text(value, "__repr__"),
            HeapData::Type(t) if t.heap_type => format!("<class '{}'>", t.name),
            HeapData::Type(t) => format!("<type '{}'>", t.name),
            HeapData::Function(f) => format!("<function {} at 0x{address:08x}>", f.name),
            HeapData::Native(n) => format!("<built-in function {}>", n.name),
            HeapData::Method(m) => {
                let owner = self.type_id_name(m.owner);
                let func = m.func.clone_with_heap(self.heap);
                let this = m.bound_self.as_ref().map(|v| v.clone_with_heap(self.heap));
                return self.method_repr(&owner, func, this);
            }
            HeapData::Code(c) => format!("<code object {} at 0x{address:08x}>", c.code.name()),
            HeapData::Traceback(_) => format!("<traceback object at 0x{address:08x}>"),
            HeapData::Slice(s) => {
                let parts = [&s.start, &s.stop, &s.step].map(|v| v.clone_with_heap(self.heap));
                let mut out = String::from("slice(");
                let mut failed = None;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    match self.repr(part) {
                        Ok(text) => out.push_str(&text),
                        Err(err) => {
                            failed = Some(err);
                            break;
                        }
                    }
                }
                for part in parts {
                    part.drop_with_heap(self.heap);
                }
                if let Some(err) = failed {
                    return Err(err);
                }
                out.push(')');
                out
            }
            HeapData::SeqIter(_) => format!("<iterator object at 0x{address:08x}>"),
            HeapData::DictIter(it) => {
                let kind = match it.kind {
                    DictIterKind::Keys => "key",
                    DictIterKind::Values => "value",
                    DictIterKind::Items => "item",
                };
                format!("<dictionary-{kind}iterator object at 0x{address:08x}>")
            }
            HeapData::Module(m) => format!("<module '{}'>", m.name),
        };
        Ok(text)
    }

    fn method_repr(&mut self, owner: &str, func: Value, this: Option<Value>) -> RunResult<String> {
        let name = match func.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Function(f)) => f.name.clone(),
            Some(HeapData::Native(n)) => n.name.to_owned(),
            _ => "?".to_owned(),
        };
        func.drop_with_heap(self.heap);
        let Some(this) = this else {
            return Ok(format!("<unbound method {owner}.{name}>"));
        };
        let this_repr = self.repr(&this);
        this.drop_with_heap(self.heap);
        Ok(format!("<bound method {owner}.{name} of {}>", this_repr?))
    }

    /// Repr of a tuple, list or dict, printing `[...]`/`{...}` for a container that is
    /// already being formatted further up.
    fn container_repr(&mut self, id: HeapId) -> RunResult<String> {
        let (open, close) = match self.heap.get(id) {
            HeapData::Tuple(_) => ("(", ")"),
            HeapData::List(_) => ("[", "]"),
            _ => ("{", "}"),
        };
        if self.repr_guard.contains(&id) {
            return Ok(format!("{open}...{close}"));
        }
        self.repr_guard.push(id);
        let result = self.container_body(id);
        self.repr_guard.pop();
        let body = result?;
        let trailing = match self.heap.get(id) {
            HeapData::Tuple(t) if t.len() == 1 => ",",
            _ => "",
        };
        Ok(format!("{open}{body}{trailing}{close}"))
    }

    fn container_body(&mut self, id: HeapId) -> RunResult<String> {
        let mut out = String::new();
        if matches!(self.heap.get(id), HeapData::Dict(_)) {
            let mut pairs = self.dict_pairs(id).into_iter();
            let mut first = true;
            while let Some((key, value)) = pairs.next() {
                let key_repr = self.repr(&key);
                let value_repr = key_repr.and_then(|k| self.repr(&value).map(|v| (k, v)));
                (key, value).drop_with_heap(self.heap);
                match value_repr {
                    Ok((k, v)) => {
                        if !first {
                            out.push_str(", ");
                        }
                        first = false;
                        let _ = write!(out, "{k}: {v}");
                    }
                    Err(err) => {
                        pairs.collect::<Vec<_>>().drop_with_heap(self.heap);
                        return Err(err);
                    }
                }
            }
            return Ok(out);
        }
        let items: Vec<Value> = match self.heap.get(id) {
            HeapData::Tuple(t) => t.items().iter().map(|v| v.clone_with_heap(self.heap)).collect(),
            HeapData::List(l) => l.items().iter().map(|v| v.clone_with_heap(self.heap)).collect(),
            _ => Vec::new(),
        };
        let mut failed = None;
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            match self.repr(item) {
                Ok(text) => out.push_str(&text),
                Err(err) => {
                    failed = Some(err);
                    break;
                }
            }
        }
        items.drop_with_heap(self.heap);
        match failed {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }

    /// Calls `__repr__`/`__str__` on an instance and checks the result is a string.
    fn instance_text(&mut self, value: &Value, method: &str) -> RunResult<String> {
        let Some(result) = self.call_method(value, method, ArgValues::empty())? else {
            return Ok(self.default_repr(value));
        };
        let text = self.heap.str_text(&result);
        let type_name = self.type_name(&result);
        result.drop_with_heap(self.heap);
        text.ok_or_else(|| ExcType::type_error(format!("{method} returned non-string (type {type_name})")))
    }

    /// `<Name instance at 0x...>`, what `object.__repr__` produces.
    pub(crate) fn default_repr(&self, value: &Value) -> String {
        format!("<{} instance at 0x{:08x}>", self.type_name(value), value.id())
    }

    /// `str(value)`: a string's own text, `__str__` for instances, the repr otherwise.
    pub(crate) fn str_text_of(&mut self, value: &Value) -> RunResult<String> {
        if let Some(text) = self.heap.str_text(value) {
            return Ok(text);
        }
        if self.is_instance_value(value) {
            return self.instance_text(value, "__str__");
        }
        self.repr(value)
    }

    // ========================================================================
    // Print statement
    // ========================================================================

    /// `PrintItem`/`PrintItemTo`: writes `str(item)`, preceded by a space when one is due.
    pub(super) fn print_item_op(&mut self, to_stream: bool) -> RunResult<Step> {
        let stream = if to_stream { Some(self.pop()?) } else { None };
        let item = match self.pop() {
            Ok(item) => item,
            Err(err) => {
                stream.drop_with_heap(self.heap);
                return Err(err);
            }
        };
        let text = self.str_text_of(&item);
        item.drop_with_heap(self.heap);
        let result = text.and_then(|text| match stream.as_ref().filter(|s| !s.is_none()) {
            Some(stream) => self.print_item_to(stream, &text),
            None => self.print_item_stdout(&text),
        });
        stream.drop_with_heap(self.heap);
        result.map(|()| Step::Next)
    }

    fn print_item_stdout(&mut self, text: &str) -> RunResult<()> {
        if std::mem::take(&mut self.rt.softspace) {
            self.print_writer.write_text(" ").map_err(write_error)?;
        }
        self.print_writer.write_text(text).map_err(write_error)?;
        self.rt.softspace = leaves_softspace(text.as_bytes());
        Ok(())
    }

    fn print_item_to(&mut self, stream: &Value, text: &str) -> RunResult<()> {
        if self.stream_softspace(stream, false)? {
            self.stream_write(stream, " ")?;
        }
        self.stream_write(stream, text)?;
        self.stream_softspace(stream, leaves_softspace(text.as_bytes()))?;
        Ok(())
    }

    /// `PrintNewline`/`PrintNewlineTo`.
    pub(super) fn print_newline_op(&mut self, to_stream: bool) -> RunResult<Step> {
        let stream = if to_stream { Some(self.pop()?) } else { None };
        let result = match stream.as_ref().filter(|s| !s.is_none()) {
            Some(stream) => self
                .stream_write(stream, "\n")
                .and_then(|()| self.stream_softspace(stream, false).map(|_| ())),
            None => {
                self.rt.softspace = false;
                self.print_writer.newline().map_err(write_error)
            }
        };
        stream.drop_with_heap(self.heap);
        result.map(|()| Step::Next)
    }

    /// `PrintExpr`: interactive echo of an expression statement's value.
    pub(super) fn print_expr_op(&mut self) -> RunResult<Step> {
        let value = self.pop()?;
        if value.is_none() {
            return Ok(Step::Next);
        }
        let text = match self.repr(&value) {
            Ok(text) => text,
            Err(err) => {
                value.drop_with_heap(self.heap);
                return Err(err);
            }
        };
        self.heap.dict_set_str(self.rt.builtins, "_", value)?;
        self.rt.softspace = false;
        self.print_writer.write_text(&text).map_err(write_error)?;
        self.print_writer.newline().map_err(write_error)?;
        Ok(Step::Next)
    }

    fn stream_write(&mut self, stream: &Value, text: &str) -> RunResult<()> {
        let arg = self.heap.alloc_str(text)?;
        let Some(write) = self.get_attr(stream, "write")? else {
            arg.drop_with_heap(self.heap);
            return Err(self.attribute_missing(stream, "write"));
        };
        let result = self.call_sync(&write, ArgValues::one(arg));
        write.drop_with_heap(self.heap);
        result?.drop_with_heap(self.heap);
        Ok(())
    }

    /// Reads the stream's `softspace` flag and stores `new`. Streams without the
    /// attribute, or that refuse the assignment, count as having it clear.
    fn stream_softspace(&mut self, stream: &Value, new: bool) -> RunResult<bool> {
        let old = match self.get_attr(stream, "softspace")? {
            Some(flag) => {
                let set = self.is_true(&flag);
                flag.drop_with_heap(self.heap);
                set?
            }
            None => false,
        };
        if let Err(err) = self.set_attr(stream, "softspace", Value::Int(i64::from(new))) {
            if !self.error_matches(&err, ExcType::AttributeError) && !self.error_matches(&err, ExcType::TypeError) {
                return Err(err);
            }
            err.drop_with_heap(self.heap);
        }
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::leaves_softspace;

    #[test]
    fn softspace_follows_trailing_whitespace() {
        assert!(leaves_softspace(b"abc"));
        assert!(leaves_softspace(b"abc "));
        assert!(leaves_softspace(b""));
        assert!(!leaves_softspace(b"abc\n"));
        assert!(!leaves_softspace(b"abc\t"));
    }
}
