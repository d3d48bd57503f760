//! The import opcodes over the runtime's module table.
//!
//! Hosts register code under a module name. The first import runs it in a fresh
//! namespace; the module object stays in the table for later imports.

use std::rc::Rc;

use super::{Step, VM};
use crate::{
    exception_private::{ExcType, RunResult},
    heap::{DropWithHeap, HeapData, HeapId},
    io::PrintWriter,
    resource::ResourceTracker,
    runtime::ModuleSlot,
    tracer::VmTracer,
    types::Module,
    value::Value,
};

impl<T: ResourceTracker, P: PrintWriter, Tr: VmTracer> VM<'_, T, P, Tr> {
    /// `ImportName`: pops the fromlist and level, pushes the top-level package, or the
    /// named module itself when a fromlist is given.
    pub(super) fn import_name_op(&mut self, index: usize) -> RunResult<Step> {
        let name = self.name(index)?;
        let [level, fromlist] = self.pop_array()?;
        level.drop_with_heap(self.heap);
        let wants_leaf = self.is_true(&fromlist);
        fromlist.drop_with_heap(self.heap);
        let wants_leaf = wants_leaf?;

        let mut top = None;
        let mut parent: Option<HeapId> = None;
        for (end, _) in name.match_indices('.').chain(std::iter::once((name.len(), ""))) {
            let path = &name[..end];
            let short = path.rsplit('.').next().unwrap_or(path);
            let module = self.import_module(path, short)?;
            if let Some(parent) = parent {
                self.set_submodule(parent, short, module)?;
            }
            top.get_or_insert(module);
            parent = Some(module);
        }
        let pushed = if wants_leaf { parent } else { top };
        let module = pushed.ok_or_else(|| ExcType::value_error("Empty module name"))?;
        self.heap.inc_ref(module);
        Ok(Step::Push(Value::Ref(module)))
    }

    /// `ImportFrom`: pushes an attribute of the module on top of the stack, which stays.
    pub(super) fn import_from_op(&mut self, index: usize) -> RunResult<Step> {
        let name = self.name(index)?;
        let module = self.peek(0)?.clone_with_heap(self.heap);
        let found = self.get_attr(&module, &name);
        let found = match found {
            Ok(Some(value)) => Ok(value),
            Ok(None) => self.import_submodule(&module, &name),
            Err(err) => Err(err),
        };
        module.drop_with_heap(self.heap);
        found.map(Step::Push)
    }

    /// `from package import name` where `name` is a registered submodule not loaded yet.
    fn import_submodule(&mut self, module: &Value, name: &str) -> RunResult<Value> {
        let cannot = || ExcType::import_error(format!("cannot import name {name}"));
        let parent = match module.ref_id().map(|id| (id, self.heap.get(id))) {
            Some((id, HeapData::Module(m))) => Some((id, format!("{}.{name}", m.name))),
            _ => None,
        };
        let Some((parent, path)) = parent else {
            return Err(cannot());
        };
        if !self.rt.modules.contains_key(&path) {
            return Err(cannot());
        }
        let child = self.import_module(&path, name)?;
        self.set_submodule(parent, name, child)?;
        self.heap.inc_ref(child);
        Ok(Value::Ref(child))
    }

    /// `ImportStar`: copies the module's `__all__`, or every name not starting with an
    /// underscore, into the current locals.
    pub(super) fn import_star_op(&mut self) -> RunResult<Step> {
        let module = self.pop()?;
        let dict = match module.ref_id().map(|id| self.heap.get(id)) {
            Some(HeapData::Module(m)) => Some(m.dict),
            _ => None,
        };
        let Some(dict) = dict else {
            let type_name = self.type_name(&module);
            module.drop_with_heap(self.heap);
            return Err(ExcType::type_error(format!("cannot import * from '{type_name}' object")));
        };
        let result = self.public_names(dict).and_then(|names| {
            let locals = self.frame().locals;
            for name in names {
                let Some(value) = self.heap.dict_get_str(dict, &name).map(|v| v.clone_with_heap(self.heap)) else {
                    return Err(ExcType::attribute_error("module", &name));
                };
                self.heap.dict_set_str(locals, &name, value)?;
            }
            Ok(())
        });
        module.drop_with_heap(self.heap);
        result.map(|()| Step::Next)
    }

    fn public_names(&mut self, dict: HeapId) -> RunResult<Vec<String>> {
        if let Some(all) = self.heap.dict_get_str(dict, "__all__").map(|v| v.clone_with_heap(self.heap)) {
            let items = self.collect(&all);
            all.drop_with_heap(self.heap);
            let items = items?;
            let names: Option<Vec<String>> = items.iter().map(|item| self.heap.str_text(item)).collect();
            items.drop_with_heap(self.heap);
            return names.ok_or_else(|| ExcType::type_error("__all__ must contain only strings"));
        }
        let HeapData::Dict(entries) = self.heap.get(dict) else {
            return Ok(Vec::new());
        };
        let mut names: Vec<String> = entries
            .iter()
            .filter_map(|e| self.heap.str_text(&e.key))
            .filter(|name| !name.starts_with('_'))
            .collect();
        // iteration is newest first; bind in definition order
        names.reverse();
        Ok(names)
    }

    /// Returns the module registered as `path`, running its code on first import.
    ///
    /// The returned id is borrowed from the module table.
    fn import_module(&mut self, path: &str, short: &str) -> RunResult<HeapId> {
        let code = match self.rt.modules.get(path) {
            Some(ModuleSlot::Loaded(id)) => return Ok(*id),
            Some(ModuleSlot::Pending(code)) => Rc::clone(code),
            None => return Err(ExcType::import_error(format!("No module named {short}"))),
        };
        let dict = self.heap.alloc_dict()?;
        let module = self.heap.alloc_str(path).map_err(Into::into).and_then(|name| {
            self.heap.dict_set_str(dict, "__name__", name)?;
            Ok(self.heap.allocate(HeapData::Module(Module {
                name: path.to_owned(),
                dict,
            }))?)
        });
        let module = match module {
            Ok(module) => module,
            Err(err) => {
                self.heap.dec_ref(dict);
                return Err(err);
            }
        };
        // a module importing itself while running sees the partial namespace
        self.rt.modules.insert(path.to_owned(), ModuleSlot::Loaded(module));
        match self.run_code(Rc::clone(&code), dict, dict) {
            Ok(result) => {
                result.drop_with_heap(self.heap);
                Ok(module)
            }
            Err(err) => {
                if let Some(ModuleSlot::Loaded(id)) = self.rt.modules.insert(path.to_owned(), ModuleSlot::Pending(code)) {
                    self.heap.dec_ref(id);
                }
                Err(err)
            }
        }
    }

    fn set_submodule(&mut self, parent: HeapId, name: &str, child: HeapId) -> RunResult<()> {
        let HeapData::Module(m) = self.heap.get(parent) else {
            return Ok(());
        };
        let dict = m.dict;
        self.heap.inc_ref(child);
        self.heap.dict_set_str(dict, name, Value::Ref(child))?;
        Ok(())
    }
}
