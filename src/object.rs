// The object heap: an arena of handles standing in for CLox's intrusive
// singly-linked list of `Obj*`. Every heap-allocated Lox value (strings,
// functions, closures, classes, instances, bound methods, upvalues) lives
// here; `Value::Obj(Handle)` is the only way the rest of the VM refers to
// one.

use ahash::AHashMap;

use crate::bytecode::Chunk;
use crate::value::{Handle, Value};

pub type NativeFn = fn(&[Value]) -> Value;

#[derive(Debug)]
pub struct StringObj {
    pub chars: String,
    pub hash: u32,
}

#[derive(Debug)]
pub struct FunctionObj {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    /// `None` for the top-level script function, matching CLox's
    /// `function->name == NULL` convention.
    pub name: Option<Handle>,
}

impl FunctionObj {
    pub fn new() -> Self {
        Self { arity: 0, upvalue_count: 0, chunk: Chunk::new(), name: None }
    }
}

#[derive(Debug)]
pub struct NativeObj {
    pub name: String,
    pub function: NativeFn,
}

#[derive(Debug)]
pub struct ClosureObj {
    pub function: Handle,
    pub upvalues: Vec<Handle>,
}

#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Still pointing at a live stack slot.
    Open(usize),
    /// Hoisted onto the heap once its frame returned.
    Closed(Value),
}

#[derive(Debug)]
pub struct UpvalueObj {
    pub state: UpvalueState,
}

#[derive(Debug)]
pub struct ClassObj {
    pub name: Handle,
    pub methods: AHashMap<Handle, Value>,
}

#[derive(Debug)]
pub struct InstanceObj {
    pub class: Handle,
    pub fields: AHashMap<Handle, Value>,
}

#[derive(Debug)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: Handle,
}

#[derive(Debug)]
pub enum ObjData {
    String(StringObj),
    Function(FunctionObj),
    Native(NativeObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
}

impl ObjData {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjData::String(_) => "string",
            ObjData::Function(_) => "function",
            ObjData::Native(_) => "native function",
            ObjData::Closure(_) => "function",
            ObjData::Upvalue(_) => "upvalue",
            ObjData::Class(_) => "class",
            ObjData::Instance(_) => "instance",
            ObjData::BoundMethod(_) => "function",
        }
    }
}

#[derive(Debug)]
pub struct Obj {
    pub marked: bool,
    /// Intrusive allocation-list pointer, threaded the way CLox threads
    /// `vm.objects`, so `Heap::sweep` can walk allocation order rather than
    /// arena-slot order.
    next: Option<Handle>,
    pub data: ObjData,
}

/// Arena owning every heap object. `Value::Obj(Handle)` is an index here;
/// nothing outside `Heap` ever holds a long-lived reference into it.
pub struct Heap {
    slots: Vec<Option<Obj>>,
    free_list: Vec<Handle>,
    head: Option<Handle>,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    /// Mirrors CLox's `DEBUG_STRESS_GC`: when set, every growing allocation
    /// is a GC trigger, not just crossing `next_gc`. Exists for test
    /// harnesses that want to flush out missing roots.
    pub stress_gc: bool,
}

const INITIAL_NEXT_GC: usize = 1024 * 1024;

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            head: None,
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            stress_gc: false,
        }
    }

    fn approx_size(data: &ObjData) -> usize {
        match data {
            ObjData::String(s) => std::mem::size_of::<StringObj>() + s.chars.len(),
            ObjData::Function(f) => std::mem::size_of::<FunctionObj>() + f.chunk.code.len(),
            ObjData::Native(_) => std::mem::size_of::<NativeObj>(),
            ObjData::Closure(c) => std::mem::size_of::<ClosureObj>() + c.upvalues.len() * 8,
            ObjData::Upvalue(_) => std::mem::size_of::<UpvalueObj>(),
            ObjData::Class(_) => std::mem::size_of::<ClassObj>(),
            ObjData::Instance(_) => std::mem::size_of::<InstanceObj>(),
            ObjData::BoundMethod(_) => std::mem::size_of::<BoundMethodObj>(),
        }
    }

    /// Allocate a new object, threading it onto the allocation list. The
    /// returned handle is stable until that slot is freed by `sweep`.
    pub fn allocate(&mut self, data: ObjData) -> Handle {
        self.bytes_allocated += Self::approx_size(&data);
        let obj = Obj { marked: false, next: self.head, data };
        let handle = if let Some(h) = self.free_list.pop() {
            self.slots[h] = Some(obj);
            h
        } else {
            self.slots.push(Some(obj));
            self.slots.len() - 1
        };
        self.head = Some(handle);
        handle
    }

    /// Whether the VM should run a collection cycle right now: either the
    /// heap has grown past its threshold, or stress mode wants one after
    /// every opportunity.
    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated > self.next_gc
    }

    pub fn get(&self, handle: Handle) -> &Obj {
        self.slots[handle].as_ref().expect("dangling object handle")
    }

    pub fn get_mut(&mut self, handle: Handle) -> &mut Obj {
        self.slots[handle].as_mut().expect("dangling object handle")
    }

    pub fn as_string(&self, handle: Handle) -> &str {
        match &self.get(handle).data {
            ObjData::String(s) => &s.chars,
            other => panic!("expected string object, found {}", other.type_name()),
        }
    }

    pub fn type_name_of(&self, handle: Handle) -> &'static str {
        self.get(handle).data.type_name()
    }

    pub fn format_object(&self, handle: Handle) -> String {
        match &self.get(handle).data {
            ObjData::String(s) => s.chars.clone(),
            ObjData::Function(f) => match f.name {
                Some(n) => format!("<fn {}>", self.as_string(n)),
                None => "<script>".to_string(),
            },
            ObjData::Native(n) => format!("<native fn {}>", n.name),
            ObjData::Closure(c) => self.format_object(c.function),
            ObjData::Upvalue(_) => "upvalue".to_string(),
            ObjData::Class(c) => self.as_string(c.name).to_string(),
            ObjData::Instance(i) => format!("{} instance", self.as_string(self.class_name(i.class))),
            ObjData::BoundMethod(b) => self.format_object(b.method),
        }
    }

    fn class_name(&self, class_handle: Handle) -> Handle {
        match &self.get(class_handle).data {
            ObjData::Class(c) => c.name,
            _ => unreachable!("class handle did not point to a class"),
        }
    }

    /// Mark `handle` grey: flip its `marked` bit and, if it was previously
    /// unmarked, push it onto `worklist` for later blackening. Mirrors
    /// CLox's `MarkObject`.
    pub fn mark(&mut self, handle: Handle, worklist: &mut Vec<Handle>) {
        let obj = self.get_mut(handle);
        if obj.marked {
            return;
        }
        obj.marked = true;
        worklist.push(handle);
    }

    pub fn mark_value(&mut self, value: Value, worklist: &mut Vec<Handle>) {
        if let Value::Obj(h) = value {
            self.mark(h, worklist);
        }
    }

    /// Trace one grey object's outgoing references, marking each reachable
    /// child. Mirrors CLox's `BlackenObject`.
    pub fn blacken(&mut self, handle: Handle, worklist: &mut Vec<Handle>) {
        // Clone out what we need to traverse before mutating `self` again,
        // since marking children requires `&mut self` too.
        match &self.get(handle).data {
            ObjData::String(_) | ObjData::Native(_) => {}
            ObjData::Upvalue(u) => {
                if let UpvalueState::Closed(v) = u.state {
                    self.mark_value(v, worklist);
                }
            }
            ObjData::Function(f) => {
                let name = f.name;
                let constants: Vec<Value> = f.chunk.constants.clone();
                if let Some(n) = name {
                    self.mark(n, worklist);
                }
                for c in constants {
                    self.mark_value(c, worklist);
                }
            }
            ObjData::Closure(c) => {
                let function = c.function;
                let upvalues = c.upvalues.clone();
                self.mark(function, worklist);
                for u in upvalues {
                    self.mark(u, worklist);
                }
            }
            ObjData::Class(c) => {
                let name = c.name;
                let methods: Vec<(Handle, Value)> =
                    c.methods.iter().map(|(k, v)| (*k, *v)).collect();
                self.mark(name, worklist);
                for (k, v) in methods {
                    self.mark(k, worklist);
                    self.mark_value(v, worklist);
                }
            }
            ObjData::Instance(i) => {
                let class = i.class;
                let fields: Vec<(Handle, Value)> = i.fields.iter().map(|(k, v)| (*k, *v)).collect();
                self.mark(class, worklist);
                for (k, v) in fields {
                    self.mark(k, worklist);
                    self.mark_value(v, worklist);
                }
            }
            ObjData::BoundMethod(b) => {
                let receiver = b.receiver;
                let method = b.method;
                self.mark_value(receiver, worklist);
                self.mark(method, worklist);
            }
        }
    }

    /// Reclaim every object left unmarked after tracing, walking the
    /// allocation list the way CLox's `Sweep` walks `vm.objects`.
    pub fn sweep(&mut self) {
        let mut previous: Option<Handle> = None;
        let mut current = self.head;
        while let Some(handle) = current {
            let (marked, next) = {
                let obj = self.slots[handle].as_mut().unwrap();
                let marked = obj.marked;
                obj.marked = false;
                (marked, obj.next)
            };
            if marked {
                previous = Some(handle);
                current = next;
            } else {
                let freed = self.slots[handle].take().unwrap();
                self.bytes_allocated = self.bytes_allocated.saturating_sub(Self::approx_size(&freed.data));
                self.free_list.push(handle);
                match previous {
                    Some(p) => self.slots[p].as_mut().unwrap().next = next,
                    None => self.head = next,
                }
                current = next;
            }
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_reclaims_only_unmarked_objects() {
        let mut heap = Heap::new();
        let a = heap.allocate(ObjData::String(StringObj { chars: "a".into(), hash: 1 }));
        let b = heap.allocate(ObjData::String(StringObj { chars: "b".into(), hash: 2 }));
        heap.get_mut(a).marked = true;
        heap.sweep();
        assert_eq!(heap.as_string(a), "a");
        assert!(heap.slots[b].is_none());
    }

    #[test]
    fn freed_slots_are_recycled() {
        let mut heap = Heap::new();
        let a = heap.allocate(ObjData::String(StringObj { chars: "a".into(), hash: 1 }));
        heap.sweep(); // a unmarked -> freed
        let b = heap.allocate(ObjData::String(StringObj { chars: "b".into(), hash: 2 }));
        assert_eq!(a, b);
    }
}
