// Stack-based virtual machine: runs the bytecode the compiler emits.
// Call frames, upvalue capture/closing, class/instance/method dispatch,
// and the mark-sweep trigger all follow `CLox/vm.c`'s shape, threaded
// through `Handle`s instead of raw `Obj*`.

use std::sync::{Arc, Mutex};

use ahash::AHashMap;

use crate::builtins;
use crate::bytecode::{self, OpCode};
use crate::compiler::{self, CompileError};
use crate::object::{
    BoundMethodObj, ClassObj, ClosureObj, Heap, InstanceObj, NativeFn, ObjData, UpvalueObj,
    UpvalueState,
};
use crate::table::StringInterner;
use crate::value::{Handle, Value};

const FRAMES_MAX: usize = 64;

struct CallFrame {
    closure: Handle,
    ip: usize,
    slot_base: usize,
}

/// A runtime fault: a failed operand check, an undefined variable, a call
/// arity mismatch, stack overflow. Carries a CLox-style frame trace.
#[derive(Debug)]
pub struct RuntimeError {
    pub message: String,
    /// Innermost frame first, `"[line N] in name()"` per entry.
    pub trace: Vec<String>,
}

#[derive(Debug)]
pub enum InterpretError {
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

pub struct Vm {
    heap: Heap,
    strings: StringInterner,
    globals: AHashMap<Handle, Value>,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Open upvalues, kept sorted by captured stack slot, highest first, so
    /// `capture_upvalue`/`close_upvalues` can scan from the front.
    open_upvalues: Vec<Handle>,
    init_string: Handle,
    pub trace_execution: bool,
    /// `print` writes here instead of stdout when set, so test harnesses can
    /// compare output across runs (e.g. stress-GC vs. normal) without
    /// capturing the process's real stdout.
    output: Option<Arc<Mutex<Vec<u8>>>>,
}

impl Vm {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let mut strings = StringInterner::new();
        let init_string = strings.intern(&mut heap, "init");
        let mut vm = Self {
            heap,
            strings,
            globals: AHashMap::new(),
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: Vec::new(),
            init_string,
            trace_execution: false,
            output: None,
        };
        builtins::register(&mut vm);
        vm
    }

    /// Redirects `print` output into a shared buffer instead of stdout.
    pub fn set_output(&mut self, output: Arc<Mutex<Vec<u8>>>) {
        self.output = Some(output);
    }

    /// Enables CLox's `DEBUG_STRESS_GC` behavior: a collection is attempted
    /// after every instruction, not just once the heap crosses `next_gc`.
    pub fn set_stress_gc(&mut self, enabled: bool) {
        self.heap.stress_gc = enabled;
    }

    fn write_output(&mut self, line: &str) {
        match &self.output {
            Some(buf) => {
                let mut buf = buf.lock().expect("output buffer lock poisoned");
                buf.extend_from_slice(line.as_bytes());
                buf.push(b'\n');
            }
            None => println!("{line}"),
        }
    }

    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let name_handle = self.strings.intern(&mut self.heap, name);
        let native_handle = self.heap.allocate(ObjData::Native(crate::object::NativeObj {
            name: name.to_string(),
            function,
        }));
        self.globals.insert(name_handle, Value::Obj(native_handle));
    }

    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function_handle = compiler::compile(source, &mut self.heap, &mut self.strings)
            .map_err(InterpretError::Compile)?;
        let closure_handle = self
            .heap
            .allocate(ObjData::Closure(ClosureObj { function: function_handle, upvalues: Vec::new() }));
        self.push(Value::Obj(closure_handle));
        self.call(closure_handle, 0).map_err(InterpretError::Runtime)?;
        self.run().map_err(InterpretError::Runtime)
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("pop on empty stack is a compiler bug")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("no active call frame")
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("no active call frame")
    }

    fn function_of(&self, closure_handle: Handle) -> Handle {
        match &self.heap.get(closure_handle).data {
            ObjData::Closure(c) => c.function,
            _ => unreachable!("expected a closure handle"),
        }
    }

    fn read_byte(&mut self) -> u8 {
        let function_handle = self.function_of(self.current_frame().closure);
        let ip = self.current_frame().ip;
        self.current_frame_mut().ip += 1;
        match &self.heap.get(function_handle).data {
            ObjData::Function(f) => f.chunk.code[ip],
            _ => unreachable!(),
        }
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let function_handle = self.function_of(self.current_frame().closure);
        match &self.heap.get(function_handle).data {
            ObjData::Function(f) => f.chunk.constants[index],
            _ => unreachable!(),
        }
    }

    fn read_string_constant(&mut self) -> Handle {
        match self.read_constant() {
            Value::Obj(h) => h,
            _ => unreachable!("constant pool entry used as a name must be a string"),
        }
    }

    fn current_closure_upvalue(&self, index: usize) -> Handle {
        match &self.heap.get(self.current_frame().closure).data {
            ObjData::Closure(c) => c.upvalues[index],
            _ => unreachable!(),
        }
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.trace_execution {
                self.trace_top_frame();
            }

            let op = OpCode::from_u8(self.read_byte());
            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::PopN => {
                    let n = self.read_byte() as usize;
                    let new_len = self.stack.len() - n;
                    self.stack.truncate(new_len);
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slot_base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.current_frame().slot_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string_constant();
                    match self.globals.get(&name).copied() {
                        Some(v) => self.push(v),
                        None => {
                            return Err(self.runtime_error(format!(
                                "Undefined variable '{}'.",
                                self.heap.as_string(name)
                            )))
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string_constant();
                    let value = self.peek(0);
                    self.globals.insert(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string_constant();
                    if !self.globals.contains_key(&name) {
                        return Err(self.runtime_error(format!(
                            "Undefined variable '{}'.",
                            self.heap.as_string(name)
                        )));
                    }
                    self.globals.insert(name, self.peek(0));
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue_handle = self.current_closure_upvalue(slot);
                    let value = match &self.heap.get(upvalue_handle).data {
                        ObjData::Upvalue(u) => match u.state {
                            UpvalueState::Open(idx) => self.stack[idx],
                            UpvalueState::Closed(v) => v,
                        },
                        _ => unreachable!(),
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue_handle = self.current_closure_upvalue(slot);
                    let value = self.peek(0);
                    let open_idx = match &self.heap.get(upvalue_handle).data {
                        ObjData::Upvalue(u) => match u.state {
                            UpvalueState::Open(idx) => Some(idx),
                            UpvalueState::Closed(_) => None,
                        },
                        _ => unreachable!(),
                    };
                    match open_idx {
                        Some(idx) => self.stack[idx] = value,
                        None => {
                            if let ObjData::Upvalue(u) = &mut self.heap.get_mut(upvalue_handle).data {
                                u.state = UpvalueState::Closed(value);
                            }
                        }
                    }
                }
                OpCode::GetProperty => {
                    let name = self.read_string_constant();
                    let instance_handle = match self.peek(0) {
                        Value::Obj(h) if matches!(self.heap.get(h).data, ObjData::Instance(_)) => h,
                        _ => return Err(self.runtime_error("Only instances have properties.".to_string())),
                    };
                    let (class_handle, field) = match &self.heap.get(instance_handle).data {
                        ObjData::Instance(i) => (i.class, i.fields.get(&name).copied()),
                        _ => unreachable!(),
                    };
                    if let Some(value) = field {
                        self.pop();
                        self.push(value);
                    } else {
                        self.bind_method(class_handle, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = self.read_string_constant();
                    let instance_handle = match self.peek(1) {
                        Value::Obj(h) if matches!(self.heap.get(h).data, ObjData::Instance(_)) => h,
                        _ => return Err(self.runtime_error("Only instances have fields.".to_string())),
                    };
                    let value = self.peek(0);
                    if let ObjData::Instance(i) = &mut self.heap.get_mut(instance_handle).data {
                        i.fields.insert(name, value);
                    }
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string_constant();
                    let superclass = self.pop();
                    let Value::Obj(class_handle) = superclass else {
                        unreachable!("superclass operand is always a class value")
                    };
                    self.bind_method(class_handle, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(Value::values_equal(a, b)));
                }
                OpCode::Greater => self.binary_number_op(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.binary_number_op(|a, b| Value::Bool(a < b))?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_number_op(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.binary_number_op(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.binary_number_op(|a, b| Value::Number(a / b))?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }
                OpCode::Negate => match self.peek(0).as_number() {
                    Some(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    None => return Err(self.runtime_error("Operand must be a number.".to_string())),
                },
                OpCode::Print => {
                    let v = self.pop();
                    let line = v.format(&self.heap);
                    self.write_output(&line);
                }
                OpCode::Jump => {
                    let offset = self.read_u16();
                    self.current_frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16();
                    if self.peek(0).is_falsey() {
                        self.current_frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16();
                    self.current_frame_mut().ip -= offset as usize;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string_constant();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string_constant();
                    let arg_count = self.read_byte() as usize;
                    let superclass = self.pop();
                    let Value::Obj(class_handle) = superclass else {
                        unreachable!("superclass operand is always a class value")
                    };
                    self.invoke_from_class(class_handle, name, arg_count)?;
                }
                OpCode::Closure => {
                    let function_value = self.read_constant();
                    let Value::Obj(function_handle) = function_value else {
                        unreachable!("CLOSURE constant is always a function")
                    };
                    let upvalue_count = match &self.heap.get(function_handle).data {
                        ObjData::Function(f) => f.upvalue_count,
                        _ => unreachable!(),
                    };
                    let mut upvalues = Vec::with_capacity(upvalue_count);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() == 1;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let base = self.current_frame().slot_base;
                            upvalues.push(self.capture_upvalue(base + index));
                        } else {
                            upvalues.push(self.current_closure_upvalue(index));
                        }
                    }
                    let closure_handle =
                        self.heap.allocate(ObjData::Closure(ClosureObj { function: function_handle, upvalues }));
                    self.push(Value::Obj(closure_handle));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("RETURN always has a frame");
                    self.close_upvalues(frame.slot_base);
                    if self.frames.is_empty() {
                        self.pop(); // the bottom-of-stack script closure
                        return Ok(());
                    }
                    self.stack.truncate(frame.slot_base);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string_constant();
                    let class_handle =
                        self.heap.allocate(ObjData::Class(ClassObj { name, methods: AHashMap::new() }));
                    self.push(Value::Obj(class_handle));
                }
                OpCode::Inherit => {
                    let super_handle = match self.peek(1) {
                        Value::Obj(h) if matches!(self.heap.get(h).data, ObjData::Class(_)) => h,
                        _ => return Err(self.runtime_error("Superclass must be a class.".to_string())),
                    };
                    let methods = match &self.heap.get(super_handle).data {
                        ObjData::Class(c) => c.methods.clone(),
                        _ => unreachable!(),
                    };
                    let Value::Obj(sub_handle) = self.peek(0) else {
                        unreachable!("subclass operand is always a class value")
                    };
                    if let ObjData::Class(c) = &mut self.heap.get_mut(sub_handle).data {
                        for (k, v) in methods {
                            c.methods.insert(k, v);
                        }
                    }
                    self.pop(); // the subclass's own copy on the stack
                }
                OpCode::Method => {
                    let name = self.read_string_constant();
                    let method_value = self.peek(0);
                    let Value::Obj(class_handle) = self.peek(1) else {
                        unreachable!("METHOD always runs with a class beneath the closure")
                    };
                    if let ObjData::Class(c) = &mut self.heap.get_mut(class_handle).data {
                        c.methods.insert(name, method_value);
                    }
                    self.pop();
                }
            }

            if self.heap.should_collect() {
                self.collect_garbage();
            }
        }
    }

    fn binary_number_op(&mut self, op: impl Fn(f64, f64) -> Value) -> Result<(), RuntimeError> {
        let b = self.peek(0).as_number();
        let a = self.peek(1).as_number();
        match (a, b) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(op(a, b));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.".to_string())),
        }
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        match (self.peek(1), self.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                self.push(Value::Number(a + b));
                Ok(())
            }
            (Value::Obj(a), Value::Obj(b))
                if matches!(self.heap.get(a).data, ObjData::String(_))
                    && matches!(self.heap.get(b).data, ObjData::String(_)) =>
            {
                let concatenated = format!("{}{}", self.heap.as_string(a), self.heap.as_string(b));
                self.pop();
                self.pop();
                let handle = self.strings.intern(&mut self.heap, &concatenated);
                self.push(Value::Obj(handle));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.".to_string())),
        }
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        if let Value::Obj(handle) = callee {
            match &self.heap.get(handle).data {
                ObjData::BoundMethod(bm) => {
                    let method = bm.method;
                    let receiver = bm.receiver;
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = receiver;
                    return self.call(method, arg_count);
                }
                ObjData::Class(_) => {
                    let instance = self
                        .heap
                        .allocate(ObjData::Instance(InstanceObj { class: handle, fields: AHashMap::new() }));
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = Value::Obj(instance);
                    let initializer = match &self.heap.get(handle).data {
                        ObjData::Class(c) => c.methods.get(&self.init_string).copied(),
                        _ => unreachable!(),
                    };
                    return match initializer {
                        Some(Value::Obj(init_handle)) => self.call(init_handle, arg_count),
                        _ if arg_count != 0 => {
                            Err(self.runtime_error(format!("Expected 0 arguments but got {arg_count}.")))
                        }
                        _ => Ok(()),
                    };
                }
                ObjData::Closure(_) => return self.call(handle, arg_count),
                ObjData::Native(n) => {
                    let function = n.function;
                    let start = self.stack.len() - arg_count;
                    let args: Vec<Value> = self.stack[start..].to_vec();
                    self.stack.truncate(start - 1);
                    let result = function(&args);
                    self.push(result);
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(self.runtime_error("Can only call functions and classes.".to_string()))
    }

    fn call(&mut self, closure_handle: Handle, arg_count: usize) -> Result<(), RuntimeError> {
        let function_handle = self.function_of(closure_handle);
        let arity = match &self.heap.get(function_handle).data {
            ObjData::Function(f) => f.arity as usize,
            _ => unreachable!(),
        };
        if arg_count != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {arg_count}.")));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }
        let slot_base = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame { closure: closure_handle, ip: 0, slot_base });
        Ok(())
    }

    fn invoke(&mut self, name: Handle, arg_count: usize) -> Result<(), RuntimeError> {
        let instance_handle = match self.peek(arg_count) {
            Value::Obj(h) if matches!(self.heap.get(h).data, ObjData::Instance(_)) => h,
            _ => return Err(self.runtime_error("Only instances have methods.".to_string())),
        };
        let (class_handle, field) = match &self.heap.get(instance_handle).data {
            ObjData::Instance(i) => (i.class, i.fields.get(&name).copied()),
            _ => unreachable!(),
        };
        if let Some(value) = field {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = value;
            return self.call_value(value, arg_count);
        }
        self.invoke_from_class(class_handle, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class_handle: Handle,
        name: Handle,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let method = match &self.heap.get(class_handle).data {
            ObjData::Class(c) => c.methods.get(&name).copied(),
            _ => unreachable!(),
        };
        match method {
            Some(Value::Obj(closure_handle)) => self.call(closure_handle, arg_count),
            _ => Err(self.runtime_error(format!("Undefined property '{}'.", self.heap.as_string(name)))),
        }
    }

    fn bind_method(&mut self, class_handle: Handle, name: Handle) -> Result<(), RuntimeError> {
        let method = match &self.heap.get(class_handle).data {
            ObjData::Class(c) => c.methods.get(&name).copied(),
            _ => unreachable!(),
        };
        let Some(Value::Obj(method_handle)) = method else {
            return Err(self.runtime_error(format!("Undefined property '{}'.", self.heap.as_string(name))));
        };
        let receiver = self.peek(0);
        let bound = self
            .heap
            .allocate(ObjData::BoundMethod(BoundMethodObj { receiver, method: method_handle }));
        self.pop();
        self.push(Value::Obj(bound));
        Ok(())
    }

    /// Find or create the upvalue capturing absolute stack slot
    /// `stack_index`, keeping `open_upvalues` sorted descending so the scan
    /// (and `close_upvalues`) can stop early. Mirrors CLox's `CaptureUpvalue`.
    fn capture_upvalue(&mut self, stack_index: usize) -> Handle {
        let mut insert_at = self.open_upvalues.len();
        for (i, &handle) in self.open_upvalues.iter().enumerate() {
            let idx = match &self.heap.get(handle).data {
                ObjData::Upvalue(u) => match u.state {
                    UpvalueState::Open(idx) => idx,
                    UpvalueState::Closed(_) => unreachable!("open_upvalues only holds open upvalues"),
                },
                _ => unreachable!(),
            };
            if idx == stack_index {
                return handle;
            }
            if idx < stack_index {
                insert_at = i;
                break;
            }
        }
        let handle = self.heap.allocate(ObjData::Upvalue(UpvalueObj { state: UpvalueState::Open(stack_index) }));
        self.open_upvalues.insert(insert_at, handle);
        handle
    }

    /// Hoist every open upvalue capturing a slot at or above
    /// `from_stack_index` onto the heap. Mirrors CLox's `CloseUpvalues`.
    fn close_upvalues(&mut self, from_stack_index: usize) {
        while let Some(&handle) = self.open_upvalues.first() {
            let idx = match &self.heap.get(handle).data {
                ObjData::Upvalue(u) => match u.state {
                    UpvalueState::Open(idx) => idx,
                    UpvalueState::Closed(_) => unreachable!(),
                },
                _ => unreachable!(),
            };
            if idx < from_stack_index {
                break;
            }
            let value = self.stack[idx];
            if let ObjData::Upvalue(u) = &mut self.heap.get_mut(handle).data {
                u.state = UpvalueState::Closed(value);
            }
            self.open_upvalues.remove(0);
        }
    }

    fn runtime_error(&mut self, message: String) -> RuntimeError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function_handle = self.function_of(frame.closure);
            match &self.heap.get(function_handle).data {
                ObjData::Function(f) => {
                    let line = f.chunk.get_line(frame.ip.saturating_sub(1));
                    let name = match f.name {
                        Some(n) => format!("{}()", self.heap.as_string(n)),
                        None => "script".to_string(),
                    };
                    trace.push(format!("[line {line}] in {name}"));
                }
                _ => unreachable!(),
            }
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        RuntimeError { message, trace }
    }

    fn trace_top_frame(&self) {
        let frame = self.current_frame();
        let function_handle = self.function_of(frame.closure);
        if let ObjData::Function(f) = &self.heap.get(function_handle).data {
            print!("          ");
            for v in &self.stack {
                print!("[ {} ]", v.format(&self.heap));
            }
            println!();
            bytecode::disassemble_instruction(&f.chunk, frame.ip);
        }
    }

    /// Mark-and-sweep cycle: trace every root (stack, frames, open
    /// upvalues, globals, the cached `init` string), blacken the grey
    /// worklist, drop dead interned strings, then sweep the heap. Mirrors
    /// `CLox/memory.c`'s `CollectGarbage`.
    fn collect_garbage(&mut self) {
        let mut worklist = Vec::new();
        for &value in &self.stack {
            self.heap.mark_value(value, &mut worklist);
        }
        for frame in &self.frames {
            self.heap.mark(frame.closure, &mut worklist);
        }
        for &handle in &self.open_upvalues {
            self.heap.mark(handle, &mut worklist);
        }
        for (&k, &v) in self.globals.iter() {
            self.heap.mark(k, &mut worklist);
            self.heap.mark_value(v, &mut worklist);
        }
        self.heap.mark(self.init_string, &mut worklist);

        while let Some(handle) = worklist.pop() {
            self.heap.blacken(handle, &mut worklist);
        }

        self.strings.remove_unmarked(&self.heap);
        self.heap.sweep();
        self.heap.next_gc = self.heap.bytes_allocated * 2;
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> Result<(), InterpretError> {
        Vm::new().interpret(source)
    }

    #[test]
    fn runs_arithmetic_and_prints() {
        assert!(run("print 1 + 2 * 3;").is_ok());
    }

    #[test]
    fn closures_capture_and_mutate_state() {
        let source = r#"
            fun makeCounter() {
                var count = 0;
                fun counter() {
                    count = count + 1;
                    return count;
                }
                return counter;
            }
            var c = makeCounter();
            print c();
            print c();
        "#;
        assert!(run(source).is_ok());
    }

    #[test]
    fn classes_support_inheritance_and_super() {
        let source = r#"
            class Animal {
                speak() { return "..."; }
            }
            class Dog < Animal {
                speak() { return "Woof, " + super.speak(); }
            }
            var d = Dog();
            print d.speak();
        "#;
        assert!(run(source).is_ok());
    }

    #[test]
    fn calling_undefined_global_is_a_runtime_error() {
        match run("nope();") {
            Err(InterpretError::Runtime(e)) => assert!(e.message.contains("Undefined variable")),
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[test]
    fn adding_string_and_number_is_a_runtime_error() {
        match run("print \"x\" + 1;") {
            Err(InterpretError::Runtime(e)) => {
                assert!(e.message.contains("two numbers or two strings"))
            }
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[test]
    fn wrong_arity_call_is_a_runtime_error() {
        match run("fun f(a, b) { return a + b; } f(1);") {
            Err(InterpretError::Runtime(e)) => assert!(e.message.contains("Expected 2 arguments")),
            other => panic!("expected a runtime error, got {other:?}"),
        }
    }

    #[test]
    fn stress_gc_produces_identical_output_to_normal_mode() {
        let source = r#"
            class Node {
                init(value) {
                    this.value = value;
                }
            }
            fun makeChain(n) {
                var head = nil;
                for (var i = 0; i < n; i = i + 1) {
                    var node = Node(i);
                    node.next = head;
                    head = node;
                }
                return head;
            }
            var chain = makeChain(50);
            var sum = 0;
            while (chain != nil) {
                sum = sum + chain.value;
                chain = chain.next;
            }
            print sum;
        "#;

        let normal_buf = Arc::new(Mutex::new(Vec::new()));
        let mut normal_vm = Vm::new();
        normal_vm.set_output(normal_buf.clone());
        assert!(normal_vm.interpret(source).is_ok());

        let stress_buf = Arc::new(Mutex::new(Vec::new()));
        let mut stress_vm = Vm::new();
        stress_vm.set_output(stress_buf.clone());
        stress_vm.set_stress_gc(true);
        assert!(stress_vm.interpret(source).is_ok());

        assert_eq!(*normal_buf.lock().unwrap(), *stress_buf.lock().unwrap());
    }
}
