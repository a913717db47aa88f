//! The Flint virtual machine.
//!
//! One value stack of fixed capacity, a frame per live call, an open-upvalue
//! list for closures still aliasing stack slots, and a dispatch loop that
//! executes one opcode at a time. The VM owns the heap and drives the
//! collector: every allocation it performs goes through a safe point where
//! all transient objects are reachable from the stack.

mod natives;

use std::io::{self, Write};

use flint_bytecode::Op;
use flint_codegen::compile;
use flint_core::debug::disassemble_instruction;
use flint_core::object::{
    BoundMethod, Class, Closure, Function, Instance, Native, NativeFn, ObjKind, Str, Upvalue,
};
use flint_core::{Gc, Heap, ObjRef, Table, Value};

/// Maximum call depth; exceeding it is the `Stack overflow.` runtime error.
pub const FRAMES_MAX: usize = 64;
/// One byte of slot addressing per frame makes this enough for any program
/// that stays under [`FRAMES_MAX`].
pub const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Clone, Copy, Debug, Default)]
pub struct VmOptions {
    /// Print the stack and the disassembled instruction before each dispatch.
    pub trace_execution: bool,
    /// Collect at every allocation safe point instead of by threshold.
    pub stress_gc: bool,
}

/// Terminal result of [`Vm::interpret`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

/// One activation record. `slots` points at the callee's stack slot; local
/// slot 0 is the callee itself, or the receiver inside methods.
struct CallFrame {
    closure: Gc<Closure>,
    ip: *const u8,
    slots: *mut Value,
}

pub struct Vm {
    heap: Heap,
    /// Pinned backing store; upvalues alias into it while open.
    stack: Box<[Value]>,
    stack_top: *mut Value,
    frames: Vec<CallFrame>,
    globals: Table,
    /// Sorted by captured slot address, descending.
    open_upvalues: Option<Gc<Upvalue>>,
    init_string: Gc<Str>,
    options: VmOptions,
    out: Box<dyn Write>,
    err: Box<dyn Write>,
}

impl Vm {
    pub fn new(options: VmOptions) -> Vm {
        Vm::with_streams(options, Box::new(io::stdout()), Box::new(io::stderr()))
    }

    /// Build a VM writing program output to `out` and diagnostics to `err`.
    pub fn with_streams(options: VmOptions, out: Box<dyn Write>, err: Box<dyn Write>) -> Vm {
        natives::arm_clock();
        let mut heap = Heap::new();
        let init_string = heap.intern("init");
        let mut vm = Vm {
            heap,
            stack: vec![Value::Nil; STACK_MAX].into_boxed_slice(),
            stack_top: std::ptr::null_mut(),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: None,
            init_string,
            options,
            out,
            err,
        };
        vm.stack_top = vm.stack.as_mut_ptr();
        vm.define_native("clock", natives::clock);
        vm
    }

    /// Compile and run a source string. Globals persist across calls, so a
    /// REPL can feed lines to one VM.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = match compile(source, &mut self.heap) {
            Ok(function) => function,
            Err(errors) => {
                for error in &errors {
                    let _ = writeln!(self.err, "{}", error);
                }
                return InterpretResult::CompileError;
            }
        };

        // The function is rooted on the stack while the closure allocates.
        self.push(Value::Obj(function.as_obj()));
        let closure = self.heap.alloc(Closure::new(function));
        self.pop();
        self.push(Value::Obj(closure.as_obj()));
        if !self.call(closure, 0) {
            return InterpretResult::RuntimeError;
        }
        self.run()
    }

    fn run(&mut self) -> InterpretResult {
        let mut frame = self.current_frame_ptr();

        macro_rules! read_byte {
            () => {{
                unsafe {
                    let byte = *(*frame).ip;
                    (*frame).ip = (*frame).ip.add(1);
                    byte
                }
            }};
        }
        macro_rules! read_short {
            () => {{
                let hi = read_byte!();
                let lo = read_byte!();
                u16::from_be_bytes([hi, lo]) as usize
            }};
        }
        macro_rules! read_constant {
            () => {{
                let index = read_byte!() as usize;
                unsafe { (*frame).closure }.function.chunk.constants[index]
            }};
        }
        macro_rules! read_string {
            () => {{
                match read_constant!().as_string() {
                    Some(name) => name,
                    None => unreachable!("name constants are strings"),
                }
            }};
        }
        macro_rules! binary_op {
            ($wrap:expr, $op:tt) => {{
                match (self.peek(1).as_number(), self.peek(0).as_number()) {
                    (Some(a), Some(b)) => {
                        self.pop();
                        self.pop();
                        self.push($wrap(a $op b));
                    }
                    _ => {
                        self.runtime_error("Operands must be numbers.");
                        return InterpretResult::RuntimeError;
                    }
                }
            }};
        }

        loop {
            if self.options.trace_execution {
                self.print_trace(frame);
            }

            let op = match Op::try_from(read_byte!()) {
                Ok(op) => op,
                Err(_) => unreachable!("malformed chunk"),
            };

            match op {
                Op::Constant => {
                    let value = read_constant!();
                    self.push(value);
                }
                Op::Nil => self.push(Value::Nil),
                Op::True => self.push(Value::Bool(true)),
                Op::False => self.push(Value::Bool(false)),
                Op::Pop => {
                    self.pop();
                }

                Op::GetLocal => {
                    let slot = read_byte!() as usize;
                    let value = unsafe { *(*frame).slots.add(slot) };
                    self.push(value);
                }
                Op::SetLocal => {
                    let slot = read_byte!() as usize;
                    let value = self.peek(0);
                    unsafe {
                        *(*frame).slots.add(slot) = value;
                    }
                }
                Op::GetGlobal => {
                    let name = read_string!();
                    match self.globals.get(name) {
                        Some(value) => self.push(value),
                        None => {
                            self.runtime_error(format!("Undefined variable '{}'.", name.text));
                            return InterpretResult::RuntimeError;
                        }
                    }
                }
                Op::DefineGlobal => {
                    let name = read_string!();
                    let value = self.peek(0);
                    self.globals.set(name, value);
                    self.pop();
                }
                Op::SetGlobal => {
                    let name = read_string!();
                    let value = self.peek(0);
                    // Assignment must not create: undo the probe insert.
                    if self.globals.set(name, value) {
                        self.globals.delete(name);
                        self.runtime_error(format!("Undefined variable '{}'.", name.text));
                        return InterpretResult::RuntimeError;
                    }
                }
                Op::GetUpvalue => {
                    let slot = read_byte!() as usize;
                    let upvalue = unsafe { (*frame).closure }.upvalues[slot];
                    let value = unsafe { *upvalue.location };
                    self.push(value);
                }
                Op::SetUpvalue => {
                    let slot = read_byte!() as usize;
                    let value = self.peek(0);
                    let upvalue = unsafe { (*frame).closure }.upvalues[slot];
                    unsafe {
                        *upvalue.location = value;
                    }
                }
                Op::GetProperty => {
                    let Some(instance) = self.peek(0).as_obj().and_then(ObjRef::downcast::<Instance>)
                    else {
                        self.runtime_error("Only instances have properties.");
                        return InterpretResult::RuntimeError;
                    };
                    let name = read_string!();
                    if let Some(value) = instance.fields.get(name) {
                        self.pop(); // receiver
                        self.push(value);
                    } else if !self.bind_method(instance.class, name) {
                        return InterpretResult::RuntimeError;
                    }
                }
                Op::SetProperty => {
                    let Some(instance) = self.peek(1).as_obj().and_then(ObjRef::downcast::<Instance>)
                    else {
                        self.runtime_error("Only instances have fields.");
                        return InterpretResult::RuntimeError;
                    };
                    let name = read_string!();
                    unsafe {
                        instance.get_mut().fields.set(name, self.peek(0));
                    }
                    // The assigned value is the expression's result.
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                Op::GetSuper => {
                    let name = read_string!();
                    let Some(superclass) = self.pop().as_obj().and_then(ObjRef::downcast::<Class>)
                    else {
                        unreachable!("the hidden superclass slot always holds a class")
                    };
                    if !self.bind_method(superclass, name) {
                        return InterpretResult::RuntimeError;
                    }
                }

                Op::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                Op::Greater => binary_op!(Value::Bool, >),
                Op::Less => binary_op!(Value::Bool, <),
                Op::Add => {
                    if let (Some(a), Some(b)) = (self.peek(1).as_string(), self.peek(0).as_string())
                    {
                        self.concatenate(a, b);
                    } else if let (Some(a), Some(b)) =
                        (self.peek(1).as_number(), self.peek(0).as_number())
                    {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(a + b));
                    } else {
                        self.runtime_error("Operands must be two numbers or two strings.");
                        return InterpretResult::RuntimeError;
                    }
                }
                Op::Subtract => binary_op!(Value::Number, -),
                Op::Multiply => binary_op!(Value::Number, *),
                Op::Divide => binary_op!(Value::Number, /),
                Op::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                Op::Negate => {
                    let Some(value) = self.peek(0).as_number() else {
                        self.runtime_error("Operand must be a number.");
                        return InterpretResult::RuntimeError;
                    };
                    self.pop();
                    self.push(Value::Number(-value));
                }

                Op::Print => {
                    let value = self.pop();
                    let _ = writeln!(self.out, "{}", value);
                }
                Op::Jump => {
                    let offset = read_short!();
                    unsafe {
                        (*frame).ip = (*frame).ip.add(offset);
                    }
                }
                Op::JumpIfFalse => {
                    let offset = read_short!();
                    if self.peek(0).is_falsey() {
                        unsafe {
                            (*frame).ip = (*frame).ip.add(offset);
                        }
                    }
                }
                Op::Loop => {
                    let offset = read_short!();
                    unsafe {
                        (*frame).ip = (*frame).ip.sub(offset);
                    }
                }

                Op::Call => {
                    let arg_count = read_byte!() as usize;
                    if !self.call_value(self.peek(arg_count), arg_count) {
                        return InterpretResult::RuntimeError;
                    }
                    frame = self.current_frame_ptr();
                }
                Op::Invoke => {
                    let name = read_string!();
                    let arg_count = read_byte!() as usize;
                    if !self.invoke(name, arg_count) {
                        return InterpretResult::RuntimeError;
                    }
                    frame = self.current_frame_ptr();
                }
                Op::SuperInvoke => {
                    let name = read_string!();
                    let arg_count = read_byte!() as usize;
                    let Some(superclass) = self.pop().as_obj().and_then(ObjRef::downcast::<Class>)
                    else {
                        unreachable!("the hidden superclass slot always holds a class")
                    };
                    if !self.invoke_from_class(superclass, name, arg_count) {
                        return InterpretResult::RuntimeError;
                    }
                    frame = self.current_frame_ptr();
                }
                Op::Closure => {
                    let Some(function) =
                        read_constant!().as_obj().and_then(ObjRef::downcast::<Function>)
                    else {
                        unreachable!("closure constants are functions")
                    };
                    self.collect_if_needed();
                    let closure = self.heap.alloc(Closure::new(function));
                    self.push(Value::Obj(closure.as_obj()));
                    for _ in 0..function.upvalue_count {
                        let is_local = read_byte!() != 0;
                        let index = read_byte!() as usize;
                        let upvalue = if is_local {
                            let local = unsafe { (*frame).slots.add(index) };
                            self.capture_upvalue(local)
                        } else {
                            unsafe { (*frame).closure }.upvalues[index]
                        };
                        unsafe {
                            closure.get_mut().upvalues.push(upvalue);
                        }
                    }
                }
                Op::CloseUpvalue => {
                    let top = unsafe { self.stack_top.sub(1) };
                    self.close_upvalues(top);
                    self.pop();
                }
                Op::Return => {
                    let result = self.pop();
                    let slots = unsafe { (*frame).slots };
                    self.close_upvalues(slots);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        // The script closure is the last thing left.
                        self.pop();
                        return InterpretResult::Ok;
                    }
                    self.stack_top = slots;
                    self.push(result);
                    frame = self.current_frame_ptr();
                }

                Op::Class => {
                    let name = read_string!();
                    self.collect_if_needed();
                    let class = self.heap.alloc(Class::new(name));
                    self.push(Value::Obj(class.as_obj()));
                }
                Op::Inherit => {
                    let Some(superclass) = self.peek(1).as_obj().and_then(ObjRef::downcast::<Class>)
                    else {
                        self.runtime_error("Superclass must be a class.");
                        return InterpretResult::RuntimeError;
                    };
                    let Some(subclass) = self.peek(0).as_obj().and_then(ObjRef::downcast::<Class>)
                    else {
                        unreachable!("the subclass was just pushed by its own definition")
                    };
                    unsafe {
                        subclass.get_mut().methods.add_all(&superclass.methods);
                    }
                    // Pop the subclass; the superclass stays behind as the
                    // hidden local later super lookups read.
                    self.pop();
                }
                Op::Method => {
                    let name = read_string!();
                    self.define_method(name);
                }
            }
        }
    }

    // === Stack ===

    #[inline]
    fn push(&mut self, value: Value) {
        unsafe {
            *self.stack_top = value;
            self.stack_top = self.stack_top.add(1);
        }
    }

    #[inline]
    fn pop(&mut self) -> Value {
        unsafe {
            self.stack_top = self.stack_top.sub(1);
            *self.stack_top
        }
    }

    #[inline]
    fn peek(&self, distance: usize) -> Value {
        unsafe { *self.stack_top.sub(1 + distance) }
    }

    fn reset_stack(&mut self) {
        self.stack_top = self.stack.as_mut_ptr();
        self.frames.clear();
        self.open_upvalues = None;
    }

    fn current_frame_ptr(&mut self) -> *mut CallFrame {
        let index = self.frames.len() - 1;
        unsafe { self.frames.as_mut_ptr().add(index) }
    }

    // === Calls ===

    fn call(&mut self, closure: Gc<Closure>, arg_count: usize) -> bool {
        let arity = closure.function.arity as usize;
        if arg_count != arity {
            self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                arity, arg_count
            ));
            return false;
        }
        if self.frames.len() == FRAMES_MAX {
            self.runtime_error("Stack overflow.");
            return false;
        }

        let ip = closure.function.chunk.code.as_ptr();
        let slots = unsafe { self.stack_top.sub(arg_count + 1) };
        self.frames.push(CallFrame { closure, ip, slots });
        true
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> bool {
        if let Value::Obj(obj) = callee {
            match obj.kind() {
                ObjKind::BoundMethod => {
                    let bound = unsafe { obj.cast_unchecked::<BoundMethod>() };
                    unsafe {
                        *self.stack_top.sub(arg_count + 1) = bound.receiver;
                    }
                    return self.call(bound.method, arg_count);
                }
                ObjKind::Class => {
                    let class = unsafe { obj.cast_unchecked::<Class>() };
                    // The class is still the callee slot here, so the new
                    // instance is the only unrooted object at this point.
                    self.collect_if_needed();
                    let instance = self.heap.alloc(Instance::new(class));
                    unsafe {
                        *self.stack_top.sub(arg_count + 1) = Value::Obj(instance.as_obj());
                    }
                    return match class.methods.get(self.init_string) {
                        Some(initializer) => match as_closure(initializer) {
                            Some(initializer) => self.call(initializer, arg_count),
                            None => unreachable!("methods are closures"),
                        },
                        None if arg_count != 0 => {
                            self.runtime_error(format!(
                                "Expected 0 arguments but got {}.",
                                arg_count
                            ));
                            false
                        }
                        None => true,
                    };
                }
                ObjKind::Closure => {
                    let closure = unsafe { obj.cast_unchecked::<Closure>() };
                    return self.call(closure, arg_count);
                }
                ObjKind::Native => {
                    let native = unsafe { obj.cast_unchecked::<Native>() };
                    let args = unsafe {
                        std::slice::from_raw_parts(self.stack_top.sub(arg_count), arg_count)
                    };
                    let result = (native.function)(args);
                    self.stack_top = unsafe { self.stack_top.sub(arg_count + 1) };
                    self.push(result);
                    return true;
                }
                _ => {}
            }
        }
        self.runtime_error("Can only call functions and classes.");
        false
    }

    fn invoke(&mut self, name: Gc<Str>, arg_count: usize) -> bool {
        let receiver = self.peek(arg_count);
        let Some(instance) = receiver.as_obj().and_then(ObjRef::downcast::<Instance>) else {
            self.runtime_error("Only instances have methods.");
            return false;
        };

        // A field holding a callable shadows any method of the same name.
        if let Some(field) = instance.fields.get(name) {
            unsafe {
                *self.stack_top.sub(arg_count + 1) = field;
            }
            return self.call_value(field, arg_count);
        }
        self.invoke_from_class(instance.class, name, arg_count)
    }

    fn invoke_from_class(&mut self, class: Gc<Class>, name: Gc<Str>, arg_count: usize) -> bool {
        let Some(method) = class.methods.get(name) else {
            self.runtime_error(format!("Undefined property '{}'.", name.text));
            return false;
        };
        match as_closure(method) {
            Some(method) => self.call(method, arg_count),
            None => unreachable!("methods are closures"),
        }
    }

    fn bind_method(&mut self, class: Gc<Class>, name: Gc<Str>) -> bool {
        let Some(method) = class.methods.get(name) else {
            self.runtime_error(format!("Undefined property '{}'.", name.text));
            return false;
        };
        let Some(method) = as_closure(method) else {
            unreachable!("methods are closures")
        };

        self.collect_if_needed();
        let bound = self.heap.alloc(BoundMethod {
            receiver: self.peek(0),
            method,
        });
        self.pop();
        self.push(Value::Obj(bound.as_obj()));
        true
    }

    fn define_method(&mut self, name: Gc<Str>) {
        let method = self.peek(0);
        let Some(class) = self.peek(1).as_obj().and_then(ObjRef::downcast::<Class>) else {
            unreachable!("the class is still on the stack while its methods load")
        };
        unsafe {
            class.get_mut().methods.set(name, method);
        }
        self.pop();
    }

    // === Upvalues ===

    /// Find or create the upvalue for a stack slot. The open list is walked
    /// in descending address order so each slot is shared by at most one
    /// upvalue.
    fn capture_upvalue(&mut self, local: *mut Value) -> Gc<Upvalue> {
        let mut prev: Option<Gc<Upvalue>> = None;
        let mut cursor = self.open_upvalues;
        while let Some(upvalue) = cursor {
            if upvalue.location <= local {
                break;
            }
            prev = Some(upvalue);
            cursor = upvalue.next;
        }
        if let Some(upvalue) = cursor {
            if upvalue.location == local {
                return upvalue;
            }
        }

        self.collect_if_needed();
        let created = self.heap.alloc(Upvalue::new(local));
        unsafe {
            created.get_mut().next = cursor;
        }
        match prev {
            Some(prev) => unsafe {
                prev.get_mut().next = Some(created);
            },
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Close every open upvalue at or above `last`: move the captured value
    /// into the upvalue and retarget it at its own copy.
    fn close_upvalues(&mut self, last: *mut Value) {
        while let Some(upvalue) = self.open_upvalues {
            if upvalue.location < last {
                break;
            }
            unsafe {
                let cell = upvalue.get_mut();
                cell.closed = *cell.location;
                cell.location = &mut cell.closed;
                self.open_upvalues = cell.next;
                cell.next = None;
            }
        }
    }

    // === Objects ===

    fn concatenate(&mut self, a: Gc<Str>, b: Gc<Str>) {
        // Both operands are still on the stack across the safe point.
        self.collect_if_needed();
        let mut text = String::with_capacity(a.text.len() + b.text.len());
        text.push_str(&a.text);
        text.push_str(&b.text);
        let result = self.heap.intern_owned(text);
        self.pop();
        self.pop();
        self.push(Value::from(result));
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.heap.intern(name);
        let native = self.heap.alloc(Native { function });
        self.globals.set(name, Value::Obj(native.as_obj()));
    }

    // === Collection ===

    fn collect_if_needed(&mut self) {
        if self.options.stress_gc || self.heap.wants_collect() {
            self.collect_garbage();
        }
    }

    /// Mark the root set, then hand over to the heap's collector.
    fn collect_garbage(&mut self) {
        let mut slot = self.stack.as_ptr();
        while slot < self.stack_top as *const Value {
            self.heap.mark_value(unsafe { *slot });
            slot = unsafe { slot.add(1) };
        }

        for frame in &self.frames {
            self.heap.mark_object(frame.closure.as_obj());
        }

        let mut upvalue = self.open_upvalues;
        while let Some(current) = upvalue {
            self.heap.mark_object(current.as_obj());
            upvalue = current.next;
        }

        self.globals.mark(&mut self.heap);
        self.heap.mark_object(self.init_string.as_obj());

        self.heap.collect();
    }

    // === Diagnostics ===

    fn runtime_error(&mut self, message: impl AsRef<str>) {
        let _ = writeln!(self.err, "{}", message.as_ref());

        for frame in self.frames.iter().rev() {
            let function = frame.closure.function;
            let offset =
                unsafe { frame.ip.offset_from(function.chunk.code.as_ptr()) } as usize - 1;
            let line = function.chunk.line(offset);
            match function.name {
                Some(name) => {
                    let _ = writeln!(self.err, "[line {}] in {}()", line, name.text);
                }
                None => {
                    let _ = writeln!(self.err, "[line {}] in script", line);
                }
            }
        }

        self.reset_stack();
    }

    fn print_trace(&mut self, frame: *mut CallFrame) {
        let mut stack_line = String::from("          ");
        let mut slot = self.stack.as_ptr();
        while slot < self.stack_top as *const Value {
            stack_line.push_str(&format!("[ {} ]", unsafe { *slot }));
            slot = unsafe { slot.add(1) };
        }
        println!("{}", stack_line);

        let function = unsafe { (&(*frame).closure).function };
        let offset = unsafe { (*frame).ip.offset_from(function.chunk.code.as_ptr()) } as usize;
        let (text, _) = disassemble_instruction(&function.chunk, offset);
        println!("{}", text);
    }
}

fn as_closure(value: Value) -> Option<Gc<Closure>> {
    value.as_obj().and_then(ObjRef::downcast::<Closure>)
}
