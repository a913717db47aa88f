//! Heap object payloads.
//!
//! Every variant lives in a [`crate::gc::GcBox`] behind a [`Gc`] pointer and
//! is threaded into the heap's all-objects list. The [`ObjPayload`] trait
//! ties a payload type to its kind tag and tells the collector which
//! references it holds.

use crate::chunk::Chunk;
use crate::gc::{Gc, Heap, ObjPayload};
use crate::table::Table;
use crate::value::Value;

/// Kind tag stored in every object header. The collector and the value
/// printer dispatch on it instead of a vtable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjKind {
    Str,
    Function,
    Native,
    Closure,
    Upvalue,
    Class,
    Instance,
    BoundMethod,
}

/// An interned string: UTF-8 text plus its FNV-1a hash, computed once.
/// The heap guarantees at most one `Str` exists per content.
pub struct Str {
    pub text: Box<str>,
    pub hash: u32,
}

impl Str {
    /// FNV-1a over the string's bytes.
    pub fn hash_bytes(text: &str) -> u32 {
        let mut hash: u32 = 2166136261;
        for byte in text.bytes() {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(16777619);
        }
        hash
    }
}

impl ObjPayload for Str {
    const KIND: ObjKind = ObjKind::Str;

    fn owned_size(&self) -> usize {
        self.text.len()
    }

    fn trace(&self, _heap: &mut Heap) {}
}

/// A compiled function: its arity, how many upvalues its closures carry,
/// its name (absent for the top-level script) and its chunk. Never mutated
/// after compilation.
pub struct Function {
    pub arity: u8,
    pub upvalue_count: usize,
    pub name: Option<Gc<Str>>,
    pub chunk: Chunk,
}

impl Function {
    pub fn new(name: Option<Gc<Str>>) -> Function {
        Function {
            arity: 0,
            upvalue_count: 0,
            name,
            chunk: Chunk::new(),
        }
    }
}

impl ObjPayload for Function {
    const KIND: ObjKind = ObjKind::Function;

    fn owned_size(&self) -> usize {
        self.chunk.code.len() + self.chunk.lines.len() * std::mem::size_of::<u32>()
    }

    fn trace(&self, heap: &mut Heap) {
        if let Some(name) = self.name {
            heap.mark_object(name.as_obj());
        }
        for &constant in &self.chunk.constants {
            heap.mark_value(constant);
        }
    }
}

/// A host routine callable from Flint code. Arguments arrive as a slice of
/// the value stack; the return value is pushed in place of callee and args.
pub type NativeFn = fn(args: &[Value]) -> Value;

pub struct Native {
    pub function: NativeFn,
}

impl ObjPayload for Native {
    const KIND: ObjKind = ObjKind::Native;

    fn trace(&self, _heap: &mut Heap) {}
}

/// A function plus the upvalues it closes over. The upvalue list is filled
/// in by the VM while executing `OP_CLOSURE`, with the closure already
/// rooted on the stack.
pub struct Closure {
    pub function: Gc<Function>,
    pub upvalues: Vec<Gc<Upvalue>>,
}

impl Closure {
    pub fn new(function: Gc<Function>) -> Closure {
        Closure {
            function,
            upvalues: Vec::with_capacity(function.upvalue_count),
        }
    }
}

impl ObjPayload for Closure {
    const KIND: ObjKind = ObjKind::Closure;

    fn owned_size(&self) -> usize {
        self.upvalues.capacity() * std::mem::size_of::<Gc<Upvalue>>()
    }

    fn trace(&self, heap: &mut Heap) {
        heap.mark_object(self.function.as_obj());
        for &upvalue in &self.upvalues {
            heap.mark_object(upvalue.as_obj());
        }
    }
}

/// The sharing cell behind closure captures.
///
/// While *open*, `location` aliases a live stack slot and `next` threads the
/// upvalue into the VM's open-upvalue list (sorted by descending slot
/// address). Closing moves the captured value into `closed` and retargets
/// `location` at it, after which the stack slot may die.
pub struct Upvalue {
    pub location: *mut Value,
    pub closed: Value,
    pub next: Option<Gc<Upvalue>>,
}

impl Upvalue {
    pub fn new(location: *mut Value) -> Upvalue {
        Upvalue {
            location,
            closed: Value::Nil,
            next: None,
        }
    }
}

impl ObjPayload for Upvalue {
    const KIND: ObjKind = ObjKind::Upvalue;

    fn trace(&self, heap: &mut Heap) {
        // Only meaningful once closed; while open the slot is a stack root.
        heap.mark_value(self.closed);
    }
}

/// A class: a name and its method table. Methods are installed at class
/// definition time and copied down by `OP_INHERIT`.
pub struct Class {
    pub name: Gc<Str>,
    pub methods: Table,
}

impl Class {
    pub fn new(name: Gc<Str>) -> Class {
        Class {
            name,
            methods: Table::new(),
        }
    }
}

impl ObjPayload for Class {
    const KIND: ObjKind = ObjKind::Class;

    fn trace(&self, heap: &mut Heap) {
        heap.mark_object(self.name.as_obj());
        self.methods.mark(heap);
    }
}

/// An instance: its class and a freely mutated field table.
pub struct Instance {
    pub class: Gc<Class>,
    pub fields: Table,
}

impl Instance {
    pub fn new(class: Gc<Class>) -> Instance {
        Instance {
            class,
            fields: Table::new(),
        }
    }
}

impl ObjPayload for Instance {
    const KIND: ObjKind = ObjKind::Instance;

    fn trace(&self, heap: &mut Heap) {
        heap.mark_object(self.class.as_obj());
        self.fields.mark(heap);
    }
}

/// A receiver paired with a method closure, created when property access
/// finds a method instead of a field.
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Gc<Closure>,
}

impl ObjPayload for BoundMethod {
    const KIND: ObjKind = ObjKind::BoundMethod;

    fn trace(&self, heap: &mut Heap) {
        heap.mark_value(self.receiver);
        heap.mark_object(self.method.as_obj());
    }
}
