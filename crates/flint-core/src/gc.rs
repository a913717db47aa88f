//! The garbage-collected heap.
//!
//! Objects live in [`GcBox`]es allocated on the Rust heap and threaded into
//! an intrusive all-objects list through their headers. [`Gc<T>`] is a
//! copyable typed pointer; [`ObjRef`] is the untyped form stored in
//! [`Value`]. Collection is a precise, non-moving tri-color mark-sweep: the
//! VM marks its roots, [`Heap::collect`] drains the gray worklist, sweeps
//! the string table weakly, then frees everything left unmarked.
//!
//! The collector never runs on its own. Allocation only grows the heap;
//! whoever drives execution decides when [`Heap::collect`] is safe to call,
//! and must have every transient object reachable from the roots it marks.

use std::cell::Cell;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::object::{
    BoundMethod, Class, Closure, Function, Instance, Native, ObjKind, Str, Upvalue,
};
use crate::table::Table;
use crate::value::Value;

/// Live-byte growth factor applied after every collection.
const HEAP_GROW_FACTOR: usize = 2;
/// Bytes of live data before the first collection triggers.
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

/// Header carried by every heap object: the kind tag, the mark bit, and the
/// link into the all-objects list.
pub struct GcHeader {
    kind: ObjKind,
    marked: Cell<bool>,
    next: Cell<Option<ObjRef>>,
}

/// The heap-allocated carrier of a payload `T`.
///
/// `repr(C)` with the header first, so a pointer to the box is also a valid
/// pointer to its header regardless of `T`.
#[repr(C)]
pub struct GcBox<T> {
    header: GcHeader,
    value: T,
}

/// A payload type that can live on the collected heap.
pub trait ObjPayload: Sized {
    const KIND: ObjKind;

    /// Bytes the payload owns outside its own struct, counted toward the
    /// collection threshold.
    fn owned_size(&self) -> usize {
        0
    }

    /// Mark every reference the payload holds.
    fn trace(&self, heap: &mut Heap);
}

/// A garbage-collected pointer. Copying it copies the reference; the
/// pointee is owned by the [`Heap`] and freed by the collector.
pub struct Gc<T> {
    ptr: NonNull<GcBox<T>>,
}

impl<T> Gc<T> {
    /// Get a mutable reference through a shared GC pointer.
    ///
    /// # Safety
    ///
    /// The caller must not hold another reference to the same payload. The
    /// VM is single-threaded and never keeps payload borrows across
    /// dispatch steps, which is the discipline this relies on.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        &mut (*self.ptr.as_ptr()).value
    }

    /// Erase the payload type. The header keeps the kind tag.
    pub fn as_obj(self) -> ObjRef {
        ObjRef(self.ptr.cast())
    }

    pub fn ptr_eq(self, other: Gc<T>) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Deref for Gc<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &self.ptr.as_ref().value }
    }
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Gc<T> {}

impl<T> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Gc<T> {}

impl<T> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gc({:p})", self.ptr)
    }
}

/// An untyped object reference, as stored in [`Value::Obj`].
#[derive(Clone, Copy)]
pub struct ObjRef(NonNull<GcHeader>);

impl ObjRef {
    fn header(&self) -> &GcHeader {
        unsafe { self.0.as_ref() }
    }

    pub fn kind(self) -> ObjKind {
        self.header().kind
    }

    /// Recover the typed pointer when the kind tag matches.
    pub fn downcast<T: ObjPayload>(self) -> Option<Gc<T>> {
        (self.kind() == T::KIND).then(|| unsafe { self.cast_unchecked() })
    }

    /// Recover the typed pointer without checking the kind tag.
    ///
    /// # Safety
    ///
    /// The object's kind must be `T::KIND`.
    pub unsafe fn cast_unchecked<T>(self) -> Gc<T> {
        Gc { ptr: self.0.cast() }
    }

    pub fn ptr_eq(self, other: ObjRef) -> bool {
        self.0 == other.0
    }

    pub fn is_marked(self) -> bool {
        self.header().marked.get()
    }

    fn set_marked(self, marked: bool) {
        self.header().marked.set(marked);
    }

    fn next(self) -> Option<ObjRef> {
        self.header().next.get()
    }

    fn set_next(self, next: Option<ObjRef>) {
        self.header().next.set(next);
    }
}

impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for ObjRef {}

impl std::hash::Hash for ObjRef {
    /// Identity hash, matching identity equality.
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_usize(self.0.as_ptr() as usize);
    }
}

fn fmt_function(f: &mut fmt::Formatter<'_>, function: &Function) -> fmt::Result {
    match function.name {
        Some(name) => write!(f, "<fn {}>", name.text),
        None => f.write_str("<script>"),
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        unsafe {
            match self.kind() {
                ObjKind::Str => f.write_str(&self.cast_unchecked::<Str>().text),
                ObjKind::Function => fmt_function(f, &self.cast_unchecked::<Function>()),
                ObjKind::Native => f.write_str("<native fn>"),
                ObjKind::Closure => {
                    fmt_function(f, &self.cast_unchecked::<Closure>().function)
                }
                ObjKind::Upvalue => f.write_str("upvalue"),
                ObjKind::Class => f.write_str(&self.cast_unchecked::<Class>().name.text),
                ObjKind::Instance => {
                    write!(
                        f,
                        "{} instance",
                        self.cast_unchecked::<Instance>().class.name.text
                    )
                }
                ObjKind::BoundMethod => {
                    fmt_function(f, &self.cast_unchecked::<BoundMethod>().method.function)
                }
            }
        }
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The collected heap: owner of every object, the string interner, and the
/// collector state.
pub struct Heap {
    /// Head of the all-objects list, newest first.
    objects: Option<ObjRef>,
    /// Interning table. Weak: keys survive a collection only if something
    /// else marked them.
    strings: Table,
    /// Gray worklist for the mark phase.
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            objects: None,
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
        }
    }

    /// Allocate an object and link it into the all-objects list. Never
    /// collects; see the module docs for the safe-point contract.
    pub fn alloc<T: ObjPayload>(&mut self, value: T) -> Gc<T> {
        let size = std::mem::size_of::<GcBox<T>>() + value.owned_size();
        let boxed = Box::new(GcBox {
            header: GcHeader {
                kind: T::KIND,
                marked: Cell::new(false),
                next: Cell::new(self.objects),
            },
            value,
        });
        let gc = Gc {
            ptr: NonNull::from(Box::leak(boxed)),
        };
        self.objects = Some(gc.as_obj());
        self.bytes_allocated += size;
        tracing::trace!(kind = ?T::KIND, size, total = self.bytes_allocated, "allocate");
        gc
    }

    /// Intern a string, copying the text if it is new.
    pub fn intern(&mut self, text: &str) -> Gc<Str> {
        let hash = Str::hash_bytes(text);
        if let Some(existing) = self.strings.find_string(text, hash) {
            return existing;
        }
        self.install_string(Str {
            text: text.into(),
            hash,
        })
    }

    /// Intern a string, taking ownership of an already-built buffer.
    pub fn intern_owned(&mut self, text: String) -> Gc<Str> {
        let hash = Str::hash_bytes(&text);
        if let Some(existing) = self.strings.find_string(&text, hash) {
            return existing;
        }
        self.install_string(Str {
            text: text.into_boxed_str(),
            hash,
        })
    }

    fn install_string(&mut self, string: Str) -> Gc<Str> {
        let s = self.alloc(string);
        self.strings.set(s, Value::Nil);
        s
    }

    /// Whether enough has been allocated since the last collection for the
    /// next safe point to collect.
    pub fn wants_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects; walks the all-objects list.
    pub fn object_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.objects;
        while let Some(obj) = cursor {
            count += 1;
            cursor = obj.next();
        }
        count
    }

    /// Root an object: set its mark bit and queue it for tracing.
    pub fn mark_object(&mut self, obj: ObjRef) {
        if !obj.is_marked() {
            obj.set_marked(true);
            self.gray.push(obj);
        }
    }

    /// Root a value, if it references the heap.
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(obj) = value {
            self.mark_object(obj);
        }
    }

    /// Run a collection. Every root must already be marked via
    /// [`Heap::mark_object`] / [`Heap::mark_value`]; anything unreachable
    /// from them is freed.
    pub fn collect(&mut self) {
        tracing::debug!(live = self.bytes_allocated, "gc begin");
        let before = self.bytes_allocated;

        self.trace_references();
        self.strings.remove_unmarked_keys();
        self.sweep();

        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;
        tracing::debug!(
            freed = before - self.bytes_allocated,
            live = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc end"
        );
    }

    /// Blacken gray objects until the worklist drains.
    fn trace_references(&mut self) {
        while let Some(obj) = self.gray.pop() {
            self.blacken(obj);
        }
    }

    fn blacken(&mut self, obj: ObjRef) {
        unsafe {
            match obj.kind() {
                ObjKind::Str | ObjKind::Native => {}
                ObjKind::Function => obj.cast_unchecked::<Function>().trace(self),
                ObjKind::Closure => obj.cast_unchecked::<Closure>().trace(self),
                ObjKind::Upvalue => obj.cast_unchecked::<Upvalue>().trace(self),
                ObjKind::Class => obj.cast_unchecked::<Class>().trace(self),
                ObjKind::Instance => obj.cast_unchecked::<Instance>().trace(self),
                ObjKind::BoundMethod => obj.cast_unchecked::<BoundMethod>().trace(self),
            }
        }
    }

    /// Unlink and free every unmarked object; clear the mark bit on
    /// survivors.
    fn sweep(&mut self) {
        let mut prev: Option<ObjRef> = None;
        let mut cursor = self.objects;
        while let Some(obj) = cursor {
            let next = obj.next();
            if obj.is_marked() {
                obj.set_marked(false);
                prev = Some(obj);
            } else {
                match prev {
                    Some(p) => p.set_next(next),
                    None => self.objects = next,
                }
                self.bytes_allocated -= unsafe { free_object(obj) };
            }
            cursor = next;
        }
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut cursor = self.objects;
        while let Some(obj) = cursor {
            cursor = obj.next();
            unsafe {
                free_object(obj);
            }
        }
    }
}

/// Reclaim one object, returning the bytes it accounted for.
///
/// # Safety
///
/// `obj` must be unlinked from the all-objects list and unreachable.
unsafe fn free_object(obj: ObjRef) -> usize {
    unsafe fn free<T: ObjPayload>(obj: ObjRef) -> usize {
        let boxed: Box<GcBox<T>> = Box::from_raw(obj.0.cast().as_ptr());
        std::mem::size_of::<GcBox<T>>() + boxed.value.owned_size()
    }

    tracing::trace!(kind = ?obj.kind(), "free");
    match obj.kind() {
        ObjKind::Str => free::<Str>(obj),
        ObjKind::Function => free::<Function>(obj),
        ObjKind::Native => free::<Native>(obj),
        ObjKind::Closure => free::<Closure>(obj),
        ObjKind::Upvalue => free::<Upvalue>(obj),
        ObjKind::Class => free::<Class>(obj),
        ObjKind::Instance => free::<Instance>(obj),
        ObjKind::BoundMethod => free::<BoundMethod>(obj),
    }
}
