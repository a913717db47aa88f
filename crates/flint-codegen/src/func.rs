//! The per-function compilation context: the chunk being emitted, local
//! slots, upvalue capture bookkeeping and the constant pool.

use fnv::FnvHashMap;
use smol_str::SmolStr;

use flint_bytecode::Op;
use flint_core::chunk::MAX_CONSTANTS;
use flint_core::object::{Function, Str};
use flint_core::{Gc, Value};

/// Local slots are addressed by one byte.
pub(crate) const MAX_LOCALS: usize = 256;
/// So are upvalue indices.
pub(crate) const MAX_UPVALUES: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

pub(crate) struct Local {
    pub name: SmolStr,
    /// `None` between declaration and initialization, which is how reading
    /// a local inside its own initializer is detected.
    pub depth: Option<u32>,
    pub is_captured: bool,
}

/// One entry of the upvalue table emitted after `OP_CLOSURE`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct UpvalueRef {
    pub index: u8,
    pub is_local: bool,
}

/// Reverse-map key for constant deduplication. Numbers key on their bit
/// pattern; objects on identity, which for interned strings is content.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum ConstKey {
    Nil,
    Bool(bool),
    Number(u64),
    Obj(flint_core::ObjRef),
}

fn const_key(value: Value) -> ConstKey {
    match value {
        Value::Nil => ConstKey::Nil,
        Value::Bool(b) => ConstKey::Bool(b),
        Value::Number(n) => ConstKey::Number(n.to_bits()),
        Value::Obj(obj) => ConstKey::Obj(obj),
    }
}

pub(crate) struct FunctionCtx {
    pub enclosing: Option<Box<FunctionCtx>>,
    pub kind: FunctionKind,
    pub function: Function,
    pub locals: Vec<Local>,
    pub upvalues: Vec<UpvalueRef>,
    pub scope_depth: u32,
    constants: FnvHashMap<ConstKey, u8>,
}

impl FunctionCtx {
    pub fn new(kind: FunctionKind, name: Option<Gc<Str>>) -> FunctionCtx {
        // Slot 0 belongs to the callee, or to `this` inside methods, so
        // user locals can never shadow it.
        let slot_zero = Local {
            name: match kind {
                FunctionKind::Method | FunctionKind::Initializer => SmolStr::new("this"),
                _ => SmolStr::default(),
            },
            depth: Some(0),
            is_captured: false,
        };
        FunctionCtx {
            enclosing: None,
            kind,
            function: Function::new(name),
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            constants: FnvHashMap::default(),
        }
    }

    pub fn code_len(&self) -> usize {
        self.function.chunk.code.len()
    }

    // === Emission ===

    pub fn emit_byte(&mut self, byte: u8, line: u32) {
        self.function.chunk.write(byte, line);
    }

    pub fn emit_op(&mut self, op: Op, line: u32) {
        self.emit_byte(op.into(), line);
    }

    pub fn emit_pair(&mut self, op: Op, operand: u8, line: u32) {
        self.emit_op(op, line);
        self.emit_byte(operand, line);
    }

    /// The implicit return: initializers hand back `this`, everything else
    /// `nil`.
    pub fn emit_return(&mut self, line: u32) {
        if self.kind == FunctionKind::Initializer {
            self.emit_pair(Op::GetLocal, 0, line);
        } else {
            self.emit_op(Op::Nil, line);
        }
        self.emit_op(Op::Return, line);
    }

    pub fn make_constant(&mut self, value: Value) -> Result<u8, &'static str> {
        if let Some(&index) = self.constants.get(&const_key(value)) {
            return Ok(index);
        }
        if self.function.chunk.constants.len() >= MAX_CONSTANTS {
            return Err("Too many constants in one chunk.");
        }
        let index = self.function.chunk.add_constant(value) as u8;
        self.constants.insert(const_key(value), index);
        Ok(index)
    }

    pub fn emit_constant(&mut self, value: Value, line: u32) -> Result<(), &'static str> {
        let index = self.make_constant(value)?;
        self.emit_pair(Op::Constant, index, line);
        Ok(())
    }

    /// Emit a forward jump with a placeholder offset; returns the offset to
    /// hand back to [`FunctionCtx::patch_jump`].
    pub fn emit_jump(&mut self, op: Op, line: u32) -> usize {
        self.emit_op(op, line);
        self.emit_byte(0xff, line);
        self.emit_byte(0xff, line);
        self.code_len() - 2
    }

    pub fn patch_jump(&mut self, offset: usize) -> Result<(), &'static str> {
        // Lands just past the two offset bytes.
        let jump = self.code_len() - offset - 2;
        if jump > u16::MAX as usize {
            return Err("Too much code to jump over.");
        }
        let [hi, lo] = (jump as u16).to_be_bytes();
        self.function.chunk.code[offset] = hi;
        self.function.chunk.code[offset + 1] = lo;
        Ok(())
    }

    pub fn emit_loop(&mut self, loop_start: usize, line: u32) -> Result<(), &'static str> {
        self.emit_op(Op::Loop, line);
        let jump = self.code_len() - loop_start + 2;
        if jump > u16::MAX as usize {
            return Err("Loop body too large.");
        }
        let [hi, lo] = (jump as u16).to_be_bytes();
        self.emit_byte(hi, line);
        self.emit_byte(lo, line);
        Ok(())
    }

    // === Locals and upvalues ===

    /// Record a local in the current scope, rejecting redeclaration within
    /// the same scope. No-op at global scope.
    pub fn declare_local(&mut self, name: &str) -> Result<(), &'static str> {
        if self.scope_depth == 0 {
            return Ok(());
        }
        for local in self.locals.iter().rev() {
            if let Some(depth) = local.depth {
                if depth < self.scope_depth {
                    break;
                }
            }
            if local.name == name {
                return Err("Already a variable with this name in this scope.");
            }
        }
        if self.locals.len() == MAX_LOCALS {
            return Err("Too many local variables in function.");
        }
        self.locals.push(Local {
            name: SmolStr::new(name),
            depth: None,
            is_captured: false,
        });
        Ok(())
    }

    pub fn mark_initialized(&mut self) {
        if self.scope_depth == 0 {
            return;
        }
        if let Some(local) = self.locals.last_mut() {
            local.depth = Some(self.scope_depth);
        }
    }

    pub fn resolve_local(&self, name: &str) -> Result<Option<u8>, &'static str> {
        for (slot, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth.is_none() {
                    return Err("Can't read local variable in its own initializer.");
                }
                return Ok(Some(slot as u8));
            }
        }
        Ok(None)
    }

    /// Resolve a name against enclosing functions, materializing upvalues
    /// along the chain. The closest enclosing local gets flagged as
    /// captured so its scope exit closes rather than pops it.
    pub fn resolve_upvalue(&mut self, name: &str) -> Result<Option<u8>, &'static str> {
        let Some(enclosing) = self.enclosing.as_deref_mut() else {
            return Ok(None);
        };

        let local = enclosing.resolve_local(name)?;
        if let Some(slot) = local {
            enclosing.locals[slot as usize].is_captured = true;
        }
        let transitive = match local {
            Some(_) => None,
            None => enclosing.resolve_upvalue(name)?,
        };

        match (local, transitive) {
            (Some(index), _) => self.add_upvalue(index, true).map(Some),
            (None, Some(index)) => self.add_upvalue(index, false).map(Some),
            (None, None) => Ok(None),
        }
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8, &'static str> {
        let entry = UpvalueRef { index, is_local };
        if let Some(existing) = self.upvalues.iter().position(|&u| u == entry) {
            return Ok(existing as u8);
        }
        if self.upvalues.len() == MAX_UPVALUES {
            return Err("Too many closure variables in function.");
        }
        self.upvalues.push(entry);
        self.function.upvalue_count = self.upvalues.len();
        Ok((self.upvalues.len() - 1) as u8)
    }
}
