//! The Flint instruction set.
//!
//! Every instruction is a single opcode byte followed by zero or more inline
//! operand bytes. Constant and variable references are one-byte indices into
//! the chunk's constant pool; jump offsets are 16-bit big-endian.

use std::fmt::Display;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The operand bytes that follow an opcode in the instruction stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    /// No operand.
    None,
    /// One raw byte (a stack slot, upvalue index or argument count).
    Byte,
    /// One byte indexing into the constant pool.
    Const,
    /// A 16-bit big-endian forward jump offset.
    Jump,
    /// A 16-bit big-endian backward jump offset.
    Loop,
    /// A constant-pool index followed by an argument count.
    ConstByte,
    /// A constant-pool index followed by `upvalue_count` pairs of
    /// `(is_local, index)` bytes read by the VM, not by this crate.
    Closure,
}

macro_rules! define_ops {
    (
        $(#[$meta:meta])*
        $vis:vis $type:ident,
        $(
            $(#[$variant_meta:meta])*
            $name:ident $mnemonic:literal ($operand:ident)
        ),* $(,)?
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
        #[repr(u8)]
        $vis enum $type {$(
            $(#[$variant_meta])*
            $name
        ),*}

        impl $type {
            /// The operand shape following this opcode.
            pub fn operand(self) -> Operand {
                match self {$(
                    Self::$name => Operand::$operand
                ),*}
            }

            /// The disassembler mnemonic for this opcode.
            pub fn mnemonic(self) -> &'static str {
                match self {$(
                    Self::$name => $mnemonic
                ),*}
            }
        }

        impl Display for $type {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.mnemonic())
            }
        }
    };
}

// Instruction definition. Each line is one opcode together with the
// mnemonic the disassembler prints and the shape of its inline operands.
define_ops! {
    /// The Flint opcode set. Conversions to and from the raw byte go
    /// through [`num_enum`]; an out-of-range byte is a malformed chunk.
    pub Op,

    /// Push a constant from the pool.
    Constant "OP_CONSTANT" (Const),
    /// Push `nil`.
    Nil "OP_NIL" (None),
    /// Push `true`.
    True "OP_TRUE" (None),
    /// Push `false`.
    False "OP_FALSE" (None),
    /// Discard the stack top.
    Pop "OP_POP" (None),

    /// Push the local at the frame-relative slot.
    GetLocal "OP_GET_LOCAL" (Byte),
    /// Write the stack top into the frame-relative slot, keeping it pushed.
    SetLocal "OP_SET_LOCAL" (Byte),
    /// Push the global named by the constant; undefined is a runtime error.
    GetGlobal "OP_GET_GLOBAL" (Const),
    /// Define (or redefine) a global from the stack top, then pop it.
    DefineGlobal "OP_DEFINE_GLOBAL" (Const),
    /// Assign to an existing global; never creates one.
    SetGlobal "OP_SET_GLOBAL" (Const),
    /// Push the value behind the closure's upvalue.
    GetUpvalue "OP_GET_UPVALUE" (Byte),
    /// Write the stack top through the closure's upvalue.
    SetUpvalue "OP_SET_UPVALUE" (Byte),
    /// Read a field or bind a method on the instance at the stack top.
    GetProperty "OP_GET_PROPERTY" (Const),
    /// Write a field on the instance below the stack top.
    SetProperty "OP_SET_PROPERTY" (Const),
    /// Pop a superclass and bind one of its methods to `this`.
    GetSuper "OP_GET_SUPER" (Const),

    /// Pop two values, push their equality.
    Equal "OP_EQUAL" (None),
    /// Pop two numbers, push `a > b`.
    Greater "OP_GREATER" (None),
    /// Pop two numbers, push `a < b`.
    Less "OP_LESS" (None),
    /// Add two numbers or concatenate two strings.
    Add "OP_ADD" (None),
    Subtract "OP_SUBTRACT" (None),
    Multiply "OP_MULTIPLY" (None),
    Divide "OP_DIVIDE" (None),
    /// Logical not via truthiness.
    Not "OP_NOT" (None),
    /// Arithmetic negation of a number.
    Negate "OP_NEGATE" (None),

    /// Pop a value and write it to standard output with a newline.
    Print "OP_PRINT" (None),
    /// Unconditional forward branch.
    Jump "OP_JUMP" (Jump),
    /// Forward branch when the (peeked, not popped) condition is falsey.
    JumpIfFalse "OP_JUMP_IF_FALSE" (Jump),
    /// Backward branch.
    Loop "OP_LOOP" (Loop),

    /// Call the value below `arg_count` arguments.
    Call "OP_CALL" (Byte),
    /// Fused property-get-then-call on an instance.
    Invoke "OP_INVOKE" (ConstByte),
    /// Pop a superclass and invoke one of its methods on `this`.
    SuperInvoke "OP_SUPER_INVOKE" (ConstByte),
    /// Wrap the function constant in a closure, then capture its upvalues.
    Closure "OP_CLOSURE" (Closure),
    /// Hoist the captured local at the stack top into its upvalue, then pop.
    CloseUpvalue "OP_CLOSE_UPVALUE" (None),
    /// Return from the current frame.
    Return "OP_RETURN" (None),

    /// Push a fresh class named by the constant.
    Class "OP_CLASS" (Const),
    /// Copy the superclass's methods into the subclass, then pop the subclass.
    Inherit "OP_INHERIT" (None),
    /// Install the closure at the stack top as a method on the class below.
    Method "OP_METHOD" (Const),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn opcode_round_trips_through_its_byte() {
        for byte in 0..=u8::MAX {
            if let Ok(op) = Op::try_from(byte) {
                assert_eq!(u8::from(op), byte);
            }
        }
        // The first and last opcodes pin the range.
        assert_eq!(u8::from(Op::Constant), 0);
        assert!(Op::try_from(u8::from(Op::Method) + 1).is_err());
    }

    #[test]
    fn operand_shapes() {
        assert_eq!(Op::Constant.operand(), Operand::Const);
        assert_eq!(Op::GetLocal.operand(), Operand::Byte);
        assert_eq!(Op::Jump.operand(), Operand::Jump);
        assert_eq!(Op::Loop.operand(), Operand::Loop);
        assert_eq!(Op::Invoke.operand(), Operand::ConstByte);
        assert_eq!(Op::Closure.operand(), Operand::Closure);
        assert_eq!(Op::Return.operand(), Operand::None);
    }

    #[test]
    fn mnemonics_match_display() {
        assert_eq!(Op::SuperInvoke.to_string(), "OP_SUPER_INVOKE");
        assert_eq!(Op::CloseUpvalue.mnemonic(), "OP_CLOSE_UPVALUE");
    }
}
