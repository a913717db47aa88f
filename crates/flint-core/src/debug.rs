//! Chunk disassembler, shared by the bytecode dump flag and the VM's
//! per-instruction trace hook.

use std::fmt::Write;

use flint_bytecode::{Op, Operand};

use crate::chunk::Chunk;
use crate::object::Function;

pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        let (text, next) = disassemble_instruction(chunk, offset);
        out.push_str(&text);
        out.push('\n');
        offset = next;
    }
    out
}

/// Render the instruction at `offset` (without a trailing newline) and
/// return the offset of the next instruction. `OP_CLOSURE` renders extra
/// lines for its upvalue trailer.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut out = String::new();
    let _ = write!(out, "{:04} ", offset);
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        out.push_str("   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.lines[offset]);
    }

    let op = match Op::try_from(chunk.code[offset]) {
        Ok(op) => op,
        Err(_) => {
            let _ = write!(out, "Unknown opcode {}", chunk.code[offset]);
            return (out, offset + 1);
        }
    };

    let next = match op.operand() {
        Operand::None => {
            let _ = write!(out, "{}", op);
            offset + 1
        }
        Operand::Byte => {
            let slot = chunk.code[offset + 1];
            let _ = write!(out, "{:<16} {:4}", op.mnemonic(), slot);
            offset + 2
        }
        Operand::Const => {
            let constant = chunk.code[offset + 1];
            let _ = write!(
                out,
                "{:<16} {:4} '{}'",
                op.mnemonic(),
                constant,
                chunk.constants[constant as usize]
            );
            offset + 2
        }
        Operand::Jump | Operand::Loop => {
            let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]);
            let target = if op.operand() == Operand::Loop {
                offset + 3 - jump as usize
            } else {
                offset + 3 + jump as usize
            };
            let _ = write!(out, "{:<16} {:4} -> {}", op.mnemonic(), offset, target);
            offset + 3
        }
        Operand::ConstByte => {
            let constant = chunk.code[offset + 1];
            let arg_count = chunk.code[offset + 2];
            let _ = write!(
                out,
                "{:<16} ({} args) {:4} '{}'",
                op.mnemonic(),
                arg_count,
                constant,
                chunk.constants[constant as usize]
            );
            offset + 3
        }
        Operand::Closure => {
            let constant = chunk.code[offset + 1];
            let value = chunk.constants[constant as usize];
            let _ = write!(out, "{:<16} {:4} {}", op.mnemonic(), constant, value);

            // The trailer length comes from the function constant itself.
            let upvalue_count = value
                .as_obj()
                .and_then(|obj| obj.downcast::<Function>())
                .map_or(0, |f| f.upvalue_count);
            let mut cursor = offset + 2;
            for _ in 0..upvalue_count {
                let is_local = chunk.code[cursor] != 0;
                let index = chunk.code[cursor + 1];
                let _ = write!(
                    out,
                    "\n{:04}      |                     {} {}",
                    cursor,
                    if is_local { "local" } else { "upvalue" },
                    index
                );
                cursor += 2;
            }
            cursor
        }
    };
    (out, next)
}
