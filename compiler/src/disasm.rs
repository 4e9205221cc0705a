//! A development-only bytecode disassembler, driven by the CLI's `--dump`
//! flag. Not part of the language itself.

use crate::chunk::{Chunk, Function, OpCode};
use crate::value::Constant;
use std::fmt::Write as _;

pub fn disassemble_function(function: &Function) -> String {
    let name = function.name.as_deref().unwrap_or("script");
    let mut out = String::new();
    let _ = writeln!(out, "== {name} ==");
    disassemble_chunk(&function.chunk, &mut out);
    for constant in function.chunk.constants() {
        if let Constant::Function(nested) = constant {
            out.push_str(&disassemble_function(nested));
        }
    }
    out
}

fn disassemble_chunk(chunk: &Chunk, out: &mut String) {
    let code = chunk.code();
    let mut offset = 0;
    while offset < code.len() {
        offset = disassemble_instruction(chunk, offset, out);
    }
}

fn disassemble_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let _ = write!(out, "{offset:04} ");
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.line_at(offset));
    }

    let byte = chunk.code()[offset];
    let op = match OpCode::try_from(byte) {
        Ok(op) => op,
        Err(_) => {
            let _ = writeln!(out, "unknown opcode {byte}");
            return offset + 1;
        }
    };

    match op {
        OpCode::Constant | OpCode::GetGlobal | OpCode::DefineGlobal | OpCode::SetGlobal
        | OpCode::GetProperty | OpCode::SetProperty | OpCode::GetSuper | OpCode::Class
        | OpCode::Method => constant_instruction(op, chunk, offset, out),
        OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(op, chunk, offset, out),
        OpCode::Invoke | OpCode::SuperInvoke => invoke_instruction(op, chunk, offset, out),
        OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(op, chunk, offset, 1, out),
        OpCode::Loop => jump_instruction(op, chunk, offset, -1, out),
        OpCode::Closure => closure_instruction(chunk, offset, out),
        _ => {
            let _ = writeln!(out, "{op:?}");
            offset + 1
        }
    }
}

fn read_u16(chunk: &Chunk, offset: usize) -> u16 {
    u16::from_be_bytes([chunk.code()[offset], chunk.code()[offset + 1]])
}

fn constant_instruction(op: OpCode, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let index = read_u16(chunk, offset + 1);
    let _ = writeln!(out, "{op:?} {index} '{:?}'", chunk.constant(index));
    offset + 3
}

fn byte_instruction(op: OpCode, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code()[offset + 1];
    let _ = writeln!(out, "{op:?} {slot}");
    offset + 2
}

fn invoke_instruction(op: OpCode, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let index = read_u16(chunk, offset + 1);
    let argc = chunk.code()[offset + 3];
    let _ = writeln!(out, "{op:?} ({argc} args) {index} '{:?}'", chunk.constant(index));
    offset + 4
}

fn jump_instruction(op: OpCode, chunk: &Chunk, offset: usize, sign: i32, out: &mut String) -> usize {
    let jump = read_u16(chunk, offset + 1) as i32;
    let target = offset as i32 + 3 + sign * jump;
    let _ = writeln!(out, "{op:?} {offset} -> {target}");
    offset + 3
}

fn closure_instruction(chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let index = read_u16(chunk, offset + 1);
    let _ = writeln!(out, "{:?} {index} '{:?}'", OpCode::Closure, chunk.constant(index));
    let mut cursor = offset + 3;
    if let Constant::Function(function) = chunk.constant(index) {
        for _ in 0..function.upvalue_count {
            let is_local = chunk.code()[cursor];
            let upvalue_index = chunk.code()[cursor + 1];
            let kind = if is_local != 0 { "local" } else { "upvalue" };
            let _ = writeln!(out, "{:04}      | {kind} {upvalue_index}", cursor);
            cursor += 2;
        }
    }
    cursor
}
