// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
// SPDX-License-Identifier: AGPL-3.0
//! Guest opcode table and classification utilities
//!
//! This module defines the bytecode instruction set of the recorded guest
//! language together with a classification trait used by the recorder to
//! decide how each opcode moves origin tokens around. The set is deliberately
//! small: a dynamically-typed stack machine with locals, globals, calls and
//! structured exception unwinding.

use serde::{Deserialize, Serialize};

/// Bytecode opcodes of the recorded guest language.
///
/// Every opcode carries a single `u32` argument whose meaning depends on the
/// opcode (constant index, name index, jump target, argument count, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum Opcode {
    /// No operation; still counted and logged
    Nop = 0x00,
    /// Push constant `arg` from the code object's constant table
    LoadConst = 0x01,
    /// Push the value bound to local name `arg`
    LoadLocal = 0x02,
    /// Pop a value and bind it to local name `arg`
    StoreLocal = 0x03,
    /// Push the value bound to global name `arg`
    LoadGlobal = 0x04,
    /// Pop a value and bind it to global name `arg`
    StoreGlobal = 0x05,
    /// Duplicate the top `arg` stack entries
    Dup = 0x06,
    /// Swap the top two stack entries
    Swap = 0x07,
    /// Rotate the top `arg` stack entries (top goes to position `arg`)
    Rot = 0x08,
    /// Discard the top stack entry
    Pop = 0x09,
    /// Apply unary operation `arg` (see [`UnaryKind`]) to the top entry
    UnaryOp = 0x0a,
    /// Apply binary operation `arg` (see [`BinaryKind`]) to the top two entries
    BinaryOp = 0x0b,
    /// Pop `arg` entries and push a list of them
    BuildList = 0x0c,
    /// Pop a sequence and push its `arg` elements (leftmost on top)
    UnpackSequence = 0x0d,
    /// Unconditional jump to instruction offset `arg`
    Jump = 0x0e,
    /// Pop a value; jump to `arg` when it is falsy
    JumpIfFalse = 0x0f,
    /// Pop a value; jump to `arg` when it is truthy
    JumpIfTrue = 0x10,
    /// Pop `arg` arguments plus the callee and call it
    Call = 0x11,
    /// Pop the return value and leave the current frame
    Return = 0x12,
    /// Pop a value and raise it as an exception
    Raise = 0x13,
    /// Install exception handler at instruction offset `arg` for this frame
    SetupExcept = 0x14,
    /// Pop the stack back to the handler's depth during exception unwinding
    Unwind = 0x15,
    /// Bind the in-flight exception to local name `arg`
    BindExcept = 0x16,
}

impl Opcode {
    /// Decode an opcode from its on-disk `u16` representation.
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            0x00 => Self::Nop,
            0x01 => Self::LoadConst,
            0x02 => Self::LoadLocal,
            0x03 => Self::StoreLocal,
            0x04 => Self::LoadGlobal,
            0x05 => Self::StoreGlobal,
            0x06 => Self::Dup,
            0x07 => Self::Swap,
            0x08 => Self::Rot,
            0x09 => Self::Pop,
            0x0a => Self::UnaryOp,
            0x0b => Self::BinaryOp,
            0x0c => Self::BuildList,
            0x0d => Self::UnpackSequence,
            0x0e => Self::Jump,
            0x0f => Self::JumpIfFalse,
            0x10 => Self::JumpIfTrue,
            0x11 => Self::Call,
            0x12 => Self::Return,
            0x13 => Self::Raise,
            0x14 => Self::SetupExcept,
            0x15 => Self::Unwind,
            0x16 => Self::BindExcept,
            _ => return None,
        })
    }

    /// The on-disk `u16` representation.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Mnemonic used in diagnostics and summaries.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nop => "NOP",
            Self::LoadConst => "LOAD_CONST",
            Self::LoadLocal => "LOAD_LOCAL",
            Self::StoreLocal => "STORE_LOCAL",
            Self::LoadGlobal => "LOAD_GLOBAL",
            Self::StoreGlobal => "STORE_GLOBAL",
            Self::Dup => "DUP",
            Self::Swap => "SWAP",
            Self::Rot => "ROT",
            Self::Pop => "POP",
            Self::UnaryOp => "UNARY_OP",
            Self::BinaryOp => "BINARY_OP",
            Self::BuildList => "BUILD_LIST",
            Self::UnpackSequence => "UNPACK_SEQUENCE",
            Self::Jump => "JUMP",
            Self::JumpIfFalse => "JUMP_IF_FALSE",
            Self::JumpIfTrue => "JUMP_IF_TRUE",
            Self::Call => "CALL",
            Self::Return => "RETURN",
            Self::Raise => "RAISE",
            Self::SetupExcept => "SETUP_EXCEPT",
            Self::Unwind => "UNWIND",
            Self::BindExcept => "BIND_EXCEPT",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unary operation selector carried in [`Opcode::UnaryOp`]'s argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum UnaryKind {
    /// Arithmetic negation
    Neg = 0,
    /// Boolean not
    Not = 1,
}

impl UnaryKind {
    /// Decode from an opcode argument.
    pub fn from_arg(arg: u32) -> Option<Self> {
        match arg {
            0 => Some(Self::Neg),
            1 => Some(Self::Not),
            _ => None,
        }
    }
}

/// Binary operation selector carried in [`Opcode::BinaryOp`]'s argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum BinaryKind {
    /// Addition
    Add = 0,
    /// Subtraction
    Sub = 1,
    /// Multiplication
    Mul = 2,
    /// Division; raises a guest fault on division by zero
    Div = 3,
    /// Equality comparison
    Eq = 4,
    /// Less-than comparison
    Lt = 5,
    /// Greater-than comparison
    Gt = 6,
}

impl BinaryKind {
    /// Decode from an opcode argument.
    pub fn from_arg(arg: u32) -> Option<Self> {
        match arg {
            0 => Some(Self::Add),
            1 => Some(Self::Sub),
            2 => Some(Self::Mul),
            3 => Some(Self::Div),
            4 => Some(Self::Eq),
            5 => Some(Self::Lt),
            6 => Some(Self::Gt),
            _ => None,
        }
    }
}

/// Extended trait for guest opcode analysis
///
/// Provides classification predicates the recorder and the replay engine use
/// to decide how an opcode affects origin tokens without consulting the full
/// per-opcode handler table.
pub trait OpcodeTr {
    /// Check if this opcode only rearranges existing stack entries.
    ///
    /// Copy-family opcodes propagate existing tokens instead of minting new
    /// ones; they never create parent edges.
    fn is_copy(&self) -> bool;

    /// Check if this opcode transfers control into another frame
    fn is_call(&self) -> bool;

    /// Check if this opcode is a branching opcode.
    ///
    /// Branches are still logged so replay can reconstruct control flow, but
    /// they never produce a value.
    fn is_branch(&self) -> bool;

    /// Check if this opcode reads or writes a named binding
    fn touches_binding(&self) -> bool;
}

impl OpcodeTr for Opcode {
    fn is_copy(&self) -> bool {
        matches!(*self, Self::Dup | Self::Swap | Self::Rot)
    }

    fn is_call(&self) -> bool {
        matches!(*self, Self::Call)
    }

    fn is_branch(&self) -> bool {
        matches!(*self, Self::Jump | Self::JumpIfFalse | Self::JumpIfTrue)
    }

    fn touches_binding(&self) -> bool {
        matches!(
            *self,
            Self::LoadLocal |
                Self::StoreLocal |
                Self::LoadGlobal |
                Self::StoreGlobal |
                Self::BindExcept
        )
    }
}
