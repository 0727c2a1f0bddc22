// ODB - Origin Debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Per-opcode token semantics table.
//!
//! For each opcode the table answers three questions: how many tokens it
//! pops, how many it pushes, and how the pushed tokens relate to the popped
//! ones. The default is a single fresh token whose parents are the consumed
//! tokens; the overrides capture the only places where provenance semantics
//! diverge from that: copies propagate instead of minting, constants have no
//! history, loads link to the binding they read, stores re-bind, and opaque
//! calls terminate the chain.

use odb_common::opcode::Opcode;

/// How an opcode's output tokens are derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRule {
    /// Mint one fresh token; its parents are the consumed tokens.
    Mint,
    /// `LoadConst`: mint with no parents on first load of the constant,
    /// mint-and-link on later loads.
    MintConst,
    /// `LoadLocal`/`LoadGlobal`: mint one fresh token linked to the
    /// binding's current token.
    MintLinked,
    /// `StoreLocal`/`StoreGlobal`: consume one token, record a binding
    /// write, push nothing.
    Rebind,
    /// `BindExcept`: bind the consumed token itself, preserving the
    /// exception's identity.
    RebindExisting,
    /// `Dup`/`Swap`/`Rot`: rearrange existing tokens; nothing is minted.
    Shuffle,
    /// `UnpackSequence`: push `k` entries sharing one fresh token whose
    /// parent is the unpacked sequence.
    Spread,
    /// `Call`: outcome-dependent; see the evaluator.
    Call,
    /// `Return`: transfer the consumed token to the calling frame.
    Return,
    /// `Raise` and faulting opcodes: the event's own token becomes the
    /// exception's identity.
    Raise,
    /// `Unwind`: push the in-flight exception token.
    Unwind,
    /// Branches, `Pop`, `Nop`, `SetupExcept`: consume per arity, push
    /// nothing, mint nothing.
    Discard,
}

/// The per-opcode semantics table used by the instrumented evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpcodeHandler;

impl OpcodeHandler {
    /// Number of tokens `op` pops from the shadow stack.
    pub fn in_arity(&self, op: Opcode, arg: u32) -> usize {
        match op {
            Opcode::Nop |
            Opcode::LoadConst |
            Opcode::LoadLocal |
            Opcode::LoadGlobal |
            Opcode::Jump |
            Opcode::SetupExcept |
            Opcode::Dup |
            Opcode::Swap |
            Opcode::Rot => 0,
            Opcode::StoreLocal |
            Opcode::StoreGlobal |
            Opcode::Pop |
            Opcode::UnaryOp |
            Opcode::JumpIfFalse |
            Opcode::JumpIfTrue |
            Opcode::UnpackSequence |
            Opcode::Return |
            Opcode::Raise |
            Opcode::BindExcept => 1,
            Opcode::BinaryOp => 2,
            Opcode::BuildList => arg as usize,
            Opcode::Call => arg as usize + 1,
            Opcode::Unwind => arg as usize,
        }
    }

    /// Number of entries `op` pushes onto the shadow stack.
    ///
    /// For `Call` this is the completed-call shape (one return value); the
    /// evaluator defers the push when the callee is instrumented, since the
    /// value only appears once the callee frame returns.
    pub fn out_arity(&self, op: Opcode, arg: u32) -> usize {
        match op {
            Opcode::LoadConst |
            Opcode::LoadLocal |
            Opcode::LoadGlobal |
            Opcode::UnaryOp |
            Opcode::BinaryOp |
            Opcode::BuildList |
            Opcode::Call |
            Opcode::Unwind => 1,
            Opcode::Dup | Opcode::UnpackSequence => arg as usize,
            Opcode::Nop |
            Opcode::StoreLocal |
            Opcode::StoreGlobal |
            Opcode::Swap |
            Opcode::Rot |
            Opcode::Pop |
            Opcode::Jump |
            Opcode::JumpIfFalse |
            Opcode::JumpIfTrue |
            Opcode::Return |
            Opcode::Raise |
            Opcode::SetupExcept |
            Opcode::BindExcept => 0,
        }
    }

    /// The token-combination rule for `op`.
    pub fn token_rule(&self, op: Opcode) -> TokenRule {
        match op {
            Opcode::LoadConst => TokenRule::MintConst,
            Opcode::LoadLocal | Opcode::LoadGlobal => TokenRule::MintLinked,
            Opcode::StoreLocal | Opcode::StoreGlobal => TokenRule::Rebind,
            Opcode::BindExcept => TokenRule::RebindExisting,
            Opcode::Dup | Opcode::Swap | Opcode::Rot => TokenRule::Shuffle,
            Opcode::UnpackSequence => TokenRule::Spread,
            Opcode::Call => TokenRule::Call,
            Opcode::Return => TokenRule::Return,
            Opcode::Raise => TokenRule::Raise,
            Opcode::Unwind => TokenRule::Unwind,
            Opcode::UnaryOp | Opcode::BinaryOp | Opcode::BuildList => TokenRule::Mint,
            Opcode::Nop |
            Opcode::Pop |
            Opcode::Jump |
            Opcode::JumpIfFalse |
            Opcode::JumpIfTrue |
            Opcode::SetupExcept => TokenRule::Discard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arities_balance_known_opcodes() {
        let handler = OpcodeHandler;
        // BinaryOp: 2 in, 1 out
        assert_eq!(handler.in_arity(Opcode::BinaryOp, 0), 2);
        assert_eq!(handler.out_arity(Opcode::BinaryOp, 0), 1);
        // Call with 3 args pops callee + args
        assert_eq!(handler.in_arity(Opcode::Call, 3), 4);
        assert_eq!(handler.out_arity(Opcode::Call, 3), 1);
        // Unpack of 4 pops the sequence and pushes 4 entries
        assert_eq!(handler.in_arity(Opcode::UnpackSequence, 4), 1);
        assert_eq!(handler.out_arity(Opcode::UnpackSequence, 4), 4);
        // Unwind pops exactly what the interpreter reports
        assert_eq!(handler.in_arity(Opcode::Unwind, 7), 7);
        assert_eq!(handler.out_arity(Opcode::Unwind, 7), 1);
    }

    #[test]
    fn test_rules() {
        let handler = OpcodeHandler;
        assert_eq!(handler.token_rule(Opcode::LoadConst), TokenRule::MintConst);
        assert_eq!(handler.token_rule(Opcode::Dup), TokenRule::Shuffle);
        assert_eq!(handler.token_rule(Opcode::BinaryOp), TokenRule::Mint);
        assert_eq!(handler.token_rule(Opcode::JumpIfTrue), TokenRule::Discard);
        assert_eq!(handler.token_rule(Opcode::BindExcept), TokenRule::RebindExisting);
    }
}
