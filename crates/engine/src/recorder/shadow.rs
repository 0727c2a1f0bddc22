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

//! Per-frame shadow state: the token stack mirroring the guest operand stack.

use std::collections::HashMap;

use odb_common::types::Tok;
use smallvec::SmallVec;

/// Side-car state for one guest call frame.
///
/// The shadow stack holds one token per live operand-stack slot; its depth
/// must equal the value-stack depth at every opcode boundary. The locals map
/// tracks which token each local name is currently bound to. Underflow is
/// never handled here: methods return `None` and the evaluator escalates to
/// a fatal corruption error, since a mismatched shadow means the trace can
/// no longer be trusted.
#[derive(Debug, Default)]
pub struct FrameShadow {
    /// Ordinal of the mirrored frame
    pub frame_ord: u64,
    /// Code object executing in the mirrored frame
    pub code_id: u32,
    stack: SmallVec<[Tok; 16]>,
    locals: HashMap<u32, Tok>,
}

impl FrameShadow {
    /// Current shadow-stack depth.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Push one token.
    pub fn push(&mut self, tok: Tok) {
        self.stack.push(tok);
    }

    /// Pop one token; `None` on underflow.
    pub fn pop(&mut self) -> Option<Tok> {
        self.stack.pop()
    }

    /// The top `k` tokens in stack order (bottom of the group first);
    /// `None` on underflow.
    pub fn peek(&self, k: usize) -> Option<&[Tok]> {
        self.stack.len().checked_sub(k).map(|base| &self.stack[base..])
    }

    /// Pop the top `k` tokens, returning them in stack order; `None` on
    /// underflow.
    pub fn pop_n(&mut self, k: usize) -> Option<SmallVec<[Tok; 2]>> {
        let base = self.stack.len().checked_sub(k)?;
        let popped = SmallVec::from_slice(&self.stack[base..]);
        self.stack.truncate(base);
        Some(popped)
    }

    /// Duplicate the top `k` tokens, returning the pushed copies.
    pub fn dup(&mut self, k: usize) -> Option<SmallVec<[Tok; 2]>> {
        let base = self.stack.len().checked_sub(k)?;
        let copies: SmallVec<[Tok; 2]> = SmallVec::from_slice(&self.stack[base..]);
        self.stack.extend_from_slice(&copies);
        Some(copies)
    }

    /// Swap the top two tokens.
    pub fn swap(&mut self) -> Option<()> {
        let len = self.stack.len();
        if len < 2 {
            return None;
        }
        self.stack.swap(len - 1, len - 2);
        Some(())
    }

    /// Rotate the top `k` tokens, moving the top one `k - 1` slots down.
    pub fn rot(&mut self, k: usize) -> Option<()> {
        if k < 2 {
            return None;
        }
        let base = self.stack.len().checked_sub(k)?;
        self.stack[base..].rotate_right(1);
        Some(())
    }

    /// Token currently bound to a local name.
    pub fn local(&self, name_id: u32) -> Option<Tok> {
        self.locals.get(&name_id).copied()
    }

    /// Bind a local name to a token.
    pub fn bind_local(&mut self, name_id: u32, tok: Tok) {
        self.locals.insert(name_id, tok);
    }
}

/// Pool of recycled frame shadows.
///
/// Frame lifetimes are strictly LIFO per thread, so a small free list avoids
/// a fresh allocation per guest call.
#[derive(Debug, Default)]
pub struct ShadowPool {
    free: Vec<FrameShadow>,
}

impl ShadowPool {
    /// Maximum number of shadows kept for reuse.
    const MAX_POOLED: usize = 64;

    /// Take a shadow for a newly entered frame.
    pub fn acquire(&mut self, frame_ord: u64, code_id: u32) -> FrameShadow {
        let mut shadow = self.free.pop().unwrap_or_default();
        shadow.frame_ord = frame_ord;
        shadow.code_id = code_id;
        shadow
    }

    /// Return a shadow whose frame exited.
    pub fn release(&mut self, mut shadow: FrameShadow) {
        if self.free.len() < Self::MAX_POOLED {
            shadow.stack.clear();
            shadow.locals.clear();
            self.free.push(shadow);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok(counter: u64) -> Tok {
        Tok::new(0, counter)
    }

    #[test]
    fn test_stack_effects() {
        let mut shadow = FrameShadow::default();
        shadow.push(tok(1));
        shadow.push(tok(2));
        shadow.push(tok(3));
        assert_eq!(shadow.depth(), 3);

        assert_eq!(shadow.peek(2).unwrap(), &[tok(2), tok(3)]);
        shadow.swap().unwrap();
        assert_eq!(shadow.peek(2).unwrap(), &[tok(3), tok(2)]);

        let popped = shadow.pop_n(2).unwrap();
        assert_eq!(popped.as_slice(), &[tok(3), tok(2)]);
        assert_eq!(shadow.depth(), 1);
    }

    #[test]
    fn test_dup_and_rot() {
        let mut shadow = FrameShadow::default();
        shadow.push(tok(1));
        shadow.push(tok(2));
        let copies = shadow.dup(2).unwrap();
        assert_eq!(copies.as_slice(), &[tok(1), tok(2)]);
        assert_eq!(shadow.depth(), 4);

        // [1, 2, 1, 2] -> rot 3 -> [1, 2, 2, 1]... top moves below
        shadow.rot(3).unwrap();
        assert_eq!(shadow.peek(4).unwrap(), &[tok(1), tok(2), tok(2), tok(1)]);
    }

    #[test]
    fn test_underflow_is_reported() {
        let mut shadow = FrameShadow::default();
        shadow.push(tok(1));
        assert!(shadow.pop_n(2).is_none());
        assert!(shadow.peek(2).is_none());
        assert!(shadow.swap().is_none());
        // the failed operations must not have corrupted the stack
        assert_eq!(shadow.depth(), 1);
    }

    #[test]
    fn test_pool_recycles_cleared_shadows() {
        let mut pool = ShadowPool::default();
        let mut shadow = pool.acquire(1, 0);
        shadow.push(tok(9));
        shadow.bind_local(0, tok(9));
        pool.release(shadow);

        let reused = pool.acquire(2, 5);
        assert_eq!(reused.frame_ord, 2);
        assert_eq!(reused.code_id, 5);
        assert_eq!(reused.depth(), 0);
        assert_eq!(reused.local(0), None);
    }
}
