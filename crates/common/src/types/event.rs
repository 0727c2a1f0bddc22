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

//! Instruction events: the atomic records of the provenance log.

use derive_more::From;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::opcode::Opcode;
use crate::types::Tok;

/// A named-binding access recorded alongside an instruction event.
///
/// `LoadLocal`-family opcodes record the binding they read (name and the
/// token currently bound to it); `StoreLocal`-family opcodes record the
/// binding they write, optionally with a concrete rendering of the stored
/// value for later inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Index into the code object's local-name table (or the global-name
    /// table for global bindings)
    pub name_id: u32,
    /// Token bound to the name
    pub tok: Tok,
    /// Concrete rendering of the bound value, when the host supplied one
    pub repr: Option<String>,
}

impl Binding {
    /// Binding without a concrete rendering.
    pub fn new(name_id: u32, tok: Tok) -> Self {
        Self { name_id, tok, repr: None }
    }
}

/// Identity of an opaque callee at a provenance boundary.
///
/// Calls into code that is not under instrumentation terminate provenance
/// chains; the produced value becomes a root labelled with the callee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalCall {
    /// Fully-qualified callable name, e.g. `random.randint`
    pub callee_name: String,
    /// Hash of the argument types, for distinguishing overloads
    pub signature_hash: u64,
}

/// The atomic log record: one executed guest opcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionEvent {
    /// Per-thread instruction counter (strictly increases by 1 per opcode)
    pub counter: u64,
    /// Ordinal of the frame the opcode executed in
    pub frame_ord: u64,
    /// Executing guest thread
    pub thread_id: u16,
    /// The executed opcode
    pub opcode: Opcode,
    /// The opcode's argument
    pub arg: u32,
    /// Code object the opcode belongs to
    pub code_id: u32,
    /// Instruction offset within the code object
    pub instr_offset: u32,
    /// Tokens popped from the operand stack
    pub consumed: SmallVec<[Tok; 2]>,
    /// Tokens pushed (usually 0 or 1, up to k for DUP/UNPACK)
    pub produced: SmallVec<[Tok; 1]>,
    /// Named bindings read by this opcode
    pub reads: SmallVec<[Binding; 1]>,
    /// Named bindings written by this opcode
    pub writes: SmallVec<[Binding; 1]>,
    /// The guest raised an exception while executing this opcode
    pub fault: bool,
    /// Present when the opcode called an opaque callee
    pub ext: Option<ExternalCall>,
}

impl InstructionEvent {
    /// The token identifying the value minted at this event, i.e. the token
    /// whose counter equals this event's counter.
    pub fn own_tok(&self) -> Tok {
        Tok::new(self.thread_id, self.counter)
    }
}

/// Why a recording session stopped before the guest finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// Cooperative cancellation was requested
    Cancelled,
    /// The process forked and the configured policy refuses to record in the
    /// child
    ForkedChild,
    /// A trace invariant (I1-I5) was violated
    TraceCorruption,
    /// The stepping callback returned an error
    CallbackFailed,
}

impl AbortReason {
    /// Stable string used in the on-disk record and in diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::ForkedChild => "forked-child",
            Self::TraceCorruption => "trace-corruption",
            Self::CallbackFailed => "callback-failed",
        }
    }

    /// Parse the on-disk string form.
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "cancelled" => Some(Self::Cancelled),
            "forked-child" => Some(Self::ForkedChild),
            "trace-corruption" => Some(Self::TraceCorruption),
            "callback-failed" => Some(Self::CallbackFailed),
            _ => None,
        }
    }
}

/// Final record of a session that stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortEvent {
    /// Counter of the last observed opcode on the aborting thread
    pub counter: u64,
    /// The aborting thread
    pub thread_id: u16,
    /// Why the session stopped
    pub reason: AbortReason,
}

/// Any record appearing in the event stream.
#[derive(Debug, Clone, PartialEq, From, Serialize, Deserialize)]
pub enum TraceEvent {
    /// An executed guest opcode
    Instr(#[from] InstructionEvent),
    /// Early session termination
    Abort(#[from] AbortEvent),
}

impl TraceEvent {
    /// The per-thread counter of this record.
    pub fn counter(&self) -> u64 {
        match self {
            Self::Instr(e) => e.counter,
            Self::Abort(e) => e.counter,
        }
    }

    /// The thread this record belongs to.
    pub fn thread_id(&self) -> u16 {
        match self {
            Self::Instr(e) => e.thread_id,
            Self::Abort(e) => e.thread_id,
        }
    }

    /// The instruction payload, when this is an instruction record.
    pub fn as_instr(&self) -> Option<&InstructionEvent> {
        match self {
            Self::Instr(e) => Some(e),
            Self::Abort(_) => None,
        }
    }
}
