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

//! Host integration contract between a guest evaluator and the recorder.
//!
//! A host VM that wants its execution recorded drives a [`RecordHook`]: it
//! announces code objects as they load, brackets every opcode with
//! [`RecordHook::step`] / [`RecordHook::step_end`], and reports frame
//! transitions. The recorder is one implementation of this trait; hosts can
//! run with no hook installed at zero cost.
//!
//! The contract is deliberately shaped like an inspector: `step` fires
//! *before* the host advances, `step_end` fires after the opcode's semantic
//! effect is known. A hook error means "stop the guest"; hosts must unwind
//! and tear the session down when any method fails.

use eyre::Result;

use crate::opcode::Opcode;
use crate::types::{CodeInfo, ExternalCall};

/// Everything the recorder may observe about one opcode dispatch.
#[derive(Debug)]
pub struct StepContext<'a> {
    /// Executing guest thread
    pub thread_id: u16,
    /// Code object being executed
    pub code: &'a CodeInfo,
    /// Instruction offset of the opcode within the code object
    pub instr_offset: u32,
    /// The dispatched opcode
    pub opcode: Opcode,
    /// The opcode's argument
    pub arg: u32,
    /// Value-stack depth before the opcode executes
    pub stack_depth: usize,
}

/// The semantic effect of one executed opcode, reported to
/// [`RecordHook::step_end`].
#[derive(Debug)]
pub enum StepOutcome {
    /// The opcode completed within the current frame.
    Completed {
        /// Rendering of the value a store-family opcode bound, when any
        stored: Option<String>,
    },
    /// A call resolved to an instrumented guest function; the host will push
    /// a frame for `code_id` and announce it via [`RecordHook::frame_enter`].
    EnterFrame {
        /// Code object of the callee
        code_id: u32,
    },
    /// A call resolved to an opaque callee which already returned.
    External {
        /// Identity of the opaque callee
        call: ExternalCall,
        /// Rendering of the returned value
        pushed: Option<String>,
    },
    /// The current frame returned to its caller.
    Return {
        /// Rendering of the returned value
        returned: Option<String>,
    },
    /// The opcode raised a guest exception.
    Fault {
        /// Human-readable description of the exception
        message: String,
    },
}

/// Observer installed into a guest evaluator's dispatch loop.
///
/// Method order per frame: one `frame_enter`, then `step`/`step_end` pairs,
/// closed by either a `step_end` reporting [`StepOutcome::Return`] or a
/// `frame_unwound` when an unhandled exception discards the frame.
pub trait RecordHook {
    /// A code object became visible to the evaluator (first load).
    fn code_loaded(&mut self, code: &CodeInfo) -> Result<()>;

    /// A frame for `code_id` is about to execute its first opcode.
    fn frame_enter(&mut self, thread_id: u16, code_id: u32) -> Result<()>;

    /// An opcode is about to execute.
    fn step(&mut self, ctx: &StepContext<'_>) -> Result<()>;

    /// The opcode from the matching [`RecordHook::step`] finished with
    /// `outcome`.
    fn step_end(&mut self, ctx: &StepContext<'_>, outcome: &StepOutcome) -> Result<()>;

    /// The current frame was discarded by exception propagation; no return
    /// value crossed the boundary.
    fn frame_unwound(&mut self, thread_id: u16) -> Result<()>;
}

/// No-op hook for hosts running unrecorded.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHook;

impl RecordHook for NullHook {
    fn code_loaded(&mut self, _code: &CodeInfo) -> Result<()> {
        Ok(())
    }

    fn frame_enter(&mut self, _thread_id: u16, _code_id: u32) -> Result<()> {
        Ok(())
    }

    fn step(&mut self, _ctx: &StepContext<'_>) -> Result<()> {
        Ok(())
    }

    fn step_end(&mut self, _ctx: &StepContext<'_>, _outcome: &StepOutcome) -> Result<()> {
        Ok(())
    }

    fn frame_unwound(&mut self, _thread_id: u16) -> Result<()> {
        Ok(())
    }
}
