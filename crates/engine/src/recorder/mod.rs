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

//! The recording half: instrumented evaluation of a live guest.
//!
//! For every opcode a hooked guest VM dispatches, the
//! [`InstrumentedEvaluator`] increments the per-thread instruction counter,
//! mirrors the operand-stack effect on a per-frame shadow stack of origin
//! tokens, and appends one [`InstructionEvent`] to the trace. The
//! per-opcode token semantics (how many tokens an opcode consumes and
//! produces, and how output tokens relate to inputs) live in the
//! [`OpcodeHandler`] table.
//!
//! [`InstructionEvent`]: odb_common::types::InstructionEvent

pub mod context;
pub use context::*;

pub mod evaluator;
pub use evaluator::*;

pub mod handler;
pub use handler::*;

pub mod shadow;
pub use shadow::*;
