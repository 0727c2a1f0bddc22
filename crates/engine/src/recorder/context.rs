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

//! Per-thread recording state: counters, callback threshold, cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-thread recorder bookkeeping.
///
/// Counters only advance for observable opcodes; purely internal host
/// operations never touch them. The instruction counter strictly increases by
/// one per opcode, which makes `(thread_id, counter)` the identity of every
/// produced value.
#[derive(Debug)]
pub struct ThreadContext {
    /// The guest thread this context shadows
    pub thread_id: u16,
    /// Number of observable opcodes executed so far on this thread
    pub instruction_counter: u64,
    /// Number of frames entered so far on this thread
    pub frame_counter: u64,
    /// Counter threshold arming the stepping callback; `0` disables it
    pub callback_at: u64,
}

impl ThreadContext {
    /// Fresh context for `thread_id` with the callback armed at
    /// `callback_at` (`0` = disarmed).
    pub fn new(thread_id: u16, callback_at: u64) -> Self {
        Self { thread_id, instruction_counter: 0, frame_counter: 0, callback_at }
    }

    /// Whether the stepping callback should fire after the current opcode.
    pub fn callback_due(&self) -> bool {
        self.callback_at > 0 && self.instruction_counter >= self.callback_at
    }
}

/// Read-only view of a [`ThreadContext`] handed to the stepping callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSnapshot {
    /// The observed thread
    pub thread_id: u16,
    /// Counter of the opcode that triggered the callback
    pub instruction_counter: u64,
    /// Frames entered so far on this thread
    pub frame_counter: u64,
    /// Depth of the live frame stack
    pub frame_depth: usize,
}

/// Externally-scripted stepping callback.
///
/// Invoked in the recorder's context while the guest is paused. The returned
/// value is the next threshold: `Some(n)` re-arms the callback at counter
/// `n`, `None` disarms it. An `Err` aborts the session and closes the log
/// cleanly.
pub type StepCallback = Box<dyn FnMut(&ThreadSnapshot) -> eyre::Result<Option<u64>> + Send>;

/// Shared cancellation flag checked at every opcode boundary.
///
/// Setting the flag makes the evaluator emit a final `aborted` event and
/// unwind out of the guest.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Create an unset handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
