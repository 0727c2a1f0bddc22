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

//! Error types of the recording and replay halves.
//!
//! Recorder errors are fatal to the session but never to the guest process;
//! replayer errors are always caller-visible. Guest exceptions are not errors
//! at all: they are recorded as faulting events and surface as data.

use odb_common::types::Tok;

/// Fatal recording-side failures. Any of these aborts the session.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// A trace invariant was violated; the trace file is marked truncated.
    #[error("trace invariant {invariant} violated at counter {counter}: {detail}")]
    TraceCorruption {
        /// Which invariant tripped (I1-I5)
        invariant: &'static str,
        /// Per-thread counter of the offending opcode
        counter: u64,
        /// Human-readable description of the violation
        detail: String,
    },

    /// Writing the trace failed; buffered events are dropped.
    #[error("trace write failed: {0}")]
    Io(#[from] std::io::Error),

    /// Cooperative cancellation was requested.
    #[error("recording cancelled")]
    Cancelled,

    /// The stepping callback failed.
    #[error("stepping callback failed: {0}")]
    Callback(String),

    /// The process forked and the configured policy refuses to record in the
    /// child.
    #[error("refusing to record in forked child (parent pid {parent_pid})")]
    ForkedChild {
        /// Pid that owned the trace file when recording began
        parent_pid: u32,
    },

    /// A second recorder was attached to the same guest VM.
    #[error("a recorder is already installed for VM {0}")]
    AlreadyInstalled(u64),
}

/// Caller-visible replay and query failures.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// The query referenced a counter, token or frame outside the trace.
    #[error("not in trace: {0}")]
    Missing(String),

    /// The trace file is malformed.
    #[error("corrupt trace at offset {offset}: {detail}")]
    Corrupt {
        /// Byte offset the reader stopped at
        offset: u64,
        /// What was wrong
        detail: String,
    },

    /// Reading the trace or a source file failed.
    #[error("trace read failed: {0}")]
    Io(#[from] std::io::Error),

    /// The session id is unknown or already closed.
    #[error("no open session {0}")]
    UnknownSession(u64),
}

impl ReplayError {
    /// Convenience constructor for a missing-token error.
    pub fn missing_tok(tok: Tok) -> Self {
        Self::Missing(format!("token {tok} has no event in this trace"))
    }

    /// Convenience constructor for a missing-counter error.
    pub fn missing_counter(counter: u64) -> Self {
        Self::Missing(format!("counter {counter} is beyond the recorded range"))
    }
}
