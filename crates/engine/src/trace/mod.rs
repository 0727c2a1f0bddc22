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

//! The trace store: append-only event log on disk and its reader.
//!
//! [`TraceWriter`] buffers events per thread and flushes framed, checksummed
//! segments; [`TraceReader`] loads a finished trace back and reconstructs
//! frames, locals and provenance. The [`EventSink`] trait is the seam between
//! the instrumented evaluator and the writer, which also lets tests capture
//! event streams in memory.

pub mod format;
pub use format::*;

pub mod reader;
pub use reader::*;

pub mod writer;
pub use writer::*;

use odb_common::types::{CodeInfo, TraceEvent};

use crate::error::RecordError;

/// Destination of recorded events.
///
/// The trace writer is the production implementation; [`MemorySink`] backs
/// tests that assert on raw event streams.
pub trait EventSink {
    /// A code object became known; it must appear in the trace's code table.
    fn register_code(&mut self, code: &CodeInfo) -> Result<(), RecordError>;

    /// Append one event. Events are immutable once appended.
    fn append(&mut self, event: &TraceEvent) -> Result<(), RecordError>;

    /// A frame on `thread_id` closed; buffered events should reach disk.
    fn frame_closed(&mut self, thread_id: u16) -> Result<(), RecordError>;

    /// Mark the trace incomplete (invariant violation or abort).
    fn set_truncated(&mut self);
}

/// In-memory sink collecting events for assertions.
#[derive(Debug, Default)]
pub struct MemorySink {
    /// Registered code objects, in registration order
    pub codes: Vec<CodeInfo>,
    /// Appended events, in append order
    pub events: Vec<TraceEvent>,
    /// Whether the recorder marked the stream truncated
    pub truncated: bool,
    /// Number of frame-close flushes observed
    pub frame_flushes: usize,
}

impl EventSink for MemorySink {
    fn register_code(&mut self, code: &CodeInfo) -> Result<(), RecordError> {
        self.codes.push(code.clone());
        Ok(())
    }

    fn append(&mut self, event: &TraceEvent) -> Result<(), RecordError> {
        self.events.push(event.clone());
        Ok(())
    }

    fn frame_closed(&mut self, _thread_id: u16) -> Result<(), RecordError> {
        self.frame_flushes += 1;
        Ok(())
    }

    fn set_truncated(&mut self) {
        self.truncated = true;
    }
}
