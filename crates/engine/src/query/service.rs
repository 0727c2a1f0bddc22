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

//! The query service and its session registry.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use odb_common::types::{
    FrameInfo, LocalView, ProvenanceChain, SourceSnippet, Tok, VariableHit,
};
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::ReplayError;
use crate::source;
use crate::trace::reader::{TraceReader, DEFAULT_BACK_WALK_DEPTH};

/// One open query session: a shared reader plus a private cursor.
#[derive(Debug)]
pub struct QuerySession {
    reader: Arc<TraceReader>,
    cursor: RwLock<u64>,
}

impl QuerySession {
    /// The session's current instruction-counter cursor.
    pub fn cursor(&self) -> u64 {
        *self.cursor.read()
    }

    /// The trace this session reads.
    pub fn reader(&self) -> &Arc<TraceReader> {
        &self.reader
    }
}

/// Session registry answering the structured queries of the outer shell.
///
/// Sessions are identified by plain numeric handles. Opening the same trace
/// file twice shares one [`TraceReader`] through a weak cache, so concurrent
/// sessions pay the parse cost once.
#[derive(Debug, Default)]
pub struct QueryService {
    sessions: DashMap<u64, Arc<QuerySession>>,
    readers: DashMap<PathBuf, Weak<TraceReader>>,
    next_id: AtomicU64,
}

impl QueryService {
    /// Create an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self, session_id: u64) -> Result<Arc<QuerySession>, ReplayError> {
        self.sessions
            .get(&session_id)
            .map(|entry| entry.value().clone())
            .ok_or(ReplayError::UnknownSession(session_id))
    }

    fn shared_reader(&self, path: &Path) -> Result<Arc<TraceReader>, ReplayError> {
        let key = path.to_path_buf();
        if let Some(cached) = self.readers.get(&key).and_then(|weak| weak.upgrade()) {
            return Ok(cached);
        }
        let reader = Arc::new(TraceReader::open(path)?);
        self.readers.insert(key, Arc::downgrade(&reader));
        Ok(reader)
    }

    /// Open a trace file, returning a fresh session id.
    pub fn open_trace(&self, path: impl AsRef<Path>) -> Result<u64, ReplayError> {
        let reader = self.shared_reader(path.as_ref())?;
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions
            .insert(session_id, Arc::new(QuerySession { reader, cursor: RwLock::new(0) }));
        info!(session_id, path = %path.as_ref().display(), "trace opened");
        Ok(session_id)
    }

    /// Close a session, releasing its reader reference.
    pub fn close_trace(&self, session_id: u64) -> Result<(), ReplayError> {
        self.sessions
            .remove(&session_id)
            .map(|_| info!(session_id, "session closed"))
            .ok_or(ReplayError::UnknownSession(session_id))
    }

    /// Move the session cursor to `counter`, validating it is within the
    /// recorded range.
    pub fn run_to_instruction(&self, session_id: u64, counter: u64) -> Result<(), ReplayError> {
        let session = self.session(session_id)?;
        // seek() both validates the counter and proves the state is
        // reconstructible at it
        let state = session.reader.seek(counter)?;
        *session.cursor.write() = counter;
        debug!(session_id, counter, depth = state.depth(), "cursor moved");
        Ok(())
    }

    /// Live frames at `counter`, innermost first.
    pub fn list_frames_at_step(
        &self,
        session_id: u64,
        counter: u64,
    ) -> Result<Vec<FrameInfo>, ReplayError> {
        let session = self.session(session_id)?;
        session.reader.frames_at(counter)
    }

    /// Locals of `frame_ord` as of `counter`, with concrete renderings where
    /// the trace recorded them.
    pub fn inspect_stack(
        &self,
        session_id: u64,
        frame_ord: u64,
        counter: u64,
    ) -> Result<Vec<LocalView>, ReplayError> {
        let session = self.session(session_id)?;
        session.reader.locals_at(frame_ord, counter)
    }

    /// Walk provenance backwards from `tok`, at most `max_depth` edges deep
    /// (default 32).
    pub fn trace_provenance(
        &self,
        session_id: u64,
        tok: Tok,
        max_depth: Option<usize>,
    ) -> Result<ProvenanceChain, ReplayError> {
        let session = self.session(session_id)?;
        session.reader.back_walk(tok, max_depth.unwrap_or(DEFAULT_BACK_WALK_DEPTH))
    }

    /// Search bindings live at the session cursor whose name contains
    /// `name_pattern`.
    pub fn search_variables(
        &self,
        session_id: u64,
        name_pattern: &str,
    ) -> Result<Vec<VariableHit>, ReplayError> {
        let session = self.session(session_id)?;
        let cursor = session.cursor();
        if cursor == 0 {
            return Ok(Vec::new());
        }
        session.reader.search_variables(name_pattern, cursor)
    }

    /// A window of guest source around `line` of `code_id`.
    pub fn get_source(
        &self,
        session_id: u64,
        code_id: u32,
        line: u32,
        context: u32,
    ) -> Result<SourceSnippet, ReplayError> {
        let session = self.session(session_id)?;
        let code = session
            .reader
            .code(code_id)
            .ok_or_else(|| ReplayError::Missing(format!("no code object {code_id}")))?;
        source::read_snippet(&code.source_path, line, context)
    }

    /// Number of currently open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
