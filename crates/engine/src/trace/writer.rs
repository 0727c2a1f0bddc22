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

//! Append-only trace writer.
//!
//! Single producer per file. Events are buffered per thread and flushed as
//! framed segments on three occasions: end of frame, buffer reaching the
//! flush threshold, and session close. The writer takes an advisory lock on
//! the file (a sibling `.lock` sentinel holding the owner pid) and stamps the
//! owning process id so a fork cannot silently continue appending through an
//! inherited handle: depending on the configured [`ForkPolicy`], a forked
//! child either refuses to record or rotates onto its own per-process file.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use odb_common::types::{CodeInfo, TraceEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::RecordError;
use crate::trace::format::{
    self, IndexEntry, SegmentHeader, TraceHeader, FLAG_CONTINUATION, FLAG_TRUNCATED, HEADER_LEN,
    INDEX_STRIDE, SEGMENT_HEADER_LEN, VERSION,
};
use crate::trace::EventSink;

/// What the writer does when it finds itself in a forked child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ForkPolicy {
    /// Refuse to record in the child; its session aborts with reason
    /// `forked-child` while the parent's trace stays valid.
    #[default]
    Refuse,
    /// Close the inherited handle and open a fresh per-process trace file
    /// (`<stem>-<pid>.rtrc`).
    NewFile,
    /// Open a per-process continuation segment file (`<stem>.seg-<pid>`)
    /// flagged as continuing the parent's trace.
    NewSegment,
}

#[derive(Debug, Default)]
struct ThreadLane {
    buf: Vec<u8>,
    start_counter: u64,
    events_buffered: u64,
    events_total: u64,
    // (key, offset of the event within `buf`), resolved to absolute file
    // offsets at flush time
    pending_index: Vec<(u64, usize)>,
}

/// Append-only writer for one trace file.
#[derive(Debug)]
pub struct TraceWriter {
    path: PathBuf,
    lock_path: PathBuf,
    file: File,
    file_len: u64,
    owner_pid: u32,
    fork_policy: ForkPolicy,
    flush_threshold: usize,
    codes: Vec<CodeInfo>,
    code_ids: HashSet<u32>,
    lanes: HashMap<u16, ThreadLane>,
    index: Vec<IndexEntry>,
    created_ns: u64,
    truncated: bool,
    continuation: bool,
    finished: bool,
}

impl TraceWriter {
    /// Default flush threshold: 64 KiB per thread buffer.
    pub const DEFAULT_FLUSH_THRESHOLD: usize = 64 * 1024;

    /// Create a new trace file at `path`, taking its advisory lock.
    pub fn create(
        path: impl Into<PathBuf>,
        fork_policy: ForkPolicy,
        flush_threshold: usize,
    ) -> Result<Self, RecordError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_path = lock_path_for(&path);
        take_lock(&lock_path)?;

        let mut file = match OpenOptions::new().write(true).create(true).truncate(true).open(&path)
        {
            Ok(file) => file,
            Err(e) => {
                let _ = fs::remove_file(&lock_path);
                return Err(e.into());
            }
        };

        let created_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();

        // Placeholder header; offsets and flags are patched on close
        let header = TraceHeader {
            version: VERSION,
            flags: 0,
            thread_count: 0,
            created_ns,
            code_table_offset: 0,
            index_offset: 0,
        };
        header.write_to(&mut file)?;

        info!(path = %path.display(), "trace file opened");

        Ok(Self {
            path,
            lock_path,
            file,
            file_len: HEADER_LEN,
            owner_pid: std::process::id(),
            fork_policy,
            flush_threshold,
            codes: Vec::new(),
            code_ids: HashSet::new(),
            lanes: HashMap::new(),
            index: Vec::new(),
            created_ns,
            truncated: false,
            continuation: false,
            finished: false,
        })
    }

    /// The file this writer appends to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Detect a fork and apply the configured policy.
    fn check_fork(&mut self) -> Result<(), RecordError> {
        let pid = std::process::id();
        if pid == self.owner_pid {
            return Ok(());
        }
        match self.fork_policy {
            ForkPolicy::Refuse => {
                warn!(
                    parent_pid = self.owner_pid,
                    child_pid = pid,
                    "fork detected; refusing to record in the child"
                );
                Err(RecordError::ForkedChild { parent_pid: self.owner_pid })
            }
            ForkPolicy::NewFile | ForkPolicy::NewSegment => self.rotate_for_child(pid),
        }
    }

    /// Re-home the writer onto a per-process file after a fork.
    ///
    /// Events buffered before the fork are the parent's to flush; the child
    /// drops its inherited copies and starts clean.
    fn rotate_for_child(&mut self, pid: u32) -> Result<(), RecordError> {
        let new_path = match self.fork_policy {
            ForkPolicy::NewFile => {
                let stem = self.path.file_stem().unwrap_or_default().to_string_lossy();
                self.path.with_file_name(format!("{stem}-{pid}.rtrc"))
            }
            ForkPolicy::NewSegment => {
                let name = self.path.file_name().unwrap_or_default().to_string_lossy();
                self.path.with_file_name(format!("{name}.seg-{pid}"))
            }
            ForkPolicy::Refuse => unreachable!("rotate is never taken under Refuse"),
        };
        warn!(
            parent_pid = self.owner_pid,
            child_pid = pid,
            new_path = %new_path.display(),
            "fork detected; rotating onto a per-process trace file"
        );

        let lock_path = lock_path_for(&new_path);
        take_lock(&lock_path)?;
        let mut file =
            OpenOptions::new().write(true).create(true).truncate(true).open(&new_path)?;
        let header = TraceHeader {
            version: VERSION,
            flags: 0,
            thread_count: 0,
            created_ns: self.created_ns,
            code_table_offset: 0,
            index_offset: 0,
        };
        header.write_to(&mut file)?;

        // The inherited handle and lock belong to the parent; forget them
        // without touching the parent's lock file.
        self.path = new_path;
        self.lock_path = lock_path;
        self.file = file;
        self.file_len = HEADER_LEN;
        self.owner_pid = pid;
        self.lanes.clear();
        self.index.clear();
        self.continuation = self.fork_policy == ForkPolicy::NewSegment;
        Ok(())
    }

    fn flush_lane(&mut self, thread_id: u16) -> Result<(), RecordError> {
        let Some(lane) = self.lanes.get_mut(&thread_id) else {
            return Ok(());
        };
        if lane.buf.is_empty() {
            return Ok(());
        }

        let seg_header = SegmentHeader {
            thread_id,
            seg_len: lane.buf.len() as u64,
            start_counter: lane.start_counter,
        };
        self.file.seek(SeekFrom::Start(self.file_len))?;
        seg_header.write_to(&mut self.file)?;
        self.file.write_all(&lane.buf)?;

        let payload_base = self.file_len + SEGMENT_HEADER_LEN;
        for (key, rel) in lane.pending_index.drain(..) {
            self.index.push(IndexEntry { key, offset: payload_base + rel as u64 });
        }

        self.file_len = payload_base + lane.buf.len() as u64;
        debug!(thread_id, seg_len = lane.buf.len(), "flushed trace segment");

        lane.events_total += lane.events_buffered;
        lane.events_buffered = 0;
        lane.buf.clear();
        Ok(())
    }

    fn flush_all(&mut self) -> Result<(), RecordError> {
        let threads: Vec<u16> = self.lanes.keys().copied().collect();
        for thread_id in threads {
            self.flush_lane(thread_id)?;
        }
        Ok(())
    }

    /// Flush everything, write the code table and index tail, patch the
    /// header, release the lock and close the file.
    pub fn finish(mut self) -> Result<PathBuf, RecordError> {
        self.flush_all()?;

        let code_table_offset = self.file_len;
        let mut tail = Vec::new();
        format::encode_code_table(&self.codes, &mut tail);
        let index_offset = code_table_offset + tail.len() as u64;
        format::encode_index(&self.index, &mut tail);

        self.file.seek(SeekFrom::Start(self.file_len))?;
        self.file.write_all(&tail)?;
        self.file_len += tail.len() as u64;

        let mut flags = 0u16;
        if self.truncated {
            flags |= FLAG_TRUNCATED;
        }
        if self.continuation {
            flags |= FLAG_CONTINUATION;
        }
        let header = TraceHeader {
            version: VERSION,
            flags,
            thread_count: self.lanes.len() as u16,
            created_ns: self.created_ns,
            code_table_offset,
            index_offset,
        };
        self.file.seek(SeekFrom::Start(0))?;
        header.write_to(&mut self.file)?;
        self.file.sync_all()?;

        let _ = fs::remove_file(&self.lock_path);
        self.finished = true;

        info!(
            path = %self.path.display(),
            bytes = self.file_len,
            truncated = self.truncated,
            "trace file closed"
        );
        Ok(self.path.clone())
    }
}

impl EventSink for TraceWriter {
    fn register_code(&mut self, code: &CodeInfo) -> Result<(), RecordError> {
        if self.code_ids.insert(code.code_id) {
            self.codes.push(code.clone());
        }
        Ok(())
    }

    fn append(&mut self, event: &TraceEvent) -> Result<(), RecordError> {
        self.check_fork()?;

        let thread_id = event.thread_id();
        let lane = self.lanes.entry(thread_id).or_default();
        if lane.buf.is_empty() {
            lane.start_counter = event.counter();
        }
        if (lane.events_total + lane.events_buffered) % INDEX_STRIDE == 0 {
            let key = (thread_id as u64) << 48 | event.counter();
            lane.pending_index.push((key, lane.buf.len()));
        }
        format::encode_event(event, &mut lane.buf);
        lane.events_buffered += 1;

        if lane.buf.len() >= self.flush_threshold {
            self.flush_lane(thread_id)?;
        }
        Ok(())
    }

    fn frame_closed(&mut self, thread_id: u16) -> Result<(), RecordError> {
        self.flush_lane(thread_id)
    }

    fn set_truncated(&mut self) {
        self.truncated = true;
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        if !self.finished {
            // Dropped without finish(): the trace is incomplete. Leave the
            // data for post-mortem reads but release the lock.
            warn!(path = %self.path.display(), "trace writer dropped before finish");
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    path.with_file_name(format!("{name}.lock"))
}

/// Take the advisory lock, failing if another writer holds it.
fn take_lock(lock_path: &Path) -> Result<(), RecordError> {
    match OpenOptions::new().write(true).create_new(true).open(lock_path) {
        Ok(mut lock) => {
            let _ = write!(lock, "{}", std::process::id());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(RecordError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("trace is locked by another writer: {}", lock_path.display()),
            )))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odb_common::logging;
    use odb_common::opcode::Opcode;
    use odb_common::types::InstructionEvent;
    use smallvec::smallvec;

    fn event(counter: u64) -> TraceEvent {
        TraceEvent::Instr(InstructionEvent {
            counter,
            frame_ord: 0,
            thread_id: 0,
            opcode: Opcode::Nop,
            arg: 0,
            code_id: 0,
            instr_offset: counter as u32,
            consumed: smallvec![],
            produced: smallvec![],
            reads: smallvec![],
            writes: smallvec![],
            fault: false,
            ext: None,
        })
    }

    #[test]
    fn test_lock_excludes_second_writer() {
        logging::ensure_test_logging(None);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.rtrc");

        let writer = TraceWriter::create(&path, ForkPolicy::Refuse, 1024).unwrap();
        let second = TraceWriter::create(&path, ForkPolicy::Refuse, 1024);
        assert!(matches!(second, Err(RecordError::Io(_))));

        writer.finish().unwrap();
        // lock released; a new writer may take over
        let third = TraceWriter::create(&path, ForkPolicy::Refuse, 1024).unwrap();
        third.finish().unwrap();
    }

    #[test]
    fn test_small_threshold_produces_multiple_segments() {
        logging::ensure_test_logging(None);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.rtrc");

        let mut writer = TraceWriter::create(&path, ForkPolicy::Refuse, 32).unwrap();
        for counter in 1..=20 {
            writer.append(&event(counter)).unwrap();
        }
        let path = writer.finish().unwrap();

        let data = fs::read(path).unwrap();
        let header = TraceHeader::read_from(&data).unwrap();
        assert!(header.code_table_offset > HEADER_LEN);
        assert_eq!(header.thread_count, 1);

        // More than one segment header in the event region
        let mut pos = HEADER_LEN as usize;
        let mut segments = 0;
        while (pos as u64) < header.code_table_offset {
            let seg = SegmentHeader::read_from(&data, &mut pos).unwrap();
            pos += seg.seg_len as usize;
            segments += 1;
        }
        assert!(segments > 1, "expected multiple segments, got {segments}");
    }

    #[test]
    fn test_fork_refuse_policy_rejects_child_appends() {
        logging::ensure_test_logging(None);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.rtrc");

        let mut writer = TraceWriter::create(&path, ForkPolicy::Refuse, 1 << 20).unwrap();
        writer.append(&event(1)).unwrap();
        // Simulate waking up in a forked child
        let parent_pid = writer.owner_pid;
        writer.owner_pid = parent_pid.wrapping_add(1);
        assert!(matches!(
            writer.append(&event(2)),
            Err(RecordError::ForkedChild { parent_pid: p }) if p == parent_pid.wrapping_add(1)
        ));
    }

    #[test]
    fn test_fork_new_file_policy_rotates() {
        logging::ensure_test_logging(None);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.rtrc");

        let mut writer = TraceWriter::create(&path, ForkPolicy::NewFile, 1 << 20).unwrap();
        writer.append(&event(1)).unwrap();
        writer.owner_pid = writer.owner_pid.wrapping_add(1);
        writer.append(&event(2)).unwrap();

        let new_path = writer.path().to_path_buf();
        assert_ne!(new_path, path);
        assert!(new_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .contains(&std::process::id().to_string()));

        let finished = writer.finish().unwrap();
        assert_eq!(finished, new_path);

        // The child's file holds only post-fork events; pre-fork buffers
        // belong to the parent
        let data = fs::read(&finished).unwrap();
        let header = TraceHeader::read_from(&data).unwrap();
        assert_eq!(header.flags & FLAG_CONTINUATION, 0);
        let mut pos = HEADER_LEN as usize;
        let seg = SegmentHeader::read_from(&data, &mut pos).unwrap();
        assert_eq!(seg.start_counter, 2);
    }

    #[test]
    fn test_fork_new_segment_policy_flags_continuation() {
        logging::ensure_test_logging(None);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.rtrc");

        let mut writer = TraceWriter::create(&path, ForkPolicy::NewSegment, 1 << 20).unwrap();
        writer.append(&event(1)).unwrap();
        writer.owner_pid = writer.owner_pid.wrapping_add(1);
        writer.append(&event(2)).unwrap();

        assert!(writer
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("t.rtrc.seg-"));

        let finished = writer.finish().unwrap();
        let data = fs::read(&finished).unwrap();
        let header = TraceHeader::read_from(&data).unwrap();
        assert_ne!(header.flags & FLAG_CONTINUATION, 0);
    }

    #[test]
    fn test_index_points_at_first_event() {
        logging::ensure_test_logging(None);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.rtrc");

        let mut writer = TraceWriter::create(&path, ForkPolicy::Refuse, 1 << 20).unwrap();
        for counter in 1..=5 {
            writer.append(&event(counter)).unwrap();
        }
        let path = writer.finish().unwrap();

        let data = fs::read(path).unwrap();
        let header = TraceHeader::read_from(&data).unwrap();
        let mut pos = header.index_offset as usize;
        let index = format::decode_index(&data, &mut pos).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].key, 1);

        // The recorded offset points at a decodable event with counter 1
        let mut event_pos = index[0].offset as usize;
        let decoded = format::decode_event(&data, &mut event_pos).unwrap().unwrap();
        assert_eq!(decoded.counter(), 1);
    }
}
