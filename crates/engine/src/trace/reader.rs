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

//! Replay engine: reads a finished trace and answers provenance questions.
//!
//! The reader streams the whole file once at open, validates every record's
//! checksum, groups events per thread in counter order, and keeps them in
//! memory. Replay never re-executes the guest: frame stacks and locals at any
//! counter are reconstructed purely by scanning the event stream, and
//! provenance chains are walked backwards over parent edges.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use odb_common::opcode::{Opcode, OpcodeTr};
use odb_common::types::{
    AbortEvent, CodeInfo, FrameInfo, InstructionEvent, LocalView, ProvenanceChain, ProvenanceNode,
    Tok, TokKind, TraceEvent, VariableHit,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ReplayError;
use crate::trace::format::{
    self, IndexEntry, SegmentHeader, TraceHeader, FLAG_TRUNCATED, HEADER_LEN,
};

/// Default depth limit of [`TraceReader::back_walk`].
pub const DEFAULT_BACK_WALK_DEPTH: usize = 32;

#[derive(Debug, Default)]
struct ThreadTrace {
    events: Vec<InstructionEvent>,
}

impl ThreadTrace {
    /// Binary search by counter; events are kept strictly increasing.
    fn event_at(&self, counter: u64) -> Option<&InstructionEvent> {
        self.events
            .binary_search_by_key(&counter, |e| e.counter)
            .ok()
            .map(|idx| &self.events[idx])
    }

    fn max_counter(&self) -> u64 {
        self.events.last().map(|e| e.counter).unwrap_or(0)
    }
}

/// Reader over one finished trace file.
#[derive(Debug)]
pub struct TraceReader {
    path: PathBuf,
    header: TraceHeader,
    codes: HashMap<u32, CodeInfo>,
    threads: BTreeMap<u16, ThreadTrace>,
    index: Vec<IndexEntry>,
    aborts: Vec<AbortEvent>,
    summary: OnceCell<TraceSummary>,
}

impl TraceReader {
    /// Open and fully validate a trace file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let path = path.as_ref().to_path_buf();
        let data = fs::read(&path)?;
        let header = TraceHeader::read_from(&data)?;
        if header.code_table_offset == 0 || header.index_offset == 0 {
            return Err(ReplayError::Corrupt {
                offset: 0,
                detail: "trace was never finalized (missing code table or index)".to_string(),
            });
        }

        // Event region: concatenated per-thread segments
        let mut threads: BTreeMap<u16, ThreadTrace> = BTreeMap::new();
        let mut aborts = Vec::new();
        let mut pos = HEADER_LEN as usize;
        let seg_region_end = header.code_table_offset as usize;
        while pos < seg_region_end {
            let seg = SegmentHeader::read_from(&data, &mut pos)?;
            let seg_end = pos + seg.seg_len as usize;
            if seg_end > seg_region_end {
                return Err(ReplayError::Corrupt {
                    offset: pos as u64,
                    detail: "segment runs past the event region".to_string(),
                });
            }
            while pos < seg_end {
                match format::decode_event(&data, &mut pos)? {
                    Some(TraceEvent::Instr(event)) => {
                        threads.entry(event.thread_id).or_default().events.push(event);
                    }
                    Some(TraceEvent::Abort(event)) => aborts.push(event),
                    None => {} // unknown record kind from a newer writer
                }
            }
            if pos != seg_end {
                return Err(ReplayError::Corrupt {
                    offset: pos as u64,
                    detail: "event record crosses a segment boundary".to_string(),
                });
            }
        }

        // Counters must strictly increase by one per thread
        for (thread_id, thread) in &threads {
            for pair in thread.events.windows(2) {
                if pair[1].counter != pair[0].counter + 1 {
                    return Err(ReplayError::Corrupt {
                        offset: header.code_table_offset,
                        detail: format!(
                            "thread {} counter jumps from {} to {}",
                            thread_id, pair[0].counter, pair[1].counter
                        ),
                    });
                }
            }
        }

        let mut pos = header.code_table_offset as usize;
        let code_list = format::decode_code_table(&data, &mut pos)?;
        let codes = code_list.into_iter().map(|c| (c.code_id, c)).collect();

        let mut pos = header.index_offset as usize;
        let index = format::decode_index(&data, &mut pos)?;

        debug!(
            path = %path.display(),
            threads = threads.len(),
            events = threads.values().map(|t| t.events.len()).sum::<usize>(),
            "trace opened"
        );

        Ok(Self { path, header, codes, threads, index, aborts, summary: OnceCell::new() })
    }

    /// The file this reader was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The parsed file header.
    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    /// Whether the recording session aborted before the guest finished.
    pub fn is_truncated(&self) -> bool {
        self.header.flags & FLAG_TRUNCATED != 0
    }

    /// Abort records, if the session stopped early.
    pub fn aborts(&self) -> &[AbortEvent] {
        &self.aborts
    }

    /// The sparse counter index written at close.
    pub fn index(&self) -> &[IndexEntry] {
        &self.index
    }

    /// Code-table entry for `code_id`.
    pub fn code(&self, code_id: u32) -> Option<&CodeInfo> {
        self.codes.get(&code_id)
    }

    /// All code-table entries.
    pub fn codes(&self) -> impl Iterator<Item = &CodeInfo> {
        self.codes.values()
    }

    /// The lowest thread id with events; bare-counter queries resolve
    /// against it.
    pub fn main_thread(&self) -> Option<u16> {
        self.threads.keys().next().copied()
    }

    /// Highest counter recorded for `thread_id`.
    pub fn max_counter(&self, thread_id: u16) -> u64 {
        self.threads.get(&thread_id).map(ThreadTrace::max_counter).unwrap_or(0)
    }

    /// The event at `(thread_id, counter)`.
    pub fn event_at(&self, thread_id: u16, counter: u64) -> Option<&InstructionEvent> {
        self.threads.get(&thread_id)?.event_at(counter)
    }

    /// The event that minted `tok`.
    pub fn event_for_tok(&self, tok: Tok) -> Option<&InstructionEvent> {
        self.event_at(tok.thread_id(), tok.counter())
    }

    /// Provenance classification of `tok`.
    pub fn kind_of(&self, tok: Tok) -> Result<TokKind, ReplayError> {
        let event = self.event_for_tok(tok).ok_or_else(|| ReplayError::missing_tok(tok))?;
        Ok(classify(event))
    }

    /// Parent tokens of `tok`.
    ///
    /// Tokens minted by opaque calls are terminal roots: their event keeps
    /// the argument tokens in `consumed`, but the provenance chain ends at
    /// the call boundary, so this returns an empty list for them.
    pub fn parents_of(&self, tok: Tok) -> Result<Vec<Tok>, ReplayError> {
        let event = self.event_for_tok(tok).ok_or_else(|| ReplayError::missing_tok(tok))?;
        Ok(parents_of_event(event))
    }

    /// Breadth-first walk over parent edges, halting at roots or
    /// `max_depth`.
    pub fn back_walk(&self, tok: Tok, max_depth: usize) -> Result<ProvenanceChain, ReplayError> {
        // The starting token must exist; unreachable parents inside the walk
        // are tolerated as roots
        let _ = self.event_for_tok(tok).ok_or_else(|| ReplayError::missing_tok(tok))?;

        let mut nodes = Vec::new();
        let mut visited: HashSet<Tok> = HashSet::new();
        let mut queue: VecDeque<(Tok, usize)> = VecDeque::new();
        let mut truncated = false;

        visited.insert(tok);
        queue.push_back((tok, 0));

        while let Some((current, depth)) = queue.pop_front() {
            let Some(event) = self.event_for_tok(current) else {
                continue;
            };
            let parents = parents_of_event(event);
            let line = self
                .codes
                .get(&event.code_id)
                .and_then(|code| code.line_for_offset(event.instr_offset));
            nodes.push(ProvenanceNode {
                tok: current,
                opcode: event.opcode,
                code_id: event.code_id,
                line,
                kind: classify(event),
                parents: parents.clone(),
                ext: event.ext.clone(),
            });

            if depth == max_depth {
                if !parents.is_empty() {
                    truncated = true;
                }
                continue;
            }
            for parent in parents {
                if visited.insert(parent) {
                    queue.push_back((parent, depth + 1));
                }
            }
        }

        Ok(ProvenanceChain { from: tok, nodes, truncated })
    }

    /// Reconstruct the replay state of the main thread after `counter`
    /// opcodes.
    pub fn seek(&self, counter: u64) -> Result<ReplayState, ReplayError> {
        let thread_id = self
            .main_thread()
            .ok_or_else(|| ReplayError::Missing("trace has no events".to_string()))?;
        self.seek_thread(thread_id, counter)
    }

    /// Reconstruct the replay state of `thread_id` after `counter` opcodes.
    pub fn seek_thread(&self, thread_id: u16, counter: u64) -> Result<ReplayState, ReplayError> {
        let thread = self
            .threads
            .get(&thread_id)
            .ok_or_else(|| ReplayError::Missing(format!("no events for thread {thread_id}")))?;
        if counter > thread.max_counter() {
            return Err(ReplayError::missing_counter(counter));
        }
        ReplayState::rebuild(thread_id, counter, &thread.events)
    }

    /// Live frames at `counter` on the main thread, innermost first.
    pub fn frames_at(&self, counter: u64) -> Result<Vec<FrameInfo>, ReplayError> {
        Ok(self.seek(counter)?.live_frames())
    }

    /// Locals of `frame_ord` as of `counter`, resolved to names.
    pub fn locals_at(&self, frame_ord: u64, counter: u64) -> Result<Vec<LocalView>, ReplayError> {
        let state = self.seek(counter)?;
        let frame = state
            .frame(frame_ord)
            .ok_or_else(|| ReplayError::Missing(format!("no frame {frame_ord} at {counter}")))?;
        let code = self.codes.get(&frame.code_id);

        let mut locals: Vec<LocalView> = state
            .locals_raw(frame_ord)
            .map(|slots| {
                slots
                    .iter()
                    .map(|(name_id, slot)| LocalView {
                        name: code
                            .and_then(|c| c.local_name(*name_id))
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("#{name_id}")),
                        tok: slot.tok,
                        repr: slot.repr.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        locals.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(locals)
    }

    /// Bindings live at `counter` whose name contains `pattern`.
    ///
    /// Only bindings of frames still on the stack are searched; bindings of
    /// frames that already returned are gone at that point.
    pub fn search_variables(
        &self,
        pattern: &str,
        counter: u64,
    ) -> Result<Vec<VariableHit>, ReplayError> {
        let state = self.seek(counter)?;
        let mut hits = Vec::new();
        for frame in state.live_frames() {
            let code = self.codes.get(&frame.code_id);
            let Some(slots) = state.locals_raw(frame.frame_ord) else {
                continue;
            };
            for (name_id, slot) in slots {
                let name = code
                    .and_then(|c| c.local_name(*name_id))
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("#{name_id}"));
                if name.contains(pattern) {
                    hits.push(VariableHit {
                        counter: slot.written_at,
                        frame_ord: frame.frame_ord,
                        name,
                        tok: slot.tok,
                    });
                }
            }
        }
        hits.sort_by(|a, b| (a.frame_ord, &a.name).cmp(&(b.frame_ord, &b.name)));
        Ok(hits)
    }

    /// Aggregate statistics over the whole trace, computed once and cached.
    pub fn summary(&self) -> &TraceSummary {
        self.summary.get_or_init(|| {
            let mut per_thread = Vec::new();
            for (thread_id, thread) in &self.threads {
                let mut frames: HashSet<u64> = HashSet::new();
                let mut calls = 0usize;
                let mut faults = 0usize;
                let mut external_calls = 0usize;
                for event in &thread.events {
                    frames.insert(event.frame_ord);
                    if event.opcode.is_call() {
                        calls += 1;
                    }
                    if event.fault {
                        faults += 1;
                    }
                    if event.ext.is_some() {
                        external_calls += 1;
                    }
                }
                per_thread.push(ThreadSummary {
                    thread_id: *thread_id,
                    events: thread.events.len(),
                    frames: frames.len(),
                    calls,
                    faults,
                    external_calls,
                });
            }
            TraceSummary {
                truncated: self.is_truncated(),
                code_objects: self.codes.len(),
                threads: per_thread,
            }
        })
    }
}

/// Per-thread aggregate of [`TraceSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    /// The summarized thread
    pub thread_id: u16,
    /// Number of recorded opcodes
    pub events: usize,
    /// Number of distinct frames
    pub frames: usize,
    /// Number of call opcodes
    pub calls: usize,
    /// Number of faulting opcodes
    pub faults: usize,
    /// Number of opaque calls
    pub external_calls: usize,
}

/// Whole-trace statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSummary {
    /// Whether the session aborted early
    pub truncated: bool,
    /// Number of code-table entries
    pub code_objects: usize,
    /// Per-thread aggregates
    pub threads: Vec<ThreadSummary>,
}

/// One reconstructed local binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSlot {
    /// Token the name is bound to
    pub tok: Tok,
    /// Recorded rendering of the bound value
    pub repr: Option<String>,
    /// Counter of the write that established the binding
    pub written_at: u64,
}

#[derive(Debug)]
struct FrameRebuild {
    info: FrameInfo,
    locals: HashMap<u32, LocalSlot>,
    last_counter: u64,
}

/// The reconstructed state of one thread after a given number of opcodes.
#[derive(Debug)]
pub struct ReplayState {
    /// The reconstructed thread
    pub thread_id: u16,
    /// The counter this state corresponds to
    pub counter: u64,
    stack: Vec<u64>,
    frames: HashMap<u64, FrameRebuild>,
}

impl ReplayState {
    /// Scan `events` up to and including `counter`, rebuilding the frame
    /// stack and every frame's locals.
    fn rebuild(
        thread_id: u16,
        counter: u64,
        events: &[InstructionEvent],
    ) -> Result<Self, ReplayError> {
        let mut state =
            Self { thread_id, counter, stack: Vec::new(), frames: HashMap::new() };

        for event in events.iter().take_while(|e| e.counter <= counter) {
            state.apply(event)?;
        }
        Ok(state)
    }

    fn apply(&mut self, event: &InstructionEvent) -> Result<(), ReplayError> {
        let ord = event.frame_ord;
        if let std::collections::hash_map::Entry::Vacant(entry) = self.frames.entry(ord) {
            // First event of a new frame: its parent is whatever was on top
            entry.insert(FrameRebuild {
                info: FrameInfo {
                    frame_ord: ord,
                    code_id: event.code_id,
                    parent_frame_ord: self.stack.last().copied(),
                    entry_counter: event.counter,
                    exit_counter: None,
                },
                locals: HashMap::new(),
                last_counter: event.counter,
            });
            self.stack.push(ord);
        } else if self.stack.last() != Some(&ord) {
            // Control resurfaced in an ancestor: everything above it exited
            while let Some(&top) = self.stack.last() {
                if top == ord {
                    break;
                }
                self.stack.pop();
                if let Some(popped) = self.frames.get_mut(&top) {
                    popped.info.exit_counter = Some(popped.last_counter);
                }
            }
            if self.stack.last() != Some(&ord) {
                return Err(ReplayError::Corrupt {
                    offset: 0,
                    detail: format!(
                        "frame {ord} re-entered at counter {} after exiting",
                        event.counter
                    ),
                });
            }
        }

        let frame = self.frames.get_mut(&ord).expect("frame inserted above");
        frame.last_counter = event.counter;

        // Only local bindings land in the frame's locals; global writes are
        // visible through their own events
        if matches!(event.opcode, Opcode::StoreLocal | Opcode::BindExcept) {
            for write in &event.writes {
                frame.locals.insert(
                    write.name_id,
                    LocalSlot {
                        tok: write.tok,
                        repr: write.repr.clone(),
                        written_at: event.counter,
                    },
                );
            }
        }

        if event.opcode == Opcode::Return {
            frame.info.exit_counter = Some(event.counter);
            self.stack.pop();
        }
        Ok(())
    }

    /// Frames still live at this counter, innermost first.
    pub fn live_frames(&self) -> Vec<FrameInfo> {
        self.stack
            .iter()
            .rev()
            .filter_map(|ord| self.frames.get(ord).map(|f| f.info.clone()))
            .collect()
    }

    /// Any frame (live or exited) by ordinal.
    pub fn frame(&self, frame_ord: u64) -> Option<&FrameInfo> {
        self.frames.get(&frame_ord).map(|f| &f.info)
    }

    /// Raw local slots of a frame.
    pub fn locals_raw(&self, frame_ord: u64) -> Option<&HashMap<u32, LocalSlot>> {
        self.frames.get(&frame_ord).map(|f| &f.locals)
    }

    /// Depth of the live frame stack.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }
}

fn classify(event: &InstructionEvent) -> TokKind {
    if event.ext.is_some() {
        TokKind::External
    } else if event.fault {
        TokKind::Exception
    } else if event.opcode == Opcode::LoadConst {
        TokKind::Const
    } else {
        TokKind::Value
    }
}

fn parents_of_event(event: &InstructionEvent) -> Vec<Tok> {
    if event.ext.is_some() {
        // Opaque call boundary: terminal root
        return Vec::new();
    }
    let linked: Vec<Tok> = match event.opcode {
        Opcode::LoadConst | Opcode::LoadLocal | Opcode::LoadGlobal => {
            event.reads.iter().map(|b| b.tok).collect()
        }
        _ => event.consumed.to_vec(),
    };
    let mut seen = HashSet::new();
    linked.into_iter().filter(|tok| !tok.is_none() && seen.insert(*tok)).collect()
}
