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

//! Frame and code-object metadata shared by recorder and replayer.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One guest call frame as reconstructed from the trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    /// Monotonic per-trace frame ordinal
    pub frame_ord: u64,
    /// Code object executing in this frame
    pub code_id: u32,
    /// Ordinal of the calling frame; `None` for a thread's root frame
    pub parent_frame_ord: Option<u64>,
    /// Counter of the first opcode executed in this frame
    pub entry_counter: u64,
    /// Counter of the frame's return; `None` while the frame is live
    pub exit_counter: Option<u64>,
}

impl FrameInfo {
    /// Whether the frame was still live at the end of the recorded range.
    pub fn is_live(&self) -> bool {
        self.exit_counter.is_none()
    }
}

/// Immutable metadata of one guest code object.
///
/// This is the recorder's view of a code object: enough to resolve
/// instruction offsets to source lines, local name ids to names, and constant
/// indices to display strings. The host keeps the actual constant values and
/// instruction stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeInfo {
    /// Unique id of the code object within the trace
    pub code_id: u32,
    /// Function or module name, for diagnostics
    pub name: String,
    /// Path of the source file this code was compiled from
    pub source_path: PathBuf,
    /// Sorted `(instr_offset, source_line)` pairs; an offset maps to the line
    /// of the last pair at or before it
    pub line_map: Vec<(u32, u32)>,
    /// Local variable names, indexed by `name_id`
    pub local_names: Vec<String>,
    /// Display strings of the constant table, indexed by constant index
    pub const_reprs: Vec<String>,
}

impl CodeInfo {
    /// Resolve an instruction offset to its source line.
    pub fn line_for_offset(&self, offset: u32) -> Option<u32> {
        let idx = self.line_map.partition_point(|(off, _)| *off <= offset);
        idx.checked_sub(1).map(|i| self.line_map[i].1)
    }

    /// Resolve a local `name_id` to its name.
    pub fn local_name(&self, name_id: u32) -> Option<&str> {
        self.local_names.get(name_id as usize).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code() -> CodeInfo {
        CodeInfo {
            code_id: 7,
            name: "main".into(),
            source_path: "guest.dyn".into(),
            line_map: vec![(0, 1), (3, 2), (8, 5)],
            local_names: vec!["a".into(), "b".into()],
            const_reprs: vec!["30".into()],
        }
    }

    #[test]
    fn test_line_for_offset() {
        let c = code();
        assert_eq!(c.line_for_offset(0), Some(1));
        assert_eq!(c.line_for_offset(2), Some(1));
        assert_eq!(c.line_for_offset(3), Some(2));
        assert_eq!(c.line_for_offset(100), Some(5));
    }

    #[test]
    fn test_local_name_lookup() {
        let c = code();
        assert_eq!(c.local_name(1), Some("b"));
        assert_eq!(c.local_name(2), None);
    }
}
