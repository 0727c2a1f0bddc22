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

//! Guest source snippet lookup.
//!
//! Code-table entries carry the path each code object was compiled from;
//! this module turns a `(path, line, context)` request into a window of
//! source lines for display next to query results.

use std::fs;
use std::path::Path;

use odb_common::types::SourceSnippet;

use crate::error::ReplayError;

/// Read a window of `2 * context + 1` lines centered on 1-based `line`.
///
/// The window is clamped to the file; asking for a line past the end is a
/// caller-visible [`ReplayError::Missing`].
pub fn read_snippet(path: &Path, line: u32, context: u32) -> Result<SourceSnippet, ReplayError> {
    if line == 0 {
        return Err(ReplayError::Missing("source lines are 1-based".to_string()));
    }
    let text = fs::read_to_string(path)?;
    let all: Vec<&str> = text.lines().collect();
    if line as usize > all.len() {
        return Err(ReplayError::Missing(format!(
            "line {} is past the end of {} ({} lines)",
            line,
            path.display(),
            all.len()
        )));
    }

    let start = line.saturating_sub(context).max(1);
    let end = (line + context).min(all.len() as u32);
    let lines =
        all[(start - 1) as usize..end as usize].iter().map(|s| s.to_string()).collect();

    Ok(SourceSnippet { path: path.to_path_buf(), start_line: start, lines })
}
