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

//! Structured records returned by the query service.
//!
//! These are the response types of the seven query operations the outer shell
//! consumes. All of them serialize with serde so the (out-of-scope) line
//! protocol can forward them verbatim.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::opcode::Opcode;
use crate::types::{ExternalCall, Tok};

/// Provenance classification of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokKind {
    /// Ordinary computed value
    Value,
    /// Constant loaded from a code object's constant table; has no history
    Const,
    /// Produced by an opaque call; a terminal provenance root
    External,
    /// An exception object
    Exception,
}

/// One local binding as seen at a given counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalView {
    /// Variable name
    pub name: String,
    /// Token currently bound to the name
    pub tok: Tok,
    /// Concrete rendering of the bound value, when recorded
    pub repr: Option<String>,
}

/// One node of a provenance back-walk DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceNode {
    /// The token this node describes
    pub tok: Tok,
    /// Opcode of the event that minted the token
    pub opcode: Opcode,
    /// Code object of the minting event
    pub code_id: u32,
    /// Source line of the minting event, when the line map covers it
    pub line: Option<u32>,
    /// Provenance classification
    pub kind: TokKind,
    /// Parent tokens; empty for roots
    pub parents: Vec<Tok>,
    /// Opaque-callee identity for [`TokKind::External`] roots
    pub ext: Option<ExternalCall>,
}

impl ProvenanceNode {
    /// Whether this node terminates a provenance chain.
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }
}

/// Result of a provenance back-walk: the visited sub-DAG in BFS order,
/// starting at the queried token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceChain {
    /// The token the walk started from
    pub from: Tok,
    /// Visited nodes in breadth-first order
    pub nodes: Vec<ProvenanceNode>,
    /// True when the walk stopped at `max_depth` rather than at roots
    pub truncated: bool,
}

impl ProvenanceChain {
    /// Convert the chain to a `serde_json::Value` for line-protocol
    /// serialization.
    pub fn to_json_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Nodes that terminate the chain.
    pub fn roots(&self) -> impl Iterator<Item = &ProvenanceNode> {
        self.nodes.iter().filter(|n| n.is_root())
    }
}

/// One hit of a variable search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableHit {
    /// Counter of the write that established the binding
    pub counter: u64,
    /// Frame holding the binding
    pub frame_ord: u64,
    /// Variable name
    pub name: String,
    /// Bound token
    pub tok: Tok,
}

/// A window of guest source lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSnippet {
    /// Source file the snippet was read from
    pub path: PathBuf,
    /// 1-based line number of the first line in `lines`
    pub start_line: u32,
    /// The snippet lines, without trailing newlines
    pub lines: Vec<String>,
}
