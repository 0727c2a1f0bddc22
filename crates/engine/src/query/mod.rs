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

//! Session-keyed query façade over the replay engine.
//!
//! The outer shell consumes exactly the operations exposed here: open and
//! close traces, step a session cursor, list frames, inspect locals, walk
//! provenance chains, search variables and fetch source snippets. All
//! operations are synchronous and read-only; any number of sessions may
//! share one underlying trace through reference-counted readers.

pub mod service;
pub use service::*;
