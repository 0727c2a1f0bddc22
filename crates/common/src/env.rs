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

//! Environment variable name constants for ODB configuration.
//!
//! This module provides constant string names for all environment variables used
//! by ODB. These constants ensure consistency across the codebase and provide a
//! single source of truth for environment variable names.
//!
//! # Environment Variables
//!
//! ## Runtime Configuration
//! - [`TRACE_DIR`] - Default output directory for trace files
//! - [`DEBUG_TRACE`] - Enable diagnostic stderr lines from the evaluator
//! - [`RECORDER_CALLBACK_AT`] - Initial stepping-callback threshold
//! - [`ODB_ASSERT`] - Controls selective runtime assertion macros

/// Environment variable for the default trace output directory.
///
/// When a [`RecorderConfig`] does not name an explicit trace directory, the
/// recorder resolves this variable; if it is unset, traces land in
/// `odb-traces` under the system temporary directory.
///
/// # Examples
///
/// ```bash
/// TRACE_DIR=/var/lib/odb cargo run
/// ```
///
/// [`RecorderConfig`]: https://docs.rs/odb-engine
pub const TRACE_DIR: &str = "TRACE_DIR";

/// Environment variable enabling diagnostic stderr lines from the evaluator.
///
/// When set to a non-empty value other than `0`, the instrumented evaluator
/// raises its per-opcode diagnostics from `trace` to `debug` level, so a
/// plain `RUST_LOG=debug` run shows every counted opcode, its consumed and
/// produced tokens, and callback firings.
///
/// This is a recording-side switch only; replay is unaffected.
pub const DEBUG_TRACE: &str = "DEBUG_TRACE";

/// Environment variable for the initial stepping-callback threshold.
///
/// Must parse as a `u64`. `0` disables the callback entirely; any positive
/// value `n` arms the recorder callback to fire once the per-thread
/// instruction counter reaches `n`. Defaults to `1` (fire on the first
/// instruction) when unset or unparsable.
///
/// # Examples
///
/// ```bash
/// # Fire the stepping callback at instruction 5000
/// RECORDER_CALLBACK_AT=5000 cargo run
/// ```
pub const RECORDER_CALLBACK_AT: &str = "RECORDER_CALLBACK_AT";

/// Environment variable for controlling selective runtime assertions.
///
/// This variable enables fine-grained control over which assertion macros are
/// active at runtime, similar to how `RUST_LOG` controls logging. See
/// [`crate::macros`] for the assertion macros that use this variable.
///
/// # Syntax
///
/// - `ODB_ASSERT=*` or `ODB_ASSERT=all` - Enable all assertions
/// - unset or empty - All assertions are **disabled**
pub const ODB_ASSERT: &str = "ODB_ASSERT";
