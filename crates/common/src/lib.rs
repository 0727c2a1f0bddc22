// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
// SPDX-License-Identifier: AGPL-3.0
//! ODB Common - Shared functionality for ODB components
//!
//! This crate provides the shared vocabulary used by both the recorder and
//! the replay engine: origin tokens, instruction events, guest code objects,
//! the guest opcode table, plus ambient utilities (logging setup, environment
//! variable names, gated assertion macros).

pub mod env;
pub mod hook;
pub mod logging;
pub mod macros;
pub mod opcode;
pub mod test_utils;
pub mod types;

pub use hook::*;
pub use opcode::*;
pub use types::*;
