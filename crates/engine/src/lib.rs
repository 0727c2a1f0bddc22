// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
// SPDX-License-Identifier: AGPL-3.0
//! ODB Engine - recording, replay and provenance queries
//!
//! The engine has three tightly-coupled halves: the instrumented evaluator
//! ([`recorder`]) which shadows a live guest interpreter and emits one event
//! per executed opcode, the append-only trace store ([`trace`]) holding those
//! events on disk, and the session-keyed [`query`] service answering
//! structured questions about a finished trace.

pub mod core;
pub use core::*;

pub mod error;
pub use error::*;

pub mod recorder;
pub use recorder::*;

pub mod query;
pub use query::*;

pub mod source;
pub use source::*;

pub mod trace;
pub use trace::*;
