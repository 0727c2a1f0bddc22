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

//! The instrumented evaluator: the recorder's [`RecordHook`] implementation.
//!
//! For every dispatched opcode it (a) increments the per-thread counter,
//! (b) looks up consumed/produced arity in the [`OpcodeHandler`] table,
//! (c) snapshots the consumed tokens off the shadow stack before the host
//! advances, (d) lets the host perform the semantic step, and (e) applies the
//! token rule, pushes produced tokens and appends the event. Guest
//! exceptions, opaque calls and frame transitions are folded into the same
//! flow via [`StepOutcome`].
//!
//! Invariant violations (I1-I5) never panic: they are logged with the name
//! of the failing invariant and the offending counter, the trace is marked
//! truncated, and the session aborts.

use std::collections::HashMap;

use eyre::Result;
use odb_common::env::DEBUG_TRACE;
use odb_common::hook::{RecordHook, StepContext, StepOutcome};
use odb_common::opcode::Opcode;
use odb_common::types::{
    AbortEvent, AbortReason, Binding, CodeInfo, InstructionEvent, Tok, TraceEvent,
};
use smallvec::{smallvec, SmallVec};
use tracing::{debug, error, trace};

use crate::error::RecordError;
use crate::recorder::context::{StepCallback, ThreadContext, ThreadSnapshot};
use crate::recorder::handler::{OpcodeHandler, TokenRule};
use crate::recorder::shadow::{FrameShadow, ShadowPool};
use crate::recorder::CancelHandle;
use crate::trace::EventSink;

#[derive(Debug)]
struct PendingStep {
    counter: u64,
    in_arity: usize,
    consumed: SmallVec<[Tok; 2]>,
}

#[derive(Debug)]
struct PendingCall {
    code_id: u32,
    arg_toks: SmallVec<[Tok; 2]>,
}

#[derive(Debug)]
struct ThreadState {
    ctx: ThreadContext,
    frames: Vec<FrameShadow>,
    pending: Option<PendingStep>,
    pending_call: Option<PendingCall>,
    pending_exc: Option<Tok>,
}

impl ThreadState {
    fn new(thread_id: u16, callback_at: u64) -> Self {
        Self {
            ctx: ThreadContext::new(thread_id, callback_at),
            frames: Vec::new(),
            pending: None,
            pending_call: None,
            pending_exc: None,
        }
    }
}

/// Instrumented evaluator shadowing one guest VM.
///
/// Generic over the [`EventSink`] so tests can capture event streams in
/// memory while production records through a [`TraceWriter`].
///
/// [`TraceWriter`]: crate::trace::TraceWriter
pub struct InstrumentedEvaluator<S: EventSink> {
    sink: S,
    handler: OpcodeHandler,
    threads: HashMap<u16, ThreadState>,
    pool: ShadowPool,
    globals: HashMap<String, Tok>,
    const_toks: HashMap<(u32, u32), Tok>,
    callback: Option<StepCallback>,
    initial_callback_at: u64,
    cancel: CancelHandle,
    debug_trace: bool,
    aborted: Option<AbortReason>,
}

impl<S: EventSink> InstrumentedEvaluator<S> {
    /// Wrap `sink` with the callback armed at `callback_at` (`0` disarms).
    pub fn new(sink: S, callback_at: u64) -> Self {
        let debug_trace =
            std::env::var(DEBUG_TRACE).map(|v| !v.is_empty() && v != "0").unwrap_or(false);
        Self {
            sink,
            handler: OpcodeHandler,
            threads: HashMap::new(),
            pool: ShadowPool::default(),
            globals: HashMap::new(),
            const_toks: HashMap::new(),
            callback: None,
            initial_callback_at: callback_at,
            cancel: CancelHandle::new(),
            debug_trace,
            aborted: None,
        }
    }

    /// Install the stepping callback (see [`StepCallback`]).
    pub fn set_callback(&mut self, callback: StepCallback) {
        self.callback = Some(callback);
    }

    /// Handle for cancelling this session from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Why the session aborted, if it did.
    pub fn aborted(&self) -> Option<AbortReason> {
        self.aborted
    }

    /// Read access to the sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Tear the evaluator apart, returning the sink for closing.
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Fatal invariant violation: log which invariant tripped, mark the
    /// trace truncated, emit the abort record, and fail the session.
    fn corruption(
        &mut self,
        thread_id: u16,
        counter: u64,
        invariant: &'static str,
        detail: String,
    ) -> eyre::Report {
        error!(invariant, counter, thread_id, %detail, "trace invariant violated");
        self.sink.set_truncated();
        let _ = self.sink.append(&TraceEvent::Abort(AbortEvent {
            counter,
            thread_id,
            reason: AbortReason::TraceCorruption,
        }));
        let _ = self.sink.frame_closed(thread_id);
        self.aborted = Some(AbortReason::TraceCorruption);
        RecordError::TraceCorruption { invariant, counter, detail }.into()
    }

    /// Abort the session for a non-corruption reason, emitting the final
    /// `aborted` event best-effort.
    fn abort(&mut self, thread_id: u16, counter: u64, reason: AbortReason) {
        self.sink.set_truncated();
        let _ = self.sink.append(&TraceEvent::Abort(AbortEvent { counter, thread_id, reason }));
        let _ = self.sink.frame_closed(thread_id);
        self.aborted = Some(reason);
    }

    fn fire_callback(&mut self, state: &mut ThreadState) -> Result<(), RecordError> {
        if self.callback.is_none() || !state.ctx.callback_due() {
            return Ok(());
        }
        let snapshot = ThreadSnapshot {
            thread_id: state.ctx.thread_id,
            instruction_counter: state.ctx.instruction_counter,
            frame_counter: state.ctx.frame_counter,
            frame_depth: state.frames.len(),
        };
        debug!(
            counter = snapshot.instruction_counter,
            "stepping callback firing; guest paused"
        );
        let callback = self.callback.as_mut().expect("checked above");
        match callback(&snapshot) {
            Ok(Some(next)) => {
                state.ctx.callback_at = next;
                Ok(())
            }
            Ok(None) => {
                state.ctx.callback_at = 0;
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                self.abort(
                    state.ctx.thread_id,
                    state.ctx.instruction_counter,
                    AbortReason::CallbackFailed,
                );
                Err(RecordError::Callback(message))
            }
        }
    }

    fn frame_enter_inner(
        &mut self,
        state: &mut ThreadState,
        thread_id: u16,
        code_id: u32,
    ) -> Result<()> {
        state.ctx.frame_counter += 1;
        let frame_ord = state.ctx.frame_counter;

        let mut shadow = self.pool.acquire(frame_ord, code_id);
        if let Some(call) = state.pending_call.take() {
            if call.code_id != code_id {
                let counter = state.ctx.instruction_counter;
                return Err(self.corruption(
                    thread_id,
                    counter,
                    "I5",
                    format!(
                        "frame entered for code {} but the pending call targets {}",
                        code_id, call.code_id
                    ),
                ));
            }
            // Arguments become the callee's first locals, keeping their toks
            for (i, tok) in call.arg_toks.iter().enumerate() {
                shadow.bind_local(i as u32, *tok);
            }
        }
        state.frames.push(shadow);
        Ok(())
    }

    fn step_inner(&mut self, state: &mut ThreadState, ctx: &StepContext<'_>) -> Result<()> {
        let thread_id = ctx.thread_id;

        if self.cancel.is_cancelled() {
            let counter = state.ctx.instruction_counter;
            self.abort(thread_id, counter, AbortReason::Cancelled);
            return Err(RecordError::Cancelled.into());
        }

        state.ctx.instruction_counter += 1;
        let counter = state.ctx.instruction_counter;

        let Some(shadow) = state.frames.last() else {
            return Err(self.corruption(
                thread_id,
                counter,
                "I5",
                format!("opcode {} dispatched outside any frame", ctx.opcode),
            ));
        };

        if shadow.depth() != ctx.stack_depth {
            return Err(self.corruption(
                thread_id,
                counter,
                "I2",
                format!(
                    "shadow depth {} != value-stack depth {} before {}",
                    shadow.depth(),
                    ctx.stack_depth,
                    ctx.opcode
                ),
            ));
        }

        let in_arity = self.handler.in_arity(ctx.opcode, ctx.arg);
        let Some(consumed) = shadow.peek(in_arity) else {
            return Err(self.corruption(
                thread_id,
                counter,
                "I2",
                format!(
                    "{} needs {} operands but the shadow stack holds {}",
                    ctx.opcode,
                    in_arity,
                    shadow.depth()
                ),
            ));
        };
        let consumed = SmallVec::from_slice(consumed);

        state.pending = Some(PendingStep { counter, in_arity, consumed });
        Ok(())
    }

    fn step_end_inner(
        &mut self,
        state: &mut ThreadState,
        ctx: &StepContext<'_>,
        outcome: &StepOutcome,
    ) -> Result<()> {
        let thread_id = ctx.thread_id;
        let Some(pending) = state.pending.take() else {
            let counter = state.ctx.instruction_counter;
            return Err(self.corruption(
                thread_id,
                counter,
                "I1",
                format!("step_end for {} without a matching step", ctx.opcode),
            ));
        };
        let PendingStep { counter, in_arity, consumed } = pending;
        let own = Tok::new(thread_id, counter);
        let frame_ord = match state.frames.last() {
            Some(shadow) => shadow.frame_ord,
            None => {
                return Err(self.corruption(
                    thread_id,
                    counter,
                    "I5",
                    "step_end with no live frame".to_string(),
                ))
            }
        };

        let mut produced: SmallVec<[Tok; 1]> = smallvec![];
        let mut reads: SmallVec<[Binding; 1]> = smallvec![];
        let mut writes: SmallVec<[Binding; 1]> = smallvec![];
        let mut ext = None;
        let mut fault = false;
        let mut frame_returned = false;

        if let StepOutcome::Fault { message } = outcome {
            // Consumed operands are gone; nothing was pushed. The exception
            // object itself carries this event's token, so its parents are
            // exactly the operands of the faulting opcode.
            let shadow = state.frames.last_mut().expect("frame checked above");
            if shadow.pop_n(in_arity).is_none() {
                return Err(self.corruption(
                    thread_id,
                    counter,
                    "I2",
                    "shadow underflow while recording a fault".to_string(),
                ));
            }
            fault = true;
            state.pending_exc = Some(own);
            trace!(counter, opcode = %ctx.opcode, %message, "guest fault recorded");
        } else {
            let rule = self.handler.token_rule(ctx.opcode);
            let shadow = state.frames.last_mut().expect("frame checked above");
            match rule {
                TokenRule::Shuffle => {
                    let ok = match ctx.opcode {
                        Opcode::Dup => shadow.dup(ctx.arg as usize).map(|copies| {
                            produced = SmallVec::from_slice(&copies);
                        }),
                        Opcode::Swap => shadow.swap(),
                        Opcode::Rot => shadow.rot(ctx.arg as usize),
                        _ => unreachable!("shuffle rule only covers copy opcodes"),
                    };
                    if ok.is_none() {
                        return Err(self.corruption(
                            thread_id,
                            counter,
                            "I2",
                            format!("shadow underflow in {}", ctx.opcode),
                        ));
                    }
                }
                TokenRule::Mint => {
                    shadow.pop_n(in_arity);
                    shadow.push(own);
                    produced = smallvec![own];
                }
                TokenRule::MintConst => {
                    let key = (ctx.code.code_id, ctx.arg);
                    match self.const_toks.get(&key) {
                        Some(&first) => reads.push(Binding::new(ctx.arg, first)),
                        None => {
                            self.const_toks.insert(key, own);
                        }
                    }
                    shadow.push(own);
                    produced = smallvec![own];
                }
                TokenRule::MintLinked => {
                    let prev = match ctx.opcode {
                        Opcode::LoadLocal => shadow.local(ctx.arg),
                        Opcode::LoadGlobal => ctx
                            .code
                            .local_name(ctx.arg)
                            .and_then(|name| self.globals.get(name).copied()),
                        _ => unreachable!("linked rule only covers load opcodes"),
                    };
                    reads.push(Binding::new(ctx.arg, prev.unwrap_or(Tok::NONE)));
                    shadow.push(own);
                    produced = smallvec![own];
                }
                TokenRule::Rebind => {
                    shadow.pop_n(in_arity);
                    let stored = match outcome {
                        StepOutcome::Completed { stored } => stored.clone(),
                        _ => None,
                    };
                    writes.push(Binding { name_id: ctx.arg, tok: own, repr: stored });
                    match ctx.opcode {
                        Opcode::StoreLocal => shadow.bind_local(ctx.arg, own),
                        Opcode::StoreGlobal => {
                            if let Some(name) = ctx.code.local_name(ctx.arg) {
                                self.globals.insert(name.to_string(), own);
                            }
                        }
                        _ => unreachable!("rebind rule only covers store opcodes"),
                    }
                }
                TokenRule::RebindExisting => {
                    let Some(popped) = shadow.pop_n(in_arity) else {
                        return Err(self.corruption(
                            thread_id,
                            counter,
                            "I2",
                            "shadow underflow in BIND_EXCEPT".to_string(),
                        ));
                    };
                    let bound = popped.first().copied().unwrap_or(Tok::NONE);
                    let stored = match outcome {
                        StepOutcome::Completed { stored } => stored.clone(),
                        _ => None,
                    };
                    writes.push(Binding { name_id: ctx.arg, tok: bound, repr: stored });
                    shadow.bind_local(ctx.arg, bound);
                    state.pending_exc = None;
                }
                TokenRule::Spread => {
                    shadow.pop_n(in_arity);
                    for _ in 0..ctx.arg {
                        shadow.push(own);
                        produced.push(own);
                    }
                }
                TokenRule::Discard => {
                    shadow.pop_n(in_arity);
                }
                TokenRule::Call => match outcome {
                    StepOutcome::EnterFrame { code_id } => {
                        shadow.pop_n(in_arity);
                        let arg_toks = SmallVec::from_slice(&consumed[1..]);
                        state.pending_call = Some(PendingCall { code_id: *code_id, arg_toks });
                    }
                    StepOutcome::External { call, pushed: _ } => {
                        shadow.pop_n(in_arity);
                        shadow.push(own);
                        produced = smallvec![own];
                        ext = Some(call.clone());
                    }
                    _ => {
                        return Err(self.corruption(
                            thread_id,
                            counter,
                            "I5",
                            "CALL completed without a call outcome".to_string(),
                        ))
                    }
                },
                TokenRule::Return => {
                    let Some(popped) = shadow.pop_n(in_arity) else {
                        return Err(self.corruption(
                            thread_id,
                            counter,
                            "I2",
                            "shadow underflow in RETURN".to_string(),
                        ));
                    };
                    let ret = popped.first().copied().unwrap_or(Tok::NONE);
                    frame_returned = true;
                    // The return value's token crosses into the caller once
                    // the event below is recorded
                    state.pending_exc = None;
                    let finished = state.frames.pop().expect("frame checked above");
                    self.pool.release(finished);
                    if let Some(parent) = state.frames.last_mut() {
                        parent.push(ret);
                    }
                }
                TokenRule::Raise => {
                    // Raise always reports a Fault outcome; a completed Raise
                    // means the host skipped the unwind
                    shadow.pop_n(in_arity);
                }
                TokenRule::Unwind => {
                    let Some(_) = shadow.pop_n(in_arity) else {
                        return Err(self.corruption(
                            thread_id,
                            counter,
                            "I2",
                            "shadow underflow in UNWIND".to_string(),
                        ));
                    };
                    let exc = state.pending_exc.take().unwrap_or(own);
                    shadow.push(exc);
                    produced = smallvec![exc];
                }
            }
        }

        if !frame_returned {
            if let Some(shadow) = state.frames.last() {
                odb_common::odb_assert_eq!(
                    shadow.depth(),
                    ctx.stack_depth - in_arity + produced.len(),
                    "shadow stack drifted at counter {counter}"
                );
            }
        }

        let event = InstructionEvent {
            counter,
            frame_ord,
            thread_id,
            opcode: ctx.opcode,
            arg: ctx.arg,
            code_id: ctx.code.code_id,
            instr_offset: ctx.instr_offset,
            consumed,
            produced,
            reads,
            writes,
            fault,
            ext,
        };

        if self.debug_trace {
            debug!(
                counter,
                frame_ord,
                opcode = %event.opcode,
                consumed = ?event.consumed,
                produced = ?event.produced,
                fault = event.fault,
                "opcode recorded"
            );
        }

        if let Err(e) = self.sink.append(&event.into()) {
            match &e {
                RecordError::ForkedChild { .. } => {
                    self.abort(thread_id, counter, AbortReason::ForkedChild)
                }
                _ => self.aborted = Some(AbortReason::TraceCorruption),
            }
            return Err(e.into());
        }
        if frame_returned {
            self.sink.frame_closed(thread_id)?;
        }

        self.fire_callback(state)?;
        Ok(())
    }
}

impl<S: EventSink> RecordHook for InstrumentedEvaluator<S> {
    fn code_loaded(&mut self, code: &CodeInfo) -> Result<()> {
        self.sink.register_code(code)?;
        Ok(())
    }

    fn frame_enter(&mut self, thread_id: u16, code_id: u32) -> Result<()> {
        let callback_at = self.initial_callback_at;
        let mut state = self
            .threads
            .remove(&thread_id)
            .unwrap_or_else(|| ThreadState::new(thread_id, callback_at));
        let result = self.frame_enter_inner(&mut state, thread_id, code_id);
        self.threads.insert(thread_id, state);
        result
    }

    fn step(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        if let Some(reason) = self.aborted {
            eyre::bail!("recording session already aborted: {}", reason.as_str());
        }
        let callback_at = self.initial_callback_at;
        let mut state = self
            .threads
            .remove(&ctx.thread_id)
            .unwrap_or_else(|| ThreadState::new(ctx.thread_id, callback_at));
        let result = self.step_inner(&mut state, ctx);
        self.threads.insert(ctx.thread_id, state);
        result
    }

    fn step_end(&mut self, ctx: &StepContext<'_>, outcome: &StepOutcome) -> Result<()> {
        if let Some(reason) = self.aborted {
            eyre::bail!("recording session already aborted: {}", reason.as_str());
        }
        let Some(mut state) = self.threads.remove(&ctx.thread_id) else {
            eyre::bail!("step_end on unknown thread {}", ctx.thread_id);
        };
        let result = self.step_end_inner(&mut state, ctx, outcome);
        self.threads.insert(ctx.thread_id, state);
        result
    }

    fn frame_unwound(&mut self, thread_id: u16) -> Result<()> {
        let Some(mut state) = self.threads.remove(&thread_id) else {
            eyre::bail!("frame_unwound on unknown thread {thread_id}");
        };
        let result: Result<()> = (|| {
            let Some(discarded) = state.frames.pop() else {
                let counter = state.ctx.instruction_counter;
                return Err(self.corruption(
                    thread_id,
                    counter,
                    "I5",
                    "frame_unwound with no live frame".to_string(),
                ));
            };
            self.pool.release(discarded);
            self.sink.frame_closed(thread_id)?;
            Ok(())
        })();
        self.threads.insert(thread_id, state);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::MemorySink;
    use odb_common::logging;
    use odb_common::opcode::BinaryKind;
    use odb_common::test_utils::{CodeBuilder, MiniVm, Program};
    use odb_common::types::GuestValue;

    fn run_into_memory(program: Program) -> MemorySink {
        let mut evaluator = InstrumentedEvaluator::new(MemorySink::default(), 0);
        let mut vm = MiniVm::new(program);
        vm.run(&mut evaluator).unwrap();
        evaluator.into_sink()
    }

    #[test]
    fn test_events_mirror_the_opcode_stream() {
        logging::ensure_test_logging(None);
        let mut main = CodeBuilder::new("main", "mem.dyn");
        let c2 = main.constant(GuestValue::Int(2));
        let c3 = main.constant(GuestValue::Int(3));
        main.op(Opcode::LoadConst, c2)
            .op(Opcode::LoadConst, c3)
            .op(Opcode::BinaryOp, BinaryKind::Add as u32)
            .op(Opcode::Return, 0);

        let sink = run_into_memory(Program::new(vec![main.build(0)], 0));
        assert_eq!(sink.codes.len(), 1);
        assert_eq!(sink.events.len(), 4);
        assert!(!sink.truncated);
        // Return closed the root frame, flushing its lane
        assert_eq!(sink.frame_flushes, 1);

        let add = sink.events[2].as_instr().unwrap();
        assert_eq!(add.opcode, Opcode::BinaryOp);
        assert_eq!(add.consumed.as_slice(), &[Tok::new(0, 1), Tok::new(0, 2)]);
        assert_eq!(add.produced.as_slice(), &[Tok::new(0, 3)]);
    }

    #[test]
    fn test_cancellation_appends_abort_record() {
        logging::ensure_test_logging(None);
        let mut main = CodeBuilder::new("main", "mem.dyn");
        let c0 = main.constant(GuestValue::Int(0));
        main.op(Opcode::LoadConst, c0).op(Opcode::Return, 0);

        let mut evaluator = InstrumentedEvaluator::new(MemorySink::default(), 0);
        evaluator.cancel_handle().cancel();
        let mut vm = MiniVm::new(Program::new(vec![main.build(0)], 0));
        assert!(vm.run(&mut evaluator).is_err());
        assert_eq!(evaluator.aborted(), Some(AbortReason::Cancelled));

        let sink = evaluator.into_sink();
        assert!(sink.truncated);
        assert!(matches!(
            sink.events.last(),
            Some(TraceEvent::Abort(abort)) if abort.reason == AbortReason::Cancelled
        ));
    }

    #[test]
    fn test_step_end_without_step_is_corruption() {
        logging::ensure_test_logging(None);
        let mut evaluator = InstrumentedEvaluator::new(MemorySink::default(), 0);
        evaluator.frame_enter(0, 0).unwrap();

        let code = CodeBuilder::new("main", "mem.dyn").build(0);
        let ctx = StepContext {
            thread_id: 0,
            code: &code.info,
            instr_offset: 0,
            opcode: Opcode::Nop,
            arg: 0,
            stack_depth: 0,
        };
        let err = evaluator
            .step_end(&ctx, &StepOutcome::Completed { stored: None })
            .unwrap_err();
        assert!(err.to_string().contains("invariant I1"), "got: {err}");
        assert_eq!(evaluator.aborted(), Some(AbortReason::TraceCorruption));
        assert!(evaluator.sink().truncated);
    }

    #[test]
    fn test_stack_depth_mismatch_is_corruption() {
        logging::ensure_test_logging(None);
        let mut evaluator = InstrumentedEvaluator::new(MemorySink::default(), 0);
        evaluator.frame_enter(0, 0).unwrap();

        let code = CodeBuilder::new("main", "mem.dyn").build(0);
        let ctx = StepContext {
            thread_id: 0,
            code: &code.info,
            instr_offset: 0,
            opcode: Opcode::Pop,
            arg: 0,
            // The shadow stack is empty; claiming one live slot must trip I2
            stack_depth: 1,
        };
        let err = evaluator.step(&ctx).unwrap_err();
        assert!(err.to_string().contains("invariant I2"), "got: {err}");
    }
}
