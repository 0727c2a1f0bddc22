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

//! End-to-end recording scenarios: guest programs run under the bundled
//! evaluator with a full recording session attached, then the written trace
//! is read back and its provenance is checked.

use odb_common::logging;
use odb_common::opcode::{BinaryKind, Opcode};
use odb_common::test_utils::{CodeBuilder, MiniVm, Program, VmResult};
use odb_common::types::{AbortReason, GuestValue, Tok, TokKind};
use odb_engine::{Recorder, RecorderConfig, TraceReader};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

fn record(
    program: Program,
    builtins: &[(&str, odb_common::test_utils::BuiltinFn)],
    trace_name: &str,
) -> (VmResult, PathBuf) {
    let dir = std::env::temp_dir().join("odb-test-traces").join(format!(
        "{}-{}",
        trace_name,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    let recorder = Recorder::new(
        RecorderConfig::default().with_trace_dir(&dir).with_callback_at(0),
    );
    let mut session = recorder.start_session(1, trace_name).unwrap();
    let mut vm = MiniVm::new(program);
    for (name, f) in builtins {
        vm = vm.with_builtin(name, *f);
    }
    let result = vm.run(&mut session).unwrap();
    let path = session.finish().unwrap();
    (result, path)
}

/// a = 30; b = 0.01; c = a * b; return c
fn pipeline_program() -> Program {
    let mut main = CodeBuilder::new("main", "pipeline.dyn");
    let c30 = main.constant(GuestValue::Int(30));
    let c001 = main.constant(GuestValue::Float(0.01));
    let a = main.name("a");
    let b = main.name("b");
    let c = main.name("c");
    main.at_line(1)
        .op(Opcode::LoadConst, c30)
        .op(Opcode::StoreLocal, a)
        .at_line(2)
        .op(Opcode::LoadConst, c001)
        .op(Opcode::StoreLocal, b)
        .at_line(3)
        .op(Opcode::LoadLocal, a)
        .op(Opcode::LoadLocal, b)
        .op(Opcode::BinaryOp, BinaryKind::Mul as u32)
        .op(Opcode::StoreLocal, c)
        .at_line(4)
        .op(Opcode::LoadLocal, c)
        .op(Opcode::Return, 0);
    Program::new(vec![main.build(0)], 0)
}

#[test]
fn test_constant_propagation_chain() {
    logging::ensure_test_logging(None);
    info!("Running test");
    let (result, path) = record(pipeline_program(), &[], "const-prop");
    assert_eq!(result, VmResult::Completed(GuestValue::Float(0.3)));

    let reader = TraceReader::open(&path).unwrap();
    assert!(!reader.is_truncated());

    // Counters: 1 LoadConst 30, 2 Store a, 3 LoadConst 0.01, 4 Store b,
    // 5 Load a, 6 Load b, 7 Mul, 8 Store c, 9 Load c, 10 Return
    let mul = Tok::new(0, 7);
    assert_eq!(reader.parents_of(mul).unwrap(), vec![Tok::new(0, 5), Tok::new(0, 6)]);

    // load a -> store a -> const 30, which is a root
    assert_eq!(reader.parents_of(Tok::new(0, 5)).unwrap(), vec![Tok::new(0, 2)]);
    assert_eq!(reader.parents_of(Tok::new(0, 2)).unwrap(), vec![Tok::new(0, 1)]);
    assert_eq!(reader.parents_of(Tok::new(0, 1)).unwrap(), vec![]);
    assert_eq!(reader.kind_of(Tok::new(0, 1)).unwrap(), TokKind::Const);

    let chain = reader.back_walk(mul, 32).unwrap();
    assert!(!chain.truncated);
    let const_node = chain
        .nodes
        .iter()
        .find(|n| n.tok == Tok::new(0, 1))
        .expect("chain must terminate at the const 30 node");
    assert!(const_node.is_root());
    assert_eq!(const_node.kind, TokKind::Const);
    assert_eq!(const_node.line, Some(1));
}

#[test]
fn test_scaling_still_roots_at_the_constant() {
    logging::ensure_test_logging(None);
    info!("Running test");
    // Scenario: after c = 30 * 0.01, the derived 0.2295 must still trace
    // back to the literal 30
    let mut main = CodeBuilder::new("main", "pipeline.dyn");
    let c30 = main.constant(GuestValue::Int(30));
    let c001 = main.constant(GuestValue::Float(0.01));
    let c09 = main.constant(GuestValue::Float(0.9));
    let c085 = main.constant(GuestValue::Float(0.85));
    let c = main.name("c");
    let e = main.name("e");
    main.at_line(1)
        .op(Opcode::LoadConst, c30)
        .op(Opcode::LoadConst, c001)
        .op(Opcode::BinaryOp, BinaryKind::Mul as u32)
        .op(Opcode::StoreLocal, c)
        .at_line(2)
        .op(Opcode::LoadLocal, c)
        .op(Opcode::LoadConst, c09)
        .op(Opcode::BinaryOp, BinaryKind::Mul as u32)
        .op(Opcode::LoadConst, c085)
        .op(Opcode::BinaryOp, BinaryKind::Mul as u32)
        .op(Opcode::StoreLocal, e)
        .at_line(3)
        .op(Opcode::LoadLocal, e)
        .op(Opcode::Return, 0);
    let (result, path) = record(Program::new(vec![main.build(0)], 0), &[], "scaling");

    let VmResult::Completed(GuestValue::Float(value)) = result else {
        panic!("expected a float result, got {result:?}");
    };
    assert!((value - 0.2295).abs() < 1e-9);

    let reader = TraceReader::open(&path).unwrap();
    // counter 10 is the StoreLocal of e; walk from its binding token
    let state = reader.seek(reader.max_counter(0)).unwrap();
    let locals = reader.locals_at(1, reader.max_counter(0)).unwrap();
    let e_slot = locals.iter().find(|l| l.name == "e").unwrap();
    assert_eq!(state.thread_id, 0);

    let chain = reader.back_walk(e_slot.tok, 64).unwrap();
    assert!(!chain.truncated);
    let root_counters: Vec<u64> = chain
        .nodes
        .iter()
        .filter(|n| n.is_root() && n.kind == TokKind::Const)
        .map(|n| n.tok.counter())
        .collect();
    // The const 30 at counter 1 is among the recorded roots
    assert!(root_counters.contains(&1), "missing const-30 root, got {root_counters:?}");
}

#[test]
fn test_opaque_call_boundary() {
    logging::ensure_test_logging(None);
    info!("Running test");
    fn randint(_args: &[GuestValue]) -> Result<GuestValue, String> {
        // a very fair die
        Ok(GuestValue::Int(37))
    }

    let mut main = CodeBuilder::new("main", "roll.dyn");
    let g = main.name("random.randint");
    let r = main.name("r");
    let c1 = main.constant(GuestValue::Int(1));
    let c100 = main.constant(GuestValue::Int(100));
    main.at_line(1)
        .op(Opcode::LoadGlobal, g)
        .op(Opcode::LoadConst, c1)
        .op(Opcode::LoadConst, c100)
        .op(Opcode::Call, 2)
        .op(Opcode::StoreLocal, r)
        .at_line(2)
        .op(Opcode::LoadLocal, r)
        .op(Opcode::Return, 0);

    let (result, path) = record(
        Program::new(vec![main.build(0)], 0),
        &[("random.randint", randint)],
        "opaque",
    );
    assert_eq!(result, VmResult::Completed(GuestValue::Int(37)));

    let reader = TraceReader::open(&path).unwrap();
    // Counters: 1 LoadGlobal, 2 LoadConst, 3 LoadConst, 4 Call
    let returned = Tok::new(0, 4);
    assert_eq!(reader.parents_of(returned).unwrap(), vec![], "opaque calls are roots");
    assert_eq!(reader.kind_of(returned).unwrap(), TokKind::External);

    let event = reader.event_for_tok(returned).unwrap();
    let ext = event.ext.as_ref().expect("call event carries callee identity");
    assert_eq!(ext.callee_name, "random.randint");
    // The event still records what flowed into the black box
    assert_eq!(event.consumed.len(), 3);

    let chain = reader.back_walk(returned, 32).unwrap();
    assert_eq!(chain.nodes.len(), 1);
    assert_eq!(chain.nodes[0].ext.as_ref().unwrap().callee_name, "random.randint");
}

#[test]
fn test_stepping_callback_rearms_and_disarms() {
    logging::ensure_test_logging(None);
    info!("Running test");
    let dir = std::env::temp_dir()
        .join("odb-test-traces")
        .join(format!("callback-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let recorder = Recorder::new(
        RecorderConfig::default().with_trace_dir(&dir).with_callback_at(5),
    );
    let mut session = recorder.start_session(1, "callback").unwrap();

    let fired: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = fired.clone();
    session.set_callback(Box::new(move |snapshot| {
        seen.lock().push(snapshot.instruction_counter);
        match snapshot.instruction_counter {
            5 => Ok(Some(10)),
            _ => Ok(None),
        }
    }));

    // 12 opcodes: six pushes and five pops, then return
    let mut main = CodeBuilder::new("main", "steps.dyn");
    let c0 = main.constant(GuestValue::Int(0));
    for _ in 0..6 {
        main.op(Opcode::LoadConst, c0);
    }
    for _ in 0..5 {
        main.op(Opcode::Pop, 0);
    }
    main.op(Opcode::Return, 0);

    let mut vm = MiniVm::new(Program::new(vec![main.build(0)], 0));
    let result = vm.run(&mut session).unwrap();
    assert_eq!(result, VmResult::Completed(GuestValue::Int(0)));
    session.finish().unwrap();

    // Fired exactly at 5, re-armed to 10, then disarmed
    assert_eq!(*fired.lock(), vec![5, 10]);
}

#[test]
fn test_callback_failure_aborts_session() {
    logging::ensure_test_logging(None);
    info!("Running test");
    let dir = std::env::temp_dir()
        .join("odb-test-traces")
        .join(format!("cb-fail-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let recorder = Recorder::new(
        RecorderConfig::default().with_trace_dir(&dir).with_callback_at(3),
    );
    let mut session = recorder.start_session(1, "cb-fail").unwrap();
    session.set_callback(Box::new(|_| eyre::bail!("scripted failure")));

    let mut vm = MiniVm::new(pipeline_program());
    let err = vm.run(&mut session).unwrap_err();
    assert!(err.to_string().contains("scripted failure"), "got: {err}");
    assert_eq!(session.aborted(), Some(AbortReason::CallbackFailed));

    // The log still closes cleanly and records the abort
    let path = session.finish().unwrap();
    let reader = TraceReader::open(&path).unwrap();
    assert!(reader.is_truncated());
    assert_eq!(reader.aborts().len(), 1);
    assert_eq!(reader.aborts()[0].reason, AbortReason::CallbackFailed);
}

#[test]
fn test_cancellation_emits_aborted_event() {
    logging::ensure_test_logging(None);
    info!("Running test");
    let dir = std::env::temp_dir()
        .join("odb-test-traces")
        .join(format!("cancel-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let recorder = Recorder::new(
        RecorderConfig::default().with_trace_dir(&dir).with_callback_at(0),
    );
    let mut session = recorder.start_session(1, "cancel").unwrap();
    session.cancel_handle().cancel();

    let mut vm = MiniVm::new(pipeline_program());
    assert!(vm.run(&mut session).is_err());
    assert_eq!(session.aborted(), Some(AbortReason::Cancelled));

    let path = session.finish().unwrap();
    let reader = TraceReader::open(&path).unwrap();
    assert!(reader.is_truncated());
    assert_eq!(reader.aborts()[0].reason, AbortReason::Cancelled);
}

#[test]
fn test_exception_flow_binds_exception_token() {
    logging::ensure_test_logging(None);
    info!("Running test");
    // try: x = 1 / 0 except e: return e
    let mut main = CodeBuilder::new("main", "boom.dyn");
    let c1 = main.constant(GuestValue::Int(1));
    let c0 = main.constant(GuestValue::Int(0));
    let e = main.name("e");
    // 0 SetupExcept(5) 1 LoadConst 2 LoadConst 3 BinaryOp 4 Return
    // 5 BindExcept(e) 6 LoadLocal(e) 7 Return
    main.at_line(1)
        .op(Opcode::SetupExcept, 5)
        .at_line(2)
        .op(Opcode::LoadConst, c1)
        .op(Opcode::LoadConst, c0)
        .op(Opcode::BinaryOp, BinaryKind::Div as u32)
        .op(Opcode::Return, 0)
        .at_line(3)
        .op(Opcode::BindExcept, e)
        .op(Opcode::LoadLocal, e)
        .op(Opcode::Return, 0);

    let (result, path) = record(Program::new(vec![main.build(0)], 0), &[], "exception");
    assert_eq!(result, VmResult::Completed(GuestValue::Str("division by zero".into())));

    let reader = TraceReader::open(&path).unwrap();
    assert!(!reader.is_truncated(), "a handled guest fault is not a session failure");

    // Counters: 1 SetupExcept, 2 LoadConst 1, 3 LoadConst 0, 4 Div (fault),
    // 5 Unwind, 6 BindExcept, 7 LoadLocal, 8 Return
    let div = reader.event_at(0, 4).unwrap();
    assert!(div.fault);
    assert!(div.produced.is_empty());

    let exc = Tok::new(0, 4);
    assert_eq!(reader.kind_of(exc).unwrap(), TokKind::Exception);
    // The exception's parents are both operands of the division
    assert_eq!(reader.parents_of(exc).unwrap(), vec![Tok::new(0, 2), Tok::new(0, 3)]);

    // The unwind step pushes the same token the fault minted
    let unwind = reader.event_at(0, 5).unwrap();
    assert_eq!(unwind.opcode, Opcode::Unwind);
    assert_eq!(unwind.produced.as_slice(), &[exc]);

    // except e: the bound local's token equals the exception token
    let locals = reader.locals_at(1, 6).unwrap();
    let e_slot = locals.iter().find(|l| l.name == "e").unwrap();
    assert_eq!(e_slot.tok, exc);
}

#[test]
fn test_provenance_crosses_instrumented_calls() {
    logging::ensure_test_logging(None);
    info!("Running test");
    // def double(x): return x + x
    let mut double = CodeBuilder::new("double", "call.dyn");
    let x = double.name("x");
    double
        .at_line(1)
        .op(Opcode::LoadLocal, x)
        .op(Opcode::LoadLocal, x)
        .op(Opcode::BinaryOp, BinaryKind::Add as u32)
        .op(Opcode::Return, 0);

    // r = double(21); return r
    let mut main = CodeBuilder::new("main", "call.dyn");
    let f = main.constant(GuestValue::Function(0));
    let c21 = main.constant(GuestValue::Int(21));
    let r = main.name("r");
    main.at_line(3)
        .op(Opcode::LoadConst, f)
        .op(Opcode::LoadConst, c21)
        .op(Opcode::Call, 1)
        .op(Opcode::StoreLocal, r)
        .at_line(4)
        .op(Opcode::LoadLocal, r)
        .op(Opcode::Return, 0);

    let (result, path) =
        record(Program::new(vec![double.build(0), main.build(1)], 1), &[], "guest-call");
    assert_eq!(result, VmResult::Completed(GuestValue::Int(42)));

    let reader = TraceReader::open(&path).unwrap();
    // Counters: 1 LoadConst f, 2 LoadConst 21, 3 Call, 4 LoadLocal x,
    // 5 LoadLocal x, 6 Add, 7 Return, 8 StoreLocal r, ...
    let call = reader.event_at(0, 3).unwrap();
    assert!(call.produced.is_empty(), "instrumented calls defer the value to the callee");
    assert!(call.ext.is_none());

    // r's binding token chains into the callee and down to the literal 21
    let r_tok = Tok::new(0, 8);
    let chain = reader.back_walk(r_tok, 32).unwrap();
    assert!(chain.nodes.iter().any(|n| n.code_id == 0), "chain visits the callee's code");
    let const21 = chain
        .nodes
        .iter()
        .find(|n| n.tok == Tok::new(0, 2))
        .expect("chain reaches the const 21 from the caller");
    assert_eq!(const21.kind, TokKind::Const);

    // Two frames were recorded, the callee nested in the caller
    let frames = reader.frames_at(5).unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].code_id, 0);
    assert_eq!(frames[0].parent_frame_ord, Some(frames[1].frame_ord));
}

#[test]
fn test_counter_and_balance_invariants() {
    logging::ensure_test_logging(None);
    info!("Running test");
    let (_, path) = record(pipeline_program(), &[], "invariants");
    let reader = TraceReader::open(&path).unwrap();

    let max = reader.max_counter(0);
    assert!(max >= 10);
    let mut depth: i64 = 0;
    for counter in 1..=max {
        let event = reader.event_at(0, counter).expect("counters are contiguous");
        assert_eq!(event.counter, counter);
        depth -= event.consumed.len() as i64;
        assert!(depth >= 0, "shadow stack would underflow at counter {counter}");
        depth += event.produced.len() as i64;

        // Acyclicity: parents strictly precede their children
        for parent in reader.parents_of(Tok::new(0, counter)).unwrap() {
            assert!(parent.counter() < counter);
        }
    }
    // Single frame, explicit return: everything was consumed
    assert_eq!(depth, 0);
}

#[test]
fn test_dup_propagates_instead_of_minting() {
    logging::ensure_test_logging(None);
    info!("Running test");
    let mut main = CodeBuilder::new("main", "dup.dyn");
    let c2 = main.constant(GuestValue::Int(2));
    main.op(Opcode::LoadConst, c2)
        .op(Opcode::Dup, 1)
        .op(Opcode::BinaryOp, BinaryKind::Mul as u32)
        .op(Opcode::Return, 0);

    let (result, path) = record(Program::new(vec![main.build(0)], 0), &[], "dup");
    assert_eq!(result, VmResult::Completed(GuestValue::Int(4)));

    let reader = TraceReader::open(&path).unwrap();
    let dup = reader.event_at(0, 2).unwrap();
    // The dup produced an existing token, not a fresh one
    assert_eq!(dup.produced.as_slice(), &[Tok::new(0, 1)]);

    let mul = reader.event_at(0, 3).unwrap();
    assert_eq!(mul.consumed.as_slice(), &[Tok::new(0, 1), Tok::new(0, 1)]);
    // Both operands collapse to the single constant parent
    assert_eq!(reader.parents_of(Tok::new(0, 3)).unwrap(), vec![Tok::new(0, 1)]);
}

#[test]
fn test_repeated_const_load_links_to_first() {
    logging::ensure_test_logging(None);
    info!("Running test");
    let mut main = CodeBuilder::new("main", "consts.dyn");
    let c5 = main.constant(GuestValue::Int(5));
    main.op(Opcode::LoadConst, c5)
        .op(Opcode::Pop, 0)
        .op(Opcode::LoadConst, c5)
        .op(Opcode::Return, 0);

    let (_, path) = record(Program::new(vec![main.build(0)], 0), &[], "consts");
    let reader = TraceReader::open(&path).unwrap();

    assert_eq!(reader.parents_of(Tok::new(0, 1)).unwrap(), vec![]);
    // The second load of the same constant links back to the first
    assert_eq!(reader.parents_of(Tok::new(0, 3)).unwrap(), vec![Tok::new(0, 1)]);
    assert_eq!(reader.kind_of(Tok::new(0, 3)).unwrap(), TokKind::Const);
}
