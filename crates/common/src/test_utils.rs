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

//! Bundled guest evaluator used by tests and by hosts without a native
//! frame-evaluation extension point.
//!
//! [`MiniVm`] is a small single-threaded stack interpreter for the guest
//! bytecode of [`crate::opcode::Opcode`]. It drives any [`RecordHook`]
//! through the full host contract: `code_loaded` on startup, `frame_enter`
//! per frame, `step`/`step_end` around every opcode, `frame_unwound` during
//! exception propagation. Programs are assembled with [`CodeBuilder`].

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use eyre::Result;

use crate::hook::{RecordHook, StepContext, StepOutcome};
use crate::opcode::{BinaryKind, Opcode, UnaryKind};
use crate::types::{CodeInfo, ExternalCall, GuestValue};

/// One assembled guest instruction.
#[derive(Debug, Clone, Copy)]
pub struct Instr {
    /// The opcode
    pub op: Opcode,
    /// Its argument
    pub arg: u32,
    /// Source line the instruction was compiled from
    pub line: u32,
}

/// A guest code object: metadata plus the executable instruction stream.
#[derive(Debug, Clone)]
pub struct Code {
    /// Shared metadata (names, line map, constant renderings)
    pub info: CodeInfo,
    /// Actual constant values, parallel to `info.const_reprs`
    pub consts: Vec<GuestValue>,
    /// Instruction stream
    pub instrs: Vec<Instr>,
}

/// A complete guest program.
#[derive(Debug, Clone)]
pub struct Program {
    /// Code objects; `code_id` equals the index
    pub codes: Vec<Code>,
    /// Index of the entry code object
    pub entry: usize,
}

impl Program {
    /// Assemble a program from code objects whose ids match their position.
    pub fn new(codes: Vec<Code>, entry: usize) -> Self {
        for (idx, code) in codes.iter().enumerate() {
            assert_eq!(code.info.code_id as usize, idx, "code_id must equal its index");
        }
        assert!(entry < codes.len());
        Self { codes, entry }
    }
}

/// Incremental builder for [`Code`] objects in tests.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    name: String,
    source_path: PathBuf,
    consts: Vec<GuestValue>,
    names: Vec<String>,
    instrs: Vec<Instr>,
    current_line: u32,
}

impl CodeBuilder {
    /// Start a code object with a function name and source path.
    pub fn new(name: &str, source_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            source_path: source_path.into(),
            current_line: 1,
            ..Default::default()
        }
    }

    /// Intern a constant, returning its index.
    pub fn constant(&mut self, value: GuestValue) -> u32 {
        if let Some(idx) = self.consts.iter().position(|v| *v == value) {
            return idx as u32;
        }
        self.consts.push(value);
        (self.consts.len() - 1) as u32
    }

    /// Intern a variable name, returning its id.
    pub fn name(&mut self, name: &str) -> u32 {
        if let Some(idx) = self.names.iter().position(|n| n == name) {
            return idx as u32;
        }
        self.names.push(name.to_string());
        (self.names.len() - 1) as u32
    }

    /// Set the source line for subsequently emitted instructions.
    pub fn at_line(&mut self, line: u32) -> &mut Self {
        self.current_line = line;
        self
    }

    /// Emit one instruction at the current line.
    pub fn op(&mut self, op: Opcode, arg: u32) -> &mut Self {
        self.instrs.push(Instr { op, arg, line: self.current_line });
        self
    }

    /// The index the next emitted instruction will occupy (jump target).
    pub fn next_offset(&self) -> u32 {
        self.instrs.len() as u32
    }

    /// Finalize into a [`Code`] with the given id.
    pub fn build(self, code_id: u32) -> Code {
        let mut line_map: Vec<(u32, u32)> = Vec::new();
        for (offset, instr) in self.instrs.iter().enumerate() {
            if line_map.last().map(|(_, l)| *l) != Some(instr.line) {
                line_map.push((offset as u32, instr.line));
            }
        }
        let info = CodeInfo {
            code_id,
            name: self.name,
            source_path: self.source_path,
            line_map,
            local_names: self.names,
            const_reprs: self.consts.iter().map(GuestValue::repr).collect(),
        };
        Code { info, consts: self.consts, instrs: self.instrs }
    }
}

/// Host function callable from guest code but opaque to the recorder.
pub type BuiltinFn = fn(&[GuestValue]) -> std::result::Result<GuestValue, String>;

/// How a [`MiniVm`] run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum VmResult {
    /// The entry frame returned this value
    Completed(GuestValue),
    /// An exception escaped the entry frame
    Faulted {
        /// Description of the escaped exception
        message: String,
    },
}

#[derive(Debug, Clone, Copy)]
struct Handler {
    target_pc: u32,
    depth: usize,
}

#[derive(Debug)]
struct VmFrame {
    code_idx: usize,
    pc: usize,
    stack: Vec<GuestValue>,
    locals: HashMap<u32, GuestValue>,
    handler: Option<Handler>,
}

impl VmFrame {
    fn new(code_idx: usize) -> Self {
        Self { code_idx, pc: 0, stack: Vec::new(), locals: HashMap::new(), handler: None }
    }
}

/// Minimal single-threaded guest interpreter.
pub struct MiniVm {
    program: Program,
    globals: HashMap<String, GuestValue>,
    builtins: HashMap<String, BuiltinFn>,
}

const MAIN_THREAD: u16 = 0;

impl MiniVm {
    /// Create a VM over `program` with empty globals and no builtins.
    pub fn new(program: Program) -> Self {
        Self { program, globals: HashMap::new(), builtins: HashMap::new() }
    }

    /// Register an opaque host callable reachable via `LoadGlobal`.
    pub fn with_builtin(mut self, name: &str, f: BuiltinFn) -> Self {
        self.builtins.insert(name.to_string(), f);
        self
    }

    /// Run the program to completion, driving `hook` through every opcode.
    pub fn run(&mut self, hook: &mut dyn RecordHook) -> Result<VmResult> {
        for code in &self.program.codes {
            hook.code_loaded(&code.info)?;
        }

        let mut frames = vec![VmFrame::new(self.program.entry)];
        hook.frame_enter(MAIN_THREAD, self.program.entry as u32)?;

        loop {
            let frame = frames.last_mut().expect("at least one live frame");
            let code = &self.program.codes[frame.code_idx];
            let Some(instr) = code.instrs.get(frame.pc).copied() else {
                eyre::bail!(
                    "code {} ran off the end at pc {} (missing Return)",
                    code.info.code_id,
                    frame.pc
                );
            };

            let ctx = StepContext {
                thread_id: MAIN_THREAD,
                code: &code.info,
                instr_offset: frame.pc as u32,
                opcode: instr.op,
                arg: instr.arg,
                stack_depth: frame.stack.len(),
            };
            hook.step(&ctx)?;

            let effect = Self::execute(
                frame,
                &code.consts,
                &code.info,
                &self.globals,
                &self.builtins,
                instr,
            );

            match effect {
                Effect::Completed { stored, assign_global } => {
                    if let Some((name, value)) = assign_global {
                        self.globals.insert(name, value);
                    }
                    hook.step_end(&ctx, &StepOutcome::Completed { stored })?;
                    frame.pc += 1;
                }
                Effect::Jump { target } => {
                    hook.step_end(&ctx, &StepOutcome::Completed { stored: None })?;
                    frame.pc = target as usize;
                }
                Effect::EnterFrame { code_id, args } => {
                    hook.step_end(&ctx, &StepOutcome::EnterFrame { code_id })?;
                    frame.pc += 1;
                    let mut callee = VmFrame::new(code_id as usize);
                    for (i, arg) in args.into_iter().enumerate() {
                        callee.locals.insert(i as u32, arg);
                    }
                    frames.push(callee);
                    hook.frame_enter(MAIN_THREAD, code_id)?;
                }
                Effect::External { call, value } => {
                    let pushed = Some(value.repr());
                    frame.stack.push(value);
                    hook.step_end(&ctx, &StepOutcome::External { call, pushed })?;
                    frame.pc += 1;
                }
                Effect::Return { value } => {
                    hook.step_end(
                        &ctx,
                        &StepOutcome::Return { returned: Some(value.repr()) },
                    )?;
                    frames.pop();
                    match frames.last_mut() {
                        Some(caller) => caller.stack.push(value),
                        None => return Ok(VmResult::Completed(value)),
                    }
                }
                Effect::Fault { message, value } => {
                    hook.step_end(&ctx, &StepOutcome::Fault { message: message.clone() })?;
                    if !self.unwind(&mut frames, value, hook)? {
                        return Ok(VmResult::Faulted { message });
                    }
                }
            }
        }
    }

    /// Propagate a pending exception: run handler unwind steps or discard
    /// frames. Returns false when the exception escaped the entry frame.
    fn unwind(
        &self,
        frames: &mut Vec<VmFrame>,
        exc: GuestValue,
        hook: &mut dyn RecordHook,
    ) -> Result<bool> {
        loop {
            let Some(frame) = frames.last_mut() else {
                return Ok(false);
            };
            if let Some(handler) = frame.handler.take() {
                let code = &self.program.codes[frame.code_idx];
                let popped = frame.stack.len() - handler.depth;
                let ctx = StepContext {
                    thread_id: MAIN_THREAD,
                    code: &code.info,
                    instr_offset: frame.pc as u32,
                    opcode: Opcode::Unwind,
                    arg: popped as u32,
                    stack_depth: frame.stack.len(),
                };
                hook.step(&ctx)?;
                frame.stack.truncate(handler.depth);
                frame.stack.push(exc);
                hook.step_end(&ctx, &StepOutcome::Completed { stored: None })?;
                frame.pc = handler.target_pc as usize;
                return Ok(true);
            }
            hook.frame_unwound(MAIN_THREAD)?;
            frames.pop();
        }
    }

    fn execute(
        frame: &mut VmFrame,
        consts: &[GuestValue],
        info: &CodeInfo,
        globals: &HashMap<String, GuestValue>,
        builtins: &HashMap<String, BuiltinFn>,
        instr: Instr,
    ) -> Effect {
        let arg = instr.arg;
        match instr.op {
            Opcode::Nop => Effect::done(),
            Opcode::LoadConst => match consts.get(arg as usize) {
                Some(v) => {
                    frame.stack.push(v.clone());
                    Effect::done()
                }
                None => Effect::fault(format!("constant index {arg} out of range")),
            },
            Opcode::LoadLocal => match frame.locals.get(&arg) {
                Some(v) => {
                    frame.stack.push(v.clone());
                    Effect::done()
                }
                None => Effect::fault(format!(
                    "local '{}' referenced before assignment",
                    info.local_name(arg).unwrap_or("?")
                )),
            },
            Opcode::StoreLocal => match frame.stack.pop() {
                Some(v) => {
                    let stored = Some(v.repr());
                    frame.locals.insert(arg, v);
                    Effect::Completed { stored, assign_global: None }
                }
                None => Effect::fault("store on empty stack".to_string()),
            },
            Opcode::LoadGlobal => {
                let Some(name) = info.local_name(arg) else {
                    return Effect::fault(format!("name index {arg} out of range"));
                };
                if let Some(v) = globals.get(name) {
                    frame.stack.push(v.clone());
                    Effect::done()
                } else if builtins.contains_key(name) {
                    frame.stack.push(GuestValue::Builtin(name.to_string()));
                    Effect::done()
                } else {
                    Effect::fault(format!("name '{name}' is not defined"))
                }
            }
            Opcode::StoreGlobal => {
                let Some(name) = info.local_name(arg) else {
                    return Effect::fault(format!("name index {arg} out of range"));
                };
                match frame.stack.pop() {
                    Some(v) => Effect::Completed {
                        stored: Some(v.repr()),
                        assign_global: Some((name.to_string(), v)),
                    },
                    None => Effect::fault("store on empty stack".to_string()),
                }
            }
            Opcode::Dup => {
                let k = arg as usize;
                if k == 0 || frame.stack.len() < k {
                    return Effect::fault(format!("dup of {k} on shallow stack"));
                }
                let base = frame.stack.len() - k;
                for i in base..frame.stack.len() {
                    let v = frame.stack[i].clone();
                    frame.stack.push(v);
                }
                Effect::done()
            }
            Opcode::Swap => {
                let len = frame.stack.len();
                if len < 2 {
                    return Effect::fault("swap on shallow stack".to_string());
                }
                frame.stack.swap(len - 1, len - 2);
                Effect::done()
            }
            Opcode::Rot => {
                let k = arg as usize;
                if k < 2 || frame.stack.len() < k {
                    return Effect::fault(format!("rot of {k} on shallow stack"));
                }
                let len = frame.stack.len();
                frame.stack[len - k..].rotate_right(1);
                Effect::done()
            }
            Opcode::Pop => match frame.stack.pop() {
                Some(_) => Effect::done(),
                None => Effect::fault("pop on empty stack".to_string()),
            },
            Opcode::UnaryOp => {
                let Some(kind) = UnaryKind::from_arg(arg) else {
                    return Effect::fault(format!("unknown unary op {arg}"));
                };
                let Some(v) = frame.stack.pop() else {
                    return Effect::fault("unary op on empty stack".to_string());
                };
                match unary_op(kind, v) {
                    Ok(v) => {
                        frame.stack.push(v);
                        Effect::done()
                    }
                    Err(message) => Effect::fault(message),
                }
            }
            Opcode::BinaryOp => {
                let Some(kind) = BinaryKind::from_arg(arg) else {
                    return Effect::fault(format!("unknown binary op {arg}"));
                };
                let (Some(rhs), Some(lhs)) = (frame.stack.pop(), frame.stack.pop()) else {
                    return Effect::fault("binary op on shallow stack".to_string());
                };
                match binary_op(kind, lhs, rhs) {
                    Ok(v) => {
                        frame.stack.push(v);
                        Effect::done()
                    }
                    Err(message) => Effect::fault(message),
                }
            }
            Opcode::BuildList => {
                let n = arg as usize;
                if frame.stack.len() < n {
                    return Effect::fault("build_list on shallow stack".to_string());
                }
                let items = frame.stack.split_off(frame.stack.len() - n);
                frame.stack.push(GuestValue::List(items));
                Effect::done()
            }
            Opcode::UnpackSequence => {
                let Some(v) = frame.stack.pop() else {
                    return Effect::fault("unpack on empty stack".to_string());
                };
                let GuestValue::List(items) = v else {
                    return Effect::fault("cannot unpack non-sequence".to_string());
                };
                if items.len() != arg as usize {
                    return Effect::fault(format!(
                        "expected {} values to unpack, got {}",
                        arg,
                        items.len()
                    ));
                }
                // leftmost element ends up on top
                for item in items.into_iter().rev() {
                    frame.stack.push(item);
                }
                Effect::done()
            }
            Opcode::Jump => Effect::Jump { target: arg },
            Opcode::JumpIfFalse | Opcode::JumpIfTrue => {
                let Some(v) = frame.stack.pop() else {
                    return Effect::fault("branch on empty stack".to_string());
                };
                let jump = if instr.op == Opcode::JumpIfFalse {
                    !v.is_truthy()
                } else {
                    v.is_truthy()
                };
                if jump {
                    Effect::Jump { target: arg }
                } else {
                    Effect::done()
                }
            }
            Opcode::Call => {
                let argc = arg as usize;
                if frame.stack.len() < argc + 1 {
                    return Effect::fault("call on shallow stack".to_string());
                }
                let args = frame.stack.split_off(frame.stack.len() - argc);
                let callee = frame.stack.pop().expect("callee checked above");
                match callee {
                    GuestValue::Function(code_id) => Effect::EnterFrame { code_id, args },
                    GuestValue::Builtin(name) => {
                        let Some(f) = builtins.get(&name) else {
                            return Effect::fault(format!("builtin '{name}' vanished"));
                        };
                        let call = ExternalCall {
                            callee_name: name.clone(),
                            signature_hash: signature_hash(&args),
                        };
                        match f(&args) {
                            Ok(value) => Effect::External { call, value },
                            Err(message) => Effect::fault(message),
                        }
                    }
                    other => Effect::fault(format!("{} is not callable", other.repr())),
                }
            }
            Opcode::Return => match frame.stack.pop() {
                Some(value) => Effect::Return { value },
                None => Effect::fault("return on empty stack".to_string()),
            },
            Opcode::Raise => match frame.stack.pop() {
                Some(value) => {
                    let message = value.repr();
                    Effect::Fault { message, value }
                }
                None => Effect::fault("raise on empty stack".to_string()),
            },
            Opcode::SetupExcept => {
                frame.handler = Some(Handler { target_pc: arg, depth: frame.stack.len() });
                Effect::done()
            }
            // Unwind steps are synthesized by the interpreter loop, never
            // fetched from the instruction stream
            Opcode::Unwind => Effect::fault("unwind in instruction stream".to_string()),
            Opcode::BindExcept => match frame.stack.pop() {
                Some(v) => {
                    let stored = Some(v.repr());
                    frame.locals.insert(arg, v);
                    Effect::Completed { stored, assign_global: None }
                }
                None => Effect::fault("bind_except on empty stack".to_string()),
            },
        }
    }
}

enum Effect {
    Completed { stored: Option<String>, assign_global: Option<(String, GuestValue)> },
    Jump { target: u32 },
    EnterFrame { code_id: u32, args: Vec<GuestValue> },
    External { call: ExternalCall, value: GuestValue },
    Return { value: GuestValue },
    Fault { message: String, value: GuestValue },
}

impl Effect {
    fn done() -> Self {
        Self::Completed { stored: None, assign_global: None }
    }

    fn fault(message: String) -> Self {
        let value = GuestValue::Str(message.clone());
        Self::Fault { message, value }
    }
}

fn unary_op(kind: UnaryKind, v: GuestValue) -> std::result::Result<GuestValue, String> {
    match (kind, v) {
        (UnaryKind::Neg, GuestValue::Int(i)) => Ok(GuestValue::Int(-i)),
        (UnaryKind::Neg, GuestValue::Float(f)) => Ok(GuestValue::Float(-f)),
        (UnaryKind::Not, v) => Ok(GuestValue::Bool(!v.is_truthy())),
        (UnaryKind::Neg, v) => Err(format!("bad operand for unary neg: {}", v.repr())),
    }
}

fn binary_op(
    kind: BinaryKind,
    lhs: GuestValue,
    rhs: GuestValue,
) -> std::result::Result<GuestValue, String> {
    use GuestValue::*;
    match kind {
        BinaryKind::Eq => Ok(Bool(lhs == rhs)),
        BinaryKind::Add => match (lhs, rhs) {
            (Int(a), Int(b)) => Ok(Int(a + b)),
            (Str(a), Str(b)) => Ok(Str(a + &b)),
            (List(mut a), List(b)) => {
                a.extend(b);
                Ok(List(a))
            }
            (a, b) => numeric(a, b).map(|(x, y)| Float(x + y)),
        },
        BinaryKind::Sub => match (lhs, rhs) {
            (Int(a), Int(b)) => Ok(Int(a - b)),
            (a, b) => numeric(a, b).map(|(x, y)| Float(x - y)),
        },
        BinaryKind::Mul => match (lhs, rhs) {
            (Int(a), Int(b)) => Ok(Int(a * b)),
            (a, b) => numeric(a, b).map(|(x, y)| Float(x * y)),
        },
        BinaryKind::Div => {
            let (a, b) = numeric(lhs, rhs)?;
            if b == 0.0 {
                Err("division by zero".to_string())
            } else {
                Ok(Float(a / b))
            }
        }
        BinaryKind::Lt => {
            let (a, b) = numeric(lhs, rhs)?;
            Ok(Bool(a < b))
        }
        BinaryKind::Gt => {
            let (a, b) = numeric(lhs, rhs)?;
            Ok(Bool(a > b))
        }
    }
}

fn numeric(a: GuestValue, b: GuestValue) -> std::result::Result<(f64, f64), String> {
    let coerce = |v: &GuestValue| match v {
        GuestValue::Int(i) => Some(*i as f64),
        GuestValue::Float(f) => Some(*f),
        GuestValue::Bool(b) => Some(*b as i64 as f64),
        _ => None,
    };
    match (coerce(&a), coerce(&b)) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(format!("unsupported operand types: {} and {}", a.repr(), b.repr())),
    }
}

fn signature_hash(args: &[GuestValue]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for arg in args {
        let tag = match arg {
            GuestValue::None => "none",
            GuestValue::Bool(_) => "bool",
            GuestValue::Int(_) => "int",
            GuestValue::Float(_) => "float",
            GuestValue::Str(_) => "str",
            GuestValue::List(_) => "list",
            GuestValue::Function(_) => "function",
            GuestValue::Builtin(_) => "builtin",
        };
        tag.hash(&mut hasher);
    }
    hasher.finish()
}
