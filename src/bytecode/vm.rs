//! The interpreter main loop (§4.3, §5).
//!
//! Grounded on `ouros::bytecode::vm::mod`'s cached-frame-reload discipline
//! (every frame-stack mutation is followed by reloading whatever cached
//! state depends on it) and `ouros::bytecode::vm::call`'s call-result
//! dispatch (a call either produces a value directly or pushes a frame and
//! hands control to a nested loop), adapted from Python's call-kwargs
//! protocol to this core's promise/dots/S3-S4 protocol.
//!
//! Non-local transfer (`break`/`next`/`return`) does not unwind through the
//! host call stack via `panic`/`longjmp`: it is an ordinary `Err` value
//! (`RunError::Transfer`) that every `run` invocation inspects at its own
//! instruction-dispatch boundary. Each invocation remembers `my_base`, the
//! frame-stack length at its own entry; a transfer whose target frame lives
//! at or above `my_base` belongs to *this* invocation and is resolved here,
//! otherwise the frames this invocation pushed are abandoned and the error
//! propagates to the ancestor invocation that owns the target frame (§5).

use std::{cell::RefCell, rc::Rc};

use smallvec::SmallVec;

use super::{
    code::{CodeObject, FunctionObject, DOTS_ARG_IDX, MISSING_ARG_IDX},
    op::{Opcode, TypeTag},
};
use crate::{
    env::{make_pairlist, Environment},
    error::{RunError, TransferKind},
    frame::{CallFrame, CallStack},
    host::HostRuntime,
    intern::{Interns, StringId},
    pool::PoolKey,
    stack::ValueStack,
    value::{Closure, CodeRef, Logical, Named, Promise, PromiseBody, PromiseState, Value},
    Limits,
};

/// Actual-argument (tag, value) pairs built per call (§4.1 `call_`/
/// `call_stack_`/`dispatch_`). Most calls in practice pass a handful of
/// arguments, so this stays inline instead of heap-allocating — the same
/// role `smallvec` plays for `ouros`'s own per-call argument buffers.
pub type ActualArgs = SmallVec<[(Option<StringId>, Value); 4]>;

fn read_u32(ops: &[u8], pc: &mut usize) -> u32 {
    let bytes: [u8; 4] = ops[*pc..*pc + 4].try_into().expect("4 bytes available");
    *pc += 4;
    u32::from_le_bytes(bytes)
}

fn read_i32(ops: &[u8], pc: &mut usize) -> i32 {
    let bytes: [u8; 4] = ops[*pc..*pc + 4].try_into().expect("4 bytes available");
    *pc += 4;
    i32::from_le_bytes(bytes)
}

/// Relative jump offsets are measured from the instruction boundary just
/// past the operand, matching `CodeBuilder::patch_jump`'s `label.0 + 5`.
fn read_jump_target(code: &CodeObject, pc: &mut usize) -> usize {
    let offset = read_i32(&code.ops, pc);
    (*pc as i64 + i64::from(offset)) as usize
}

fn walk_values(v: &Value) -> Vec<Value> {
    let mut out = Vec::new();
    let mut cur = v.clone();
    while let Value::Pair(cell) = cur {
        let cons = cell.borrow();
        out.push(cons.car.clone());
        let next = cons.cdr.clone();
        drop(cons);
        cur = next;
    }
    out
}

fn pairlist_entries(v: &Value) -> Vec<(Option<StringId>, Value)> {
    let mut out = Vec::new();
    let mut cur = v.clone();
    while let Value::Pair(cell) = cur {
        let cons = cell.borrow();
        out.push((cons.tag, cons.car.clone()));
        let next = cons.cdr.clone();
        drop(cons);
        cur = next;
    }
    out
}

fn names_entries(function: &Rc<FunctionObject>, names_key: PoolKey) -> Vec<Option<StringId>> {
    let v = function.consts.get(names_key);
    if matches!(v, Value::Nil) {
        return Vec::new();
    }
    walk_values(v)
        .into_iter()
        .map(|nv| if let Value::Symbol(id) = nv { Some(id) } else { None })
        .collect()
}

fn source_for(function: &Rc<FunctionObject>, code: &CodeObject, pc: usize) -> Value {
    function.source.get(code.src_at(pc)).cloned().unwrap_or(Value::Nil)
}

/// `asbool_`'s strict conversion: errors on `NA` and on a zero-length
/// vector, used by `if`/`while` conditions (via `brtrue_`/`brfalse_`).
fn logical_strict(v: &Value) -> Result<bool, RunError> {
    match v.strip_object() {
        Value::Logical(Logical::True) => Ok(true),
        Value::Logical(Logical::False) => Ok(false),
        Value::Logical(Logical::Na) => Err(RunError::BadCondition { reason: "missing value where TRUE/FALSE needed".into() }),
        Value::Real(x) if x.is_nan() => Err(RunError::BadCondition { reason: "missing value where TRUE/FALSE needed".into() }),
        Value::Real(x) => Ok(*x != 0.0),
        Value::Int(x) => Ok(*x != 0),
        Value::Vector(data) => data
            .items
            .first()
            .map(logical_strict)
            .transpose()?
            .ok_or_else(|| RunError::BadCondition { reason: "argument is of length zero".into() }),
        Value::Nil => Err(RunError::BadCondition { reason: "argument is of length zero".into() }),
        _ => Err(RunError::BadCondition { reason: "argument is not interpretable as logical".into() }),
    }
}

/// `aslogical_`'s permissive conversion: `NA`-propagating, used by the
/// three-valued `lgland_`/`lglor_` combinators.
fn to_logical(v: &Value) -> Result<Logical, RunError> {
    match v.strip_object() {
        Value::Logical(l) => Ok(*l),
        Value::Real(x) if x.is_nan() => Ok(Logical::Na),
        Value::Real(x) => Ok(Logical::from_bool(*x != 0.0)),
        Value::Int(x) => Ok(Logical::from_bool(*x != 0)),
        Value::Vector(data) => data
            .items
            .first()
            .map(to_logical)
            .transpose()?
            .ok_or_else(|| RunError::BadCondition { reason: "argument is of length zero".into() }),
        Value::Nil => Err(RunError::BadCondition { reason: "argument is of length zero".into() }),
        _ => Err(RunError::BadCondition { reason: "argument is not interpretable as logical".into() }),
    }
}

fn three_valued_and(a: Logical, b: Logical) -> Logical {
    match (a, b) {
        (Logical::False, _) | (_, Logical::False) => Logical::False,
        (Logical::True, Logical::True) => Logical::True,
        _ => Logical::Na,
    }
}

fn three_valued_or(a: Logical, b: Logical) -> Logical {
    match (a, b) {
        (Logical::True, _) | (_, Logical::True) => Logical::True,
        (Logical::False, Logical::False) => Logical::False,
        _ => Logical::Na,
    }
}

/// `extract1_`'s fast path: a plain 1-based numeric index into a `Vector`
/// or pairlist. Name-based/`[`-on-an-object subsetting takes the `brobj_`
/// side-exit before this is ever reached.
fn extract1(target: &Value, index: &Value) -> Result<Value, RunError> {
    let i = match index {
        Value::Real(x) => *x as i64,
        Value::Int(x) => i64::from(*x),
        _ => return Err(RunError::internal("extract1_ index must be numeric")),
    };
    let zero_based = i - 1;
    match target {
        Value::Vector(data) => {
            if zero_based < 0 || zero_based as usize >= data.items.len() {
                return Err(RunError::OutOfRange { index: i, len: data.items.len() });
            }
            Ok(data.items[zero_based as usize].clone())
        }
        Value::Nil | Value::Pair(_) => {
            let entries = pairlist_entries(target);
            if zero_based < 0 || zero_based as usize >= entries.len() {
                return Err(RunError::OutOfRange { index: i, len: entries.len() });
            }
            Ok(entries[zero_based as usize].1.clone())
        }
        _ => Err(RunError::internal("extract1_ target is not subsettable")),
    }
}

/// The bytecode interpreter. One `Vm` drives every nested call/promise/loop
/// `run` invocation within one top-level evaluation; `stack` and `frames`
/// are shared across all of them (§3: "the value stack and frame stack are
/// owned by the interpreter, not by any one invocation").
#[derive(Debug)]
pub struct Vm {
    pub stack: ValueStack,
    pub frames: CallStack,
    pub interns: Rc<RefCell<Interns>>,
    pub limits: Limits,
    pub dots_name: StringId,
    /// `invisible_`'s flag: whether the last top-level result should be
    /// auto-printed. The core does not print anything itself (§1
    /// Non-goals); this is just the bit an embedder's REPL would consult.
    pub visible: bool,
}

impl Vm {
    #[must_use]
    pub fn new(interns: Rc<RefCell<Interns>>, limits: Limits, dots_name: StringId) -> Self {
        let mut frames = CallStack::new();
        frames.push(CallFrame::top_level(0));
        Self { stack: ValueStack::new(), frames, interns, limits, dots_name, visible: true }
    }

    /// Runs `function`'s code object at `index` in `env`, until it returns
    /// (`ret_`) or a non-local transfer targeting one of *this invocation's
    /// own* frames is caught. Transfers targeting an ancestor invocation's
    /// frame propagate as `Err` (§5).
    pub fn run<H: HostRuntime>(
        &mut self,
        host: &H,
        function: &Rc<FunctionObject>,
        index: u32,
        env: &Rc<Environment>,
    ) -> Result<Value, RunError> {
        let my_base = self.frames.len();
        let code = function.code(index);
        self.stack.reserve(code.stack_depth + 5);
        let mut pc: usize = 0;
        loop {
            match self.exec_one(host, function, code, &mut pc, env) {
                Ok(None) => {}
                Ok(Some(v)) => return Ok(v),
                Err(RunError::Transfer { kind, value }) => match self.frames.find(kind) {
                    Some(idx) if idx >= my_base => {
                        let target = self.frames.unwind(kind).expect("find and unwind agree on the matching frame");
                        self.stack.truncate(target.stack_top_snapshot);
                        if matches!(kind, TransferKind::Return) {
                            self.stack.push(*value);
                        }
                        pc = target.resume_pc;
                    }
                    _ => {
                        self.frames.truncate_to(my_base);
                        return Err(RunError::Transfer { kind, value });
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Forces `promise`, memoizing the result (and idempotent once forced).
    /// A promise caught mid-force (`Forcing`) is a cyclic-default or
    /// self-referential-argument bug, surfaced as `RunError::Internal`.
    pub fn force_promise_value<H: HostRuntime>(&mut self, host: &H, promise: &Rc<Promise>) -> Result<Value, RunError> {
        if let Some(v) = promise.forced_value() {
            return Ok(v);
        }
        {
            let mut state = promise.state.borrow_mut();
            match &*state {
                PromiseState::Forcing => return Err(RunError::internal("cyclic promise forcing")),
                PromiseState::Forced(v) => return Ok(v.clone()),
                PromiseState::Unforced => *state = PromiseState::Forcing,
            }
        }
        let result = match &promise.body {
            PromiseBody::Code(code_ref) => self.run(host, &code_ref.function, code_ref.index, &promise.env),
            PromiseBody::Expr(v) => Ok(v.clone()),
        };
        match result {
            Ok(v) => {
                if let Value::Vector(data) = &v {
                    data.named.borrow_mut().raise(Named::Once);
                }
                *promise.state.borrow_mut() = PromiseState::Forced(v.clone());
                Ok(v)
            }
            Err(e) => {
                *promise.state.borrow_mut() = PromiseState::Unforced;
                Err(e)
            }
        }
    }

    fn force_if_promise<H: HostRuntime>(&mut self, host: &H, v: Value) -> Result<Value, RunError> {
        match v {
            Value::Promise(p) => self.force_promise_value(host, &p),
            other => Ok(other),
        }
    }

    /// Builds the lazy-argument pairlist for `call_`/`dispatch_`: each
    /// ordinary slot becomes a fresh promise over a nested code object,
    /// `DOTS_ARG_IDX` splices the caller's `...` binding in place, and
    /// `MISSING_ARG_IDX` forwards the missing-argument sentinel.
    fn build_promise_actuals(
        &self,
        function: &Rc<FunctionObject>,
        env: &Rc<Environment>,
        args_key: PoolKey,
        names_key: PoolKey,
    ) -> Result<ActualArgs, RunError> {
        let idx_values = walk_values(function.consts.get(args_key));
        let name_ids = names_entries(function, names_key);
        let mut actuals = ActualArgs::with_capacity(idx_values.len());
        for (i, idx_v) in idx_values.iter().enumerate() {
            let Value::Int(idx) = idx_v else {
                return Err(RunError::internal("call_ argument slot is not an index"));
            };
            let tag = name_ids.get(i).copied().flatten();
            match *idx {
                DOTS_ARG_IDX => {
                    let dots = env.find(self.dots_name).unwrap_or(Value::Nil);
                    actuals.extend(pairlist_entries(&dots));
                }
                MISSING_ARG_IDX => actuals.push((tag, Value::MissingArg)),
                code_idx => {
                    let index = u32::try_from(code_idx).map_err(|_| RunError::internal("bad call arg code index"))?;
                    let code_ref = CodeRef { function: Rc::clone(function), index };
                    let promise = Value::Promise(Rc::new(Promise::new(PromiseBody::Code(code_ref), Rc::clone(env))));
                    actuals.push((tag, promise));
                }
            }
        }
        Ok(actuals)
    }

    /// Applies `callee` to `actuals` (tag/value pairs already built by the
    /// caller — either fresh promises from `call_`/`dispatch_`, or the
    /// eagerly-evaluated values `call_stack_` popped off the operand
    /// stack). `resume_at` and the stack depth at entry become a
    /// `FunctionReturn` frame's unwind target for a closure call, exactly
    /// where normal, non-transfer completion would resume too.
    fn dispatch_callee<H: HostRuntime>(
        &mut self,
        host: &H,
        function: &Rc<FunctionObject>,
        callee: Value,
        actuals: ActualArgs,
        env: &Rc<Environment>,
        resume_at: usize,
        call_src: Value,
    ) -> Result<Value, RunError> {
        match callee {
            Value::Builtin(id) => {
                let mut forced = Vec::with_capacity(actuals.len());
                for (tag, v) in actuals {
                    forced.push((tag, self.force_if_promise(host, v)?));
                }
                host.call_builtin(self, id, make_pairlist(forced))
            }
            Value::Special(id) => {
                let call_ast =
                    if matches!(call_src, Value::Nil) { Value::lang_call(Value::Nil, make_pairlist(actuals)) } else { call_src };
                host.call_special(self, id, call_ast, env)
            }
            Value::Closure(closure) => {
                let args_value = make_pairlist(actuals);
                let child = host.match_formals(self, &closure, args_value.clone())?;
                let stack_top_snapshot = self.stack.len();
                self.frames.push(CallFrame::function_return(
                    resume_at,
                    stack_top_snapshot,
                    Rc::clone(&child),
                    Rc::clone(&closure),
                    args_value,
                    call_src,
                ));
                match self.run(host, &closure.body, 0, &child) {
                    Ok(v) => {
                        self.frames.pop();
                        Ok(v)
                    }
                    Err(e) => Err(e),
                }
            }
            other => Err(RunError::NonFunction { what: other.to_string() }),
        }
    }

    /// Decodes and executes exactly one instruction at `*pc`, advancing it.
    /// Returns `Ok(Some(v))` only for `ret_`, ending this `run` invocation;
    /// every other opcode returns `Ok(None)` and the caller keeps looping.
    fn exec_one<H: HostRuntime>(
        &mut self,
        host: &H,
        function: &Rc<FunctionObject>,
        code: &CodeObject,
        pc: &mut usize,
        env: &Rc<Environment>,
    ) -> Result<Option<Value>, RunError> {
        let op_start = *pc;
        let byte = code.ops[*pc];
        *pc += 1;
        let op = Opcode::from_repr(byte).ok_or_else(|| RunError::internal("bad opcode byte"))?;

        match op {
            Opcode::Push => {
                let key = PoolKey::new(read_u32(&code.ops, pc));
                let v = function.consts.get(key).clone();
                if let Value::Vector(data) = &v {
                    data.named.borrow_mut().raise(Named::Always);
                }
                self.stack.push(v);
            }
            Opcode::LdFun => {
                let key = PoolKey::new(read_u32(&code.ops, pc));
                let Value::Symbol(id) = function.consts.get(key) else {
                    return Err(RunError::internal("ldfun_ operand is not a symbol"));
                };
                let id = *id;
                let v = env
                    .find_function(id)
                    .ok_or_else(|| RunError::UnboundVariable { name: self.interns.borrow().get(id).to_string() })?;
                self.stack.push(v);
            }
            Opcode::LdVar => {
                let key = PoolKey::new(read_u32(&code.ops, pc));
                let Value::Symbol(id) = function.consts.get(key) else {
                    return Err(RunError::internal("ldvar_ operand is not a symbol"));
                };
                let id = *id;
                let v = env.find(id).ok_or_else(|| RunError::UnboundVariable { name: self.interns.borrow().get(id).to_string() })?;
                if matches!(v, Value::MissingArg) {
                    return Err(RunError::MissingArgument { name: self.interns.borrow().get(id).to_string() });
                }
                let v = self.force_if_promise(host, v)?;
                self.stack.push(v);
            }
            Opcode::LdDdVar => {
                let n = read_i32(&code.ops, pc);
                let v = env
                    .find_dots_nth(self.dots_name, n as usize)
                    .ok_or_else(|| RunError::MissingArgument { name: format!("..{n}") })?;
                let v = self.force_if_promise(host, v)?;
                self.stack.push(v);
            }
            Opcode::PushCode => {
                let idx = read_u32(&code.ops, pc);
                self.stack.push(Value::Code(CodeRef { function: Rc::clone(function), index: idx }));
            }
            Opcode::Promise => {
                let idx = read_u32(&code.ops, pc);
                let body = PromiseBody::Code(CodeRef { function: Rc::clone(function), index: idx });
                self.stack.push(Value::Promise(Rc::new(Promise::new(body, Rc::clone(env)))));
            }
            Opcode::Force => {
                let v = self.stack.pop();
                let v = self.force_if_promise(host, v)?;
                self.stack.push(v);
            }
            Opcode::Call => {
                let args_key = PoolKey::new(read_u32(&code.ops, pc));
                let names_key = PoolKey::new(read_u32(&code.ops, pc));
                let callee = self.stack.pop();
                let actuals = self.build_promise_actuals(function, env, args_key, names_key)?;
                let call_src = source_for(function, code, op_start);
                let resume_at = *pc;
                let result = self.dispatch_callee(host, function, callee, actuals, env, resume_at, call_src)?;
                self.stack.push(result);
            }
            Opcode::CallStack => {
                let n = read_u32(&code.ops, pc) as usize;
                let names_key = PoolKey::new(read_u32(&code.ops, pc));
                let mut values = Vec::with_capacity(n);
                for _ in 0..n {
                    values.push(self.stack.pop());
                }
                values.reverse();
                let callee = self.stack.pop();
                let name_ids = names_entries(function, names_key);
                let actuals: ActualArgs =
                    values.into_iter().enumerate().map(|(i, v)| (name_ids.get(i).copied().flatten(), v)).collect();
                let call_src = source_for(function, code, op_start);
                let resume_at = *pc;
                let result = self.dispatch_callee(host, function, callee, actuals, env, resume_at, call_src)?;
                self.stack.push(result);
            }
            Opcode::Dispatch => {
                let args_key = PoolKey::new(read_u32(&code.ops, pc));
                let names_key = PoolKey::new(read_u32(&code.ops, pc));
                let sel_key = PoolKey::new(read_u32(&code.ops, pc));
                let Value::Symbol(selector) = function.consts.get(sel_key) else {
                    return Err(RunError::internal("dispatch_ selector is not a symbol"));
                };
                let selector = *selector;
                let default_callee = self.stack.pop();
                let actuals = self.build_promise_actuals(function, env, args_key, names_key)?;
                let call_src = source_for(function, code, op_start);
                let first = actuals.first().map(|(_, v)| v.clone()).unwrap_or(Value::Nil);
                let obj = self.force_if_promise(host, first)?;
                let method = if host.has_s4_methods(selector) { host.s4_dispatch(self, selector, &obj, env)? } else { None };
                let method = match method {
                    Some(m) => Some(m),
                    None => host.usemethod(self, selector, &obj, env)?,
                };
                let callee = method.unwrap_or(default_callee);
                let resume_at = *pc;
                let result = self.dispatch_callee(host, function, callee, actuals, env, resume_at, call_src)?;
                self.stack.push(result);
            }
            Opcode::Br => {
                let target = read_jump_target(code, pc);
                *pc = target;
            }
            Opcode::BrTrue => {
                let target = read_jump_target(code, pc);
                let v = self.stack.pop();
                if logical_strict(&v)? {
                    *pc = target;
                }
            }
            Opcode::BrFalse => {
                let target = read_jump_target(code, pc);
                let v = self.stack.pop();
                if !logical_strict(&v)? {
                    *pc = target;
                }
            }
            Opcode::BrObj => {
                let target = read_jump_target(code, pc);
                if self.stack.peek(0).is_object() {
                    *pc = target;
                }
            }
            Opcode::BeginLoop => {
                let target = read_jump_target(code, pc);
                let saved_pc = *pc;
                self.frames.push(CallFrame::loop_frame(target, saved_pc, self.stack.len()));
            }
            Opcode::EndContext => {
                self.frames.pop();
            }
            Opcode::Ret => {
                let v = self.stack.pop();
                return Ok(Some(v));
            }
            Opcode::Pop => {
                self.stack.pop();
            }
            Opcode::Dup => self.stack.dup(),
            Opcode::Dup2 => self.stack.dup2(),
            Opcode::Swap => self.stack.swap(),
            Opcode::Pick => {
                let n = read_u32(&code.ops, pc) as usize;
                self.stack.pick(n);
            }
            Opcode::Put => {
                let n = read_u32(&code.ops, pc) as usize;
                self.stack.put(n);
            }
            Opcode::AsBool => {
                let v = self.stack.pop();
                self.stack.push(Value::Logical(Logical::from_bool(logical_strict(&v)?)));
            }
            Opcode::AsLogical => {
                let v = self.stack.pop();
                self.stack.push(Value::Logical(to_logical(&v)?));
            }
            Opcode::LglAnd => {
                let b = self.stack.pop();
                let a = self.stack.pop();
                let (Value::Logical(a), Value::Logical(b)) = (a, b) else {
                    return Err(RunError::internal("lgland_ operands must already be logical"));
                };
                self.stack.push(Value::Logical(three_valued_and(a, b)));
            }
            Opcode::LglOr => {
                let b = self.stack.pop();
                let a = self.stack.pop();
                let (Value::Logical(a), Value::Logical(b)) = (a, b) else {
                    return Err(RunError::internal("lglor_ operands must already be logical"));
                };
                self.stack.push(Value::Logical(three_valued_or(a, b)));
            }
            Opcode::Is => {
                let tag_raw = read_i32(&code.ops, pc);
                let tag = match tag_raw {
                    0 => TypeTag::Nil,
                    1 => TypeTag::Vec,
                    2 => TypeTag::List,
                    _ => return Err(RunError::internal("bad type tag operand")),
                };
                let v = self.stack.pop();
                self.stack.push(Value::Logical(Logical::from_bool(tag.matches(&v))));
            }
            Opcode::StVar => {
                let key = PoolKey::new(read_u32(&code.ops, pc));
                let Value::Symbol(id) = function.consts.get(key) else {
                    return Err(RunError::internal("stvar_ operand is not a symbol"));
                };
                let id = *id;
                let v = self.stack.pop();
                if let Value::Vector(data) = &v {
                    data.named.borrow_mut().raise(Named::Once);
                }
                env.define(id, v);
            }
            Opcode::Lt => {
                let b = self.stack.pop();
                let a = self.stack.pop();
                match (a.as_scalar_real(), b.as_scalar_real()) {
                    (Some(x), Some(y)) => self.stack.push(Value::Logical(Logical::from_bool(x < y))),
                    _ => {
                        let r = host.fallback_lt(self, a, b)?;
                        self.stack.push(r);
                    }
                }
            }
            Opcode::Add => {
                let b = self.stack.pop();
                let a = self.stack.pop();
                match (a.as_scalar_real(), b.as_scalar_real()) {
                    (Some(x), Some(y)) => self.stack.push(Value::Real(x + y)),
                    _ => {
                        let r = host.fallback_add(self, a, b)?;
                        self.stack.push(r);
                    }
                }
            }
            Opcode::Sub => {
                let b = self.stack.pop();
                let a = self.stack.pop();
                match (a.as_scalar_real(), b.as_scalar_real()) {
                    (Some(x), Some(y)) => self.stack.push(Value::Real(x - y)),
                    _ => {
                        let r = host.fallback_sub(self, a, b)?;
                        self.stack.push(r);
                    }
                }
            }
            Opcode::Inc => match self.stack.peek_mut(0) {
                Value::Real(x) => *x += 1.0,
                _ => return Err(RunError::internal("inc_ target is not a real")),
            },
            Opcode::Extract1 => {
                let index_v = self.stack.pop();
                let target_v = self.stack.pop();
                let result = extract1(&target_v, &index_v)?;
                self.stack.push(result);
            }
            Opcode::Subset1 => {
                let index_v = self.stack.pop();
                let target_v = self.stack.pop();
                let item = extract1(&target_v, &index_v)?;
                self.stack.push(Value::vector(vec![item], vec![None]));
            }
            Opcode::Invisible => self.visible = false,
            Opcode::Uniq => {
                let top = self.stack.pop();
                let shared = matches!(&top, Value::Vector(data) if *data.named.borrow() > Named::Temporary);
                let out = if shared { host.shallow_duplicate(&top) } else { top };
                self.stack.push(out);
            }
            Opcode::AsAst => {
                let top = self.stack.pop();
                let Value::Code(code_ref) = top else {
                    return Err(RunError::internal("asast_ operand is not a code reference"));
                };
                let target = code_ref.function.code(code_ref.index);
                let ast = code_ref.function.source.get(target.src_index).cloned().unwrap_or(Value::Nil);
                self.stack.push(ast);
            }
            Opcode::IsFun => {
                if !self.stack.peek(0).is_callable() {
                    return Err(RunError::NonFunction { what: self.stack.peek(0).to_string() });
                }
            }
            Opcode::IsSpecial => {
                let key = PoolKey::new(read_u32(&code.ops, pc));
                let Value::Symbol(id) = function.consts.get(key) else {
                    return Err(RunError::internal("isspecial_ operand is not a symbol"));
                };
                let id = *id;
                match env.find(id) {
                    Some(v) if v.is_special() || v.is_builtin() => {}
                    Some(_) => host.warn(&format!(
                        "'{}' has been redefined; continuing with the compiled fast path",
                        self.interns.borrow().get(id)
                    )),
                    None => return Err(RunError::internal("isspecial_ target is unbound")),
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bytecode::{builder::CodeBuilder, code::CodeObject},
        host::reference::ReferenceHost,
        pool::{ConstPool, SourcePool},
    };

    fn new_interns() -> Rc<RefCell<Interns>> {
        Rc::new(RefCell::new(Interns::new()))
    }

    #[test]
    fn runs_a_literal_push_and_return() {
        let interns = new_interns();
        let dots_name = interns.borrow_mut().intern("...");
        let mut consts = ConstPool::new();
        let k = consts.intern(Value::Real(42.0));
        let mut b = CodeBuilder::new();
        b.emit_pool(Opcode::Push, k);
        b.emit(Opcode::Ret);
        let entry = b.build(PoolKey::NONE);
        let function = Rc::new(FunctionObject::new(entry, consts, SourcePool::new()));

        let mut vm = Vm::new(Rc::clone(&interns), Limits::default(), dots_name);
        let host = ReferenceHost::new();
        let env = Environment::new_base();
        let result = vm.run(&host, &function, 0, &env).unwrap();
        assert!(matches!(result, Value::Real(x) if x == 42.0));
    }

    #[test]
    fn fast_path_add_avoids_host_fallback() {
        let interns = new_interns();
        let dots_name = interns.borrow_mut().intern("...");
        let mut consts = ConstPool::new();
        let a = consts.intern(Value::Real(1.0));
        let c = consts.intern(Value::Real(2.0));
        let mut b = CodeBuilder::new();
        b.emit_pool(Opcode::Push, a);
        b.emit_pool(Opcode::Push, c);
        b.emit(Opcode::Add);
        b.emit(Opcode::Ret);
        let entry = b.build(PoolKey::NONE);
        let function = Rc::new(FunctionObject::new(entry, consts, SourcePool::new()));

        let mut vm = Vm::new(Rc::clone(&interns), Limits::default(), dots_name);
        let host = ReferenceHost::new();
        let env = Environment::new_base();
        let result = vm.run(&host, &function, 0, &env).unwrap();
        assert!(matches!(result, Value::Real(x) if x == 3.0));
    }

    #[test]
    fn stvar_then_ldvar_round_trips_through_environment() {
        let interns = new_interns();
        let dots_name = interns.borrow_mut().intern("...");
        let x = interns.borrow_mut().intern("x");
        let mut consts = ConstPool::new();
        let sym = consts.intern(Value::Symbol(x));
        let lit = consts.intern(Value::Real(9.0));
        let mut b = CodeBuilder::new();
        b.emit_pool(Opcode::Push, lit);
        b.emit_pool(Opcode::StVar, sym);
        b.emit_pool(Opcode::LdVar, sym);
        b.emit(Opcode::Ret);
        let entry = b.build(PoolKey::NONE);
        let function = Rc::new(FunctionObject::new(entry, consts, SourcePool::new()));

        let mut vm = Vm::new(Rc::clone(&interns), Limits::default(), dots_name);
        let host = ReferenceHost::new();
        let env = Environment::new_base();
        let result = vm.run(&host, &function, 0, &env).unwrap();
        assert!(matches!(result, Value::Real(v) if v == 9.0));
    }

    #[test]
    fn unbound_variable_surfaces_as_run_error() {
        let interns = new_interns();
        let dots_name = interns.borrow_mut().intern("...");
        let missing = interns.borrow_mut().intern("nope");
        let mut consts = ConstPool::new();
        let sym = consts.intern(Value::Symbol(missing));
        let mut b = CodeBuilder::new();
        b.emit_pool(Opcode::LdVar, sym);
        b.emit(Opcode::Ret);
        let entry = b.build(PoolKey::NONE);
        let function = Rc::new(FunctionObject::new(entry, consts, SourcePool::new()));

        let mut vm = Vm::new(Rc::clone(&interns), Limits::default(), dots_name);
        let host = ReferenceHost::new();
        let env = Environment::new_base();
        let err = vm.run(&host, &function, 0, &env).unwrap_err();
        assert!(matches!(err, RunError::UnboundVariable { name } if name == "nope"));
    }

    #[test]
    fn break_inside_beginloop_unwinds_to_post_loop_target() {
        // while (TRUE) { break }; 5
        let interns = new_interns();
        let dots_name = interns.borrow_mut().intern("...");
        let brk = interns.borrow_mut().intern("break");
        let mut consts = ConstPool::new();
        let brk_sym = consts.intern(Value::Symbol(brk));
        let call_args = consts.intern(Value::Nil);
        let call_names = consts.intern(Value::Nil);
        let five = consts.intern(Value::Real(5.0));

        let mut b = CodeBuilder::new();
        let begin = b.emit_jump(Opcode::BeginLoop);
        b.emit_pool(Opcode::LdFun, brk_sym);
        b.emit_call(call_args, call_names);
        b.emit(Opcode::Pop);
        b.emit_jump_to(Opcode::Br, 0);
        b.patch_jump(begin);
        b.emit(Opcode::EndContext);
        b.emit_pool(Opcode::Push, five);
        b.emit(Opcode::Ret);
        let entry = b.build(PoolKey::NONE);
        let function = Rc::new(FunctionObject::new(entry, consts, SourcePool::new()));

        let mut vm = Vm::new(Rc::clone(&interns), Limits::default(), dots_name);
        let host = ReferenceHost::new();
        let env = Environment::new_base();
        host.install_base(&env, &mut interns.borrow_mut());
        let result = vm.run(&host, &function, 0, &env).unwrap();
        assert!(matches!(result, Value::Real(x) if x == 5.0));
        assert_eq!(vm.frames.len(), 1);
    }
}
