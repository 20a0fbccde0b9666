//! A minimal concrete `HostRuntime` so this crate's own tests can compile
//! and run programs end to end without an embedder.
//!
//! Not a primitive-function library in any serious sense (§1 Non-goals
//! explicitly excludes one) — just enough arithmetic, list/vector
//! manipulation, printing, and S3 method lookup to exercise every opcode the
//! compiler emits.

use std::{cell::RefCell, fmt::Write as _, rc::Rc};

use ahash::AHashMap;

use crate::{
    bytecode::Vm,
    env::{make_pairlist, Environment},
    error::RunError,
    intern::{Interns, StringId},
    value::{BuiltinId, Closure, Logical, ObjectData, SpecialId, Value},
};

// --- builtin ids ---
pub const LENGTH: BuiltinId = BuiltinId(0);
pub const EXTRACT: BuiltinId = BuiltinId(1);
pub const COMBINE: BuiltinId = BuiltinId(2);
pub const LIST: BuiltinId = BuiltinId(3);
pub const PRINT: BuiltinId = BuiltinId(4);
pub const STOP: BuiltinId = BuiltinId(5);
pub const CLASS_SET: BuiltinId = BuiltinId(6);
pub const INHERITS: BuiltinId = BuiltinId(7);
pub const LT: BuiltinId = BuiltinId(8);
pub const ADD: BuiltinId = BuiltinId(9);
pub const SUB: BuiltinId = BuiltinId(10);
pub const DOLLAR_SET: BuiltinId = BuiltinId(11);
pub const PASTE: BuiltinId = BuiltinId(12);

// --- special ids ---
pub const SPECIAL_BREAK: SpecialId = SpecialId(0);
pub const SPECIAL_NEXT: SpecialId = SpecialId(1);
pub const SPECIAL_RETURN: SpecialId = SpecialId(2);
/// `for`'s per-loop `seq_along`-equivalent (§4.2.1): takes the iterated
/// sequence, returns its length as a scalar real.
pub const SPECIAL_FOR_SEQ_ALONG: SpecialId = SpecialId(3);
/// `for`'s per-iteration element accessor: takes the sequence and a
/// 1-based scalar real index, returns the element at that position.
pub const SPECIAL_FOR_ELT: SpecialId = SpecialId(4);

/// A minimal host: arithmetic/list/print builtins, `break`/`next`/`return`
/// specials, and an S3 method table keyed by `"generic.class"`.
#[derive(Debug, Default)]
pub struct ReferenceHost {
    methods: RefCell<AHashMap<StringId, Value>>,
}

impl ReferenceHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds every builtin/special name this host recognizes into `env`,
    /// interning names as needed. Call once against the base environment
    /// before compiling/running anything.
    pub fn install_base(&self, env: &Rc<Environment>, interns: &mut Interns) {
        let mut bind = |name: &str, value: Value| env.define(interns.intern(name), value);
        bind("length", Value::Builtin(LENGTH));
        bind("seq_along", Value::Builtin(LENGTH));
        bind("[[", Value::Builtin(EXTRACT));
        bind("c", Value::Builtin(COMBINE));
        bind("list", Value::Builtin(LIST));
        bind("print", Value::Builtin(PRINT));
        bind("stop", Value::Builtin(STOP));
        bind("class<-", Value::Builtin(CLASS_SET));
        bind("inherits", Value::Builtin(INHERITS));
        bind("<", Value::Builtin(LT));
        bind("+", Value::Builtin(ADD));
        bind("-", Value::Builtin(SUB));
        bind("$<-", Value::Builtin(DOLLAR_SET));
        bind("paste", Value::Builtin(PASTE));
        bind("break", Value::Special(SPECIAL_BREAK));
        bind("next", Value::Special(SPECIAL_NEXT));
        bind("return", Value::Special(SPECIAL_RETURN));
        bind("..for_seq_along..", Value::Special(SPECIAL_FOR_SEQ_ALONG));
        bind("..for_elt..", Value::Special(SPECIAL_FOR_ELT));
    }

    /// Registers an S3 method under `"{selector}.{class}"` (or
    /// `"{selector}.default"` if `class` is `None`), for `usemethod` to find.
    pub fn register_method(&self, interns: &mut Interns, selector: &str, class: Option<&str>, method: Value) {
        let name = match class {
            Some(c) => format!("{selector}.{c}"),
            None => format!("{selector}.default"),
        };
        let id = interns.intern(&name);
        self.methods.borrow_mut().insert(id, method);
    }
}

/// Pulls the `n`-th positional actual out of a call AST's argument list,
/// forcing it if it arrived as a promise. Used by the `for`-loop specials,
/// which (like `return`) receive their arguments unevaluated.
fn forced_call_arg(vm: &mut Vm, host: &ReferenceHost, call_ast: &Value, n: usize) -> Result<Value, RunError> {
    let entries = match call_ast {
        Value::LangCall(cell) => pairlist_values(&cell.borrow().cdr),
        _ => Vec::new(),
    };
    match entries.into_iter().nth(n) {
        Some((_, Value::Promise(p))) => vm.force_promise_value(host, &p),
        Some((_, v)) => Ok(v),
        None => Err(RunError::internal("for-loop special called with too few arguments")),
    }
}

fn pairlist_values(args: &Value) -> Vec<(Option<StringId>, Value)> {
    let mut out = Vec::new();
    let mut cur = args.clone();
    loop {
        match cur {
            Value::Pair(cell) => {
                let cons = cell.borrow();
                out.push((cons.tag, cons.car.clone()));
                cur = cons.cdr.clone();
            }
            _ => break,
        }
    }
    out
}

fn as_f64(v: &Value) -> Option<f64> {
    match v.strip_object() {
        Value::Real(x) => Some(*x),
        Value::Int(x) => Some(f64::from(*x)),
        Value::Logical(Logical::True) => Some(1.0),
        Value::Logical(Logical::False) => Some(0.0),
        _ => None,
    }
}

fn display_value(v: &Value, interns: &Interns) -> String {
    match v {
        Value::Str(s) => s.to_string(),
        Value::Symbol(id) => interns.get(*id).to_string(),
        other => other.to_string(),
    }
}

fn value_length(v: &Value) -> usize {
    match v.strip_object() {
        Value::Nil => 0,
        Value::Vector(data) => data.items.len(),
        Value::Pair(_) => pairlist_values(v).len(),
        _ => 1,
    }
}

fn index_into(target: &Value, index: &Value, interns: &Interns) -> Result<Value, RunError> {
    let base = target.strip_object();
    match base {
        Value::Vector(data) => {
            if let Value::Str(s) = index {
                let name_id = interns.lookup(s).ok_or_else(|| RunError::OutOfRange { index: -1, len: data.items.len() })?;
                return data
                    .name_index(name_id)
                    .map(|i| data.items[i].clone())
                    .ok_or(RunError::OutOfRange { index: -1, len: data.items.len() });
            }
            let i = as_f64(index).ok_or_else(|| RunError::internal("non-numeric index"))? as i64;
            let zero_based = i - 1;
            if zero_based < 0 || zero_based as usize >= data.items.len() {
                return Err(RunError::OutOfRange { index: i, len: data.items.len() });
            }
            Ok(data.items[zero_based as usize].clone())
        }
        Value::Pair(_) | Value::Nil => {
            let entries = pairlist_values(base);
            let i = as_f64(index).ok_or_else(|| RunError::internal("non-numeric index"))? as i64;
            let zero_based = i - 1;
            if zero_based < 0 || zero_based as usize >= entries.len() {
                return Err(RunError::OutOfRange { index: i, len: entries.len() });
            }
            Ok(entries[zero_based as usize].1.clone())
        }
        _ => Err(RunError::NonFunction { what: "not subsettable".into() }),
    }
}

impl super::HostRuntime for ReferenceHost {
    fn call_builtin(&self, vm: &mut Vm, id: BuiltinId, args: Value) -> Result<Value, RunError> {
        let entries = pairlist_values(&args);
        match id {
            LENGTH => {
                let v = entries.first().map_or(&Value::Nil, |(_, v)| v);
                Ok(Value::Real(value_length(v) as f64))
            }
            EXTRACT => {
                if entries.len() < 2 {
                    return Err(RunError::internal("`[[` needs a target and an index"));
                }
                let interns = vm.interns.clone();
                let interns = interns.borrow();
                index_into(&entries[0].1, &entries[1].1, &interns)
            }
            COMBINE => {
                let mut items = Vec::new();
                let mut names = Vec::new();
                for (tag, v) in entries {
                    match v {
                        Value::Vector(data) => {
                            for (item, name) in data.items.iter().cloned().zip(data.names.iter().copied()) {
                                items.push(item);
                                names.push(name);
                            }
                        }
                        other => {
                            items.push(other);
                            names.push(tag);
                        }
                    }
                }
                Ok(Value::vector(items, names))
            }
            LIST => {
                let (items, names): (Vec<_>, Vec<_>) = entries.into_iter().map(|(t, v)| (v, t)).unzip();
                Ok(Value::vector(items, names))
            }
            PRINT => {
                let interns = vm.interns.clone();
                let interns = interns.borrow();
                if let Some((_, v)) = entries.first() {
                    println!("{}", display_value(v, &interns));
                }
                Ok(Value::Nil)
            }
            STOP => {
                let interns = vm.interns.clone();
                let interns = interns.borrow();
                let mut message = String::new();
                for (_, v) in &entries {
                    let _ = write!(message, "{}", display_value(v, &interns));
                }
                Err(RunError::BadCondition { reason: message })
            }
            CLASS_SET => {
                let base = entries.first().map(|(_, v)| v.clone()).unwrap_or(Value::Nil);
                let class_value = entries.get(1).map(|(_, v)| v.clone()).unwrap_or(Value::Nil);
                let interns = vm.interns.clone();
                let mut interns = interns.borrow_mut();
                let class = match class_value {
                    Value::Vector(data) => data
                        .items
                        .iter()
                        .filter_map(|v| if let Value::Str(s) = v { Some(interns.intern(s)) } else { None })
                        .collect(),
                    Value::Str(s) => vec![interns.intern(&s)],
                    _ => Vec::new(),
                };
                Ok(Value::Object(Rc::new(ObjectData { base: base.strip_object().clone(), class, is_s4: false })))
            }
            INHERITS => {
                let obj = entries.first().map(|(_, v)| v.clone()).unwrap_or(Value::Nil);
                let what = entries.get(1).map(|(_, v)| v.clone()).unwrap_or(Value::Nil);
                let interns = vm.interns.clone();
                let mut interns = interns.borrow_mut();
                let target = match &what {
                    Value::Str(s) => Some(interns.intern(s)),
                    _ => None,
                };
                let found = match (obj.class(), target) {
                    (Some(classes), Some(t)) => classes.contains(&t),
                    _ => false,
                };
                Ok(Value::Logical(Logical::from_bool(found)))
            }
            LT => {
                let a = entries.first().map(|(_, v)| v.clone()).unwrap_or(Value::Nil);
                let b = entries.get(1).map(|(_, v)| v.clone()).unwrap_or(Value::Nil);
                self.fallback_lt(vm, a, b)
            }
            ADD => {
                let a = entries.first().map(|(_, v)| v.clone()).unwrap_or(Value::Nil);
                let b = entries.get(1).map(|(_, v)| v.clone()).unwrap_or(Value::Nil);
                self.fallback_add(vm, a, b)
            }
            SUB => {
                let a = entries.first().map(|(_, v)| v.clone()).unwrap_or(Value::Nil);
                let b = entries.get(1).map(|(_, v)| v.clone()).unwrap_or(Value::Nil);
                self.fallback_sub(vm, a, b)
            }
            DOLLAR_SET => {
                let target = entries.first().map(|(_, v)| v.clone()).unwrap_or(Value::Nil);
                let name = entries.get(1).map(|(_, v)| v.clone()).unwrap_or(Value::Nil);
                let value = entries.get(2).map(|(_, v)| v.clone()).unwrap_or(Value::Nil);
                let interns = vm.interns.clone();
                let mut interns = interns.borrow_mut();
                let Value::Str(name) = name else {
                    return Err(RunError::internal("`$<-` needs a string name"));
                };
                let name_id = interns.intern(&name);
                let data = match target.strip_object() {
                    Value::Vector(data) => data.clone(),
                    _ => Rc::new(crate::value::VectorData::new(Vec::new(), Vec::new())),
                };
                let mut items = data.items.clone();
                let mut names = data.names.clone();
                match data.name_index(name_id) {
                    Some(i) => items[i] = value,
                    None => {
                        items.push(value);
                        names.push(Some(name_id));
                    }
                }
                Ok(Value::vector(items, names))
            }
            PASTE => {
                let interns = vm.interns.clone();
                let interns = interns.borrow();
                let parts: Vec<String> = entries.iter().map(|(_, v)| display_value(v, &interns)).collect();
                Ok(Value::str(parts.join(" ")))
            }
            _ => Err(RunError::internal("unknown builtin id")),
        }
    }

    fn call_special(&self, vm: &mut Vm, id: SpecialId, call_ast: Value, _env: &Rc<Environment>) -> Result<Value, RunError> {
        match id {
            SPECIAL_BREAK => Err(RunError::Transfer { kind: crate::error::TransferKind::Break, value: Box::new(Value::Nil) }),
            SPECIAL_NEXT => Err(RunError::Transfer { kind: crate::error::TransferKind::Next, value: Box::new(Value::Nil) }),
            SPECIAL_RETURN => {
                let entries = match &call_ast {
                    Value::LangCall(cell) => pairlist_values(&cell.borrow().cdr),
                    _ => Vec::new(),
                };
                let value = match entries.into_iter().next() {
                    Some((_, Value::Promise(p))) => vm.force_promise_value(self, &p)?,
                    Some((_, v)) => v,
                    None => Value::Nil,
                };
                Err(RunError::Transfer { kind: crate::error::TransferKind::Return, value: Box::new(value) })
            }
            SPECIAL_FOR_SEQ_ALONG => {
                let seq = forced_call_arg(vm, self, &call_ast, 0)?;
                Ok(Value::Real(value_length(&seq) as f64))
            }
            SPECIAL_FOR_ELT => {
                let seq = forced_call_arg(vm, self, &call_ast, 0)?;
                let index = forced_call_arg(vm, self, &call_ast, 1)?;
                let interns = vm.interns.clone();
                let interns = interns.borrow();
                index_into(&seq, &index, &interns)
            }
            _ => Err(RunError::internal("unknown special id")),
        }
    }

    fn match_formals(&self, vm: &mut Vm, closure: &Rc<Closure>, args: Value) -> Result<Rc<Environment>, RunError> {
        let child = Environment::new_child(&closure.env, vm.limits.max_recursion_depth)
            .map_err(|_| RunError::internal("recursion limit exceeded"))?;
        let mut actuals = pairlist_values(&args);
        let dots_id = vm.dots_name;

        for formal in &closure.formals {
            if formal.name == dots_id {
                continue;
            }
            let by_name = actuals.iter().position(|(tag, _)| *tag == Some(formal.name));
            let value = if let Some(i) = by_name {
                actuals.remove(i).1
            } else if !actuals.is_empty() && actuals.iter().all(|(t, _)| t.is_none()) {
                actuals.remove(0).1
            } else {
                match formal.default_code {
                    Some(idx) => Value::Promise(Rc::new(crate::value::Promise::new(
                        crate::value::PromiseBody::Code(crate::value::CodeRef { function: Rc::clone(&closure.body), index: idx }),
                        Rc::clone(&child),
                    ))),
                    None => Value::MissingArg,
                }
            };
            child.define(formal.name, value);
        }
        if closure.formals.iter().any(|f| f.name == dots_id) {
            child.define(dots_id, make_pairlist(actuals));
        }
        Ok(child)
    }

    fn apply_closure(&self, vm: &mut Vm, closure: &Rc<Closure>, args: Value, _env: &Rc<Environment>) -> Result<Value, RunError> {
        let child = self.match_formals(vm, closure, args)?;
        vm.run(self, &closure.body, 0, &child)
    }

    fn usemethod(&self, vm: &mut Vm, selector: StringId, obj: &Value, _env: &Rc<Environment>) -> Result<Option<Value>, RunError> {
        let interns = vm.interns.clone();
        let selector_name = interns.borrow().get(selector).to_string();
        if let Some(classes) = obj.class() {
            for class in classes {
                let name = format!("{selector_name}.{}", interns.borrow().get(*class));
                if let Some(id) = interns.borrow().lookup(&name) {
                    if let Some(method) = self.methods.borrow().get(&id) {
                        return Ok(Some(method.clone()));
                    }
                }
            }
        }
        let default_name = format!("{selector_name}.default");
        if let Some(id) = interns.borrow().lookup(&default_name) {
            if let Some(method) = self.methods.borrow().get(&id) {
                return Ok(Some(method.clone()));
            }
        }
        Ok(None)
    }

    fn s4_dispatch(&self, _vm: &mut Vm, _selector: StringId, _obj: &Value, _env: &Rc<Environment>) -> Result<Option<Value>, RunError> {
        Ok(None)
    }

    fn has_s4_methods(&self, _selector: StringId) -> bool {
        false
    }

    fn shallow_duplicate(&self, value: &Value) -> Value {
        match value {
            Value::Vector(data) => Value::vector(data.items.clone(), data.names.clone()),
            other => other.clone(),
        }
    }

    fn fallback_lt(&self, _vm: &mut Vm, a: Value, b: Value) -> Result<Value, RunError> {
        match (a.strip_object(), b.strip_object()) {
            (Value::Str(x), Value::Str(y)) => Ok(Value::Logical(Logical::from_bool(x < y))),
            (a, b) => match (as_f64(a), as_f64(b)) {
                (Some(x), Some(y)) => Ok(Value::Logical(Logical::from_bool(x < y))),
                _ => Err(RunError::internal("comparison of non-numeric, non-string values")),
            },
        }
    }

    fn fallback_add(&self, _vm: &mut Vm, a: Value, b: Value) -> Result<Value, RunError> {
        match (as_f64(a.strip_object()), as_f64(b.strip_object())) {
            (Some(x), Some(y)) => Ok(Value::Real(x + y)),
            _ => Err(RunError::internal("non-numeric argument to binary operator")),
        }
    }

    fn fallback_sub(&self, _vm: &mut Vm, a: Value, b: Value) -> Result<Value, RunError> {
        match (as_f64(a.strip_object()), as_f64(b.strip_object())) {
            (Some(x), Some(y)) => Ok(Value::Real(x - y)),
            _ => Err(RunError::internal("non-numeric argument to binary operator")),
        }
    }

    fn warn(&self, message: &str) {
        eprintln!("Warning message:\n{message}");
    }
}
