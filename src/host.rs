//! `HostRuntime`: the external-collaborator boundary (§6 "Host runtime
//! contract (consumed)").
//!
//! This core ships bytecode compilation and the VM loop; the primitive
//! function library, the garbage collector, and the reader/parser are all
//! out of scope (§1 Non-goals) and are the embedder's job. Everything the VM
//! needs from that embedder is named here as a trait method instead of a
//! hardcoded call, mirroring how `ouros::bytecode::vm::call` leans on
//! `Builtins`/`BuiltinsFunctions`/`ModuleFunctions` tables it doesn't itself
//! define. The `reference` submodule is a minimal concrete implementation so
//! this crate's own tests can drive the compiler and VM end-to-end without an
//! embedder.

use std::rc::Rc;

use crate::{
    bytecode::Vm,
    env::Environment,
    error::RunError,
    intern::StringId,
    value::{BuiltinId, Closure, SpecialId, Value},
};

/// Everything the VM defers to an embedder for (§6).
pub trait HostRuntime {
    /// Invokes a builtin with an already-evaluated argument pairlist
    /// (`(tag, value)` cons chain, `Value::Nil` terminated).
    fn call_builtin(&self, vm: &mut Vm, id: BuiltinId, args: Value) -> Result<Value, RunError>;

    /// Invokes a special with the unevaluated call AST; the special decides
    /// what (if anything) to force, typically via `vm.eval_promise_body`.
    fn call_special(&self, vm: &mut Vm, id: SpecialId, call_ast: Value, env: &Rc<Environment>) -> Result<Value, RunError>;

    /// Binds `args` (a promise pairlist) against `closure`'s formals,
    /// returning the child environment the closure body runs in. Unbound
    /// formals with a default get a promise referencing the default's code
    /// index, evaluated in the *returned* environment so later defaults can
    /// see earlier parameters.
    fn match_formals(&self, vm: &mut Vm, closure: &Rc<Closure>, args: Value) -> Result<Rc<Environment>, RunError>;

    /// Fallback closure-application path for a closure the VM did not itself
    /// construct via `match_formals` + `Vm::run` (kept for host embeddings
    /// that allocate closures outside this core's own compiler; this core's
    /// own call protocol never needs it).
    fn apply_closure(&self, vm: &mut Vm, closure: &Rc<Closure>, args: Value, env: &Rc<Environment>) -> Result<Value, RunError>;

    /// S3 method lookup for `UseMethod`-equivalent dispatch (`dispatch_`'s
    /// first step). `Ok(None)` means no S3 method matched; fall through to
    /// S4, then ordinary call.
    fn usemethod(&self, vm: &mut Vm, selector: StringId, obj: &Value, env: &Rc<Environment>) -> Result<Option<Value>, RunError>;

    /// S4 generic dispatch (`dispatch_`'s second step, consulted only when
    /// `has_s4_methods` says a method table exists for `selector`).
    fn s4_dispatch(&self, vm: &mut Vm, selector: StringId, obj: &Value, env: &Rc<Environment>) -> Result<Option<Value>, RunError>;

    /// Whether any S4 method is registered for `selector` at all — lets
    /// `dispatch_` skip the S4 step entirely for ordinary (non-generic)
    /// calls.
    fn has_s4_methods(&self, selector: StringId) -> bool;

    /// `uniq_`'s copy-on-write step: produce an owned duplicate of a shared
    /// value before in-place mutation.
    fn shallow_duplicate(&self, value: &Value) -> Value;

    /// `lt_`'s fallback when both operands are not un-objected scalar reals
    /// (§9 Decision record).
    fn fallback_lt(&self, vm: &mut Vm, a: Value, b: Value) -> Result<Value, RunError>;
    /// `add_`'s fallback when both operands are not un-objected scalar
    /// reals (§9 Decision record).
    fn fallback_add(&self, vm: &mut Vm, a: Value, b: Value) -> Result<Value, RunError>;
    /// `sub_`'s fallback when both operands are not un-objected scalar
    /// reals (§9 Decision record).
    fn fallback_sub(&self, vm: &mut Vm, a: Value, b: Value) -> Result<Value, RunError>;

    /// Non-fatal diagnostic surfaced by a builtin/special (e.g. `warning()`).
    fn warn(&self, message: &str);
}

pub mod reference;
