//! Bytecode compiler and stack-based interpreter core for a dynamically
//! typed, lazily evaluated, lexically scoped language (see `DESIGN.md`,
//! `SPEC_FULL.md`).
//!
//! This crate never frees a value itself (`Rc`/`Rc<RefCell<_>>` stand in
//! for a host GC), never parses source text, and never ships a primitive
//! function library — all three are the embedder's job behind
//! `host::HostRuntime` (§1 Non-goals). What it does own end to end is: AST
//! (`value::Value`) -> `bytecode::Compiler` -> `bytecode::FunctionObject`
//! -> `bytecode::Vm`.
//!
//! # State ownership
//!
//! Rather than process-wide globals, one [`Interpreter`] owns the symbol
//! interner, the VM's value/frame stacks, the recursion-depth policy
//! (`Limits`), and the visibility flag, constructed fresh per embedding
//! (SPEC_FULL.md §9 "State ownership"). Grouped re-exports below follow
//! `ouros`'s own `lib.rs` convention (`examples/parcadei-ouros/crates/ouros/src/lib.rs`).

pub mod bytecode;
pub mod env;
pub mod error;
pub mod frame;
pub mod host;
pub mod intern;
pub mod pool;
pub mod stack;
pub mod value;

use std::{cell::RefCell, rc::Rc};

pub use crate::{
    bytecode::{CodeObject, CompileError, FunctionObject, Vm},
    env::Environment,
    error::RunError,
    host::HostRuntime,
    intern::{Interns, StringId},
    value::Value,
};

/// Recursion/stack-depth policy, the one runtime-tunable knob this core
/// exposes (§2a "Config"). Grounded on `ouros::resource::ResourceTracker`/
/// `ResourceError::Recursion`, trimmed to just the call-depth counter this
/// core's `Environment::new_child` needs — allocation/operation/time/memory
/// limits are a sandboxing concern belonging to the host embedding the
/// teacher ships them for, not to this language core (§1 Non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_recursion_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_recursion_depth: env::DEFAULT_MAX_RECURSION_DEPTH }
    }
}

/// Owns everything a compile/eval session needs: the symbol interner, the
/// bytecode VM (value stack + frame stack + visibility flag), and the
/// pre-interned `...` symbol (§9 "State ownership"). Generic over the
/// embedder's `HostRuntime` implementation, which it holds by value and
/// threads through every `Vm::run` call.
#[derive(Debug)]
pub struct Interpreter<H: HostRuntime> {
    pub interns: Rc<RefCell<Interns>>,
    pub vm: Vm,
    pub host: H,
}

impl<H: HostRuntime> Interpreter<H> {
    /// Builds a fresh interpreter with the default recursion policy.
    #[must_use]
    pub fn new(host: H) -> Self {
        Self::with_limits(host, Limits::default())
    }

    #[must_use]
    pub fn with_limits(host: H, limits: Limits) -> Self {
        let interns = Rc::new(RefCell::new(Interns::new()));
        let dots_name = interns.borrow_mut().intern(env::DOTS_NAME);
        let vm = Vm::new(Rc::clone(&interns), limits, dots_name);
        Self { interns, vm, host }
    }

    /// `compile(ast) -> FunctionObject` (§6): lowers a closure's formals and
    /// body AST into a compiled `FunctionObject`, returning the closure's
    /// formal-parameter list alongside it (the closure value itself is the
    /// caller's to build, since this core does not presume any one way of
    /// representing "the defining environment" at the call site).
    pub fn compile(
        &mut self,
        formals_ast: &Value,
        body_ast: &Value,
    ) -> Result<(Vec<value::FormalSpec>, FunctionObject), CompileError> {
        let mut interns = self.interns.borrow_mut();
        bytecode::Compiler::new(&mut interns).compile_closure(formals_ast, body_ast)
    }

    /// `eval_function(fn, env) -> Value` (§6): evaluates `function`'s entry
    /// code in `env`.
    pub fn eval_function(&mut self, function: &Rc<FunctionObject>, env: &Rc<Environment>) -> Result<Value, RunError> {
        self.vm.run(&self.host, function, 0, env)
    }

    /// `eval_promise(code, env) -> Value` (§6): runs a single already-
    /// compiled `CodeObject` to completion in `env`, independent of any
    /// enclosing `FunctionObject`'s entry point (used to force a promise
    /// body directly, bypassing `Vm::force_promise_value`'s memoization
    /// when the caller wants a one-off evaluation).
    pub fn eval_promise(&mut self, function: &Rc<FunctionObject>, index: u32, env: &Rc<Environment>) -> Result<Value, RunError> {
        self.vm.run(&self.host, function, index, env)
    }

    /// `eval_expr(ast, env) -> Value` (§6): compiles `ast` as a zero-argument
    /// closure body and evaluates it, short-circuiting the values that
    /// evaluate to themselves (scalars, lists, environments, closures) so
    /// literal/already-reduced input doesn't round-trip through the
    /// compiler at all.
    pub fn eval_expr(&mut self, ast: &Value, env: &Rc<Environment>) -> Result<Value, RunError> {
        if is_self_evaluating(ast) {
            if let Value::Vector(data) = ast {
                data.named.borrow_mut().raise(value::Named::Always);
            }
            return Ok(ast.clone());
        }
        let (_, function) =
            self.compile(&Value::Nil, ast).map_err(|e| RunError::internal(format!("compile error: {e}")))?;
        self.eval_function(&Rc::new(function), env)
    }
}

/// Values `eval_expr` returns unchanged without compiling anything (§6).
fn is_self_evaluating(v: &Value) -> bool {
    matches!(
        v,
        Value::Nil
            | Value::MissingArg
            | Value::Real(_)
            | Value::Int(_)
            | Value::Logical(_)
            | Value::Str(_)
            | Value::Vector(_)
            | Value::Closure(_)
            | Value::Builtin(_)
            | Value::Special(_)
            | Value::Environment(_)
            | Value::Function(_)
            | Value::Code(_)
            | Value::Object(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::reference::ReferenceHost;

    #[test]
    fn eval_expr_short_circuits_a_literal() {
        let mut interp = Interpreter::new(ReferenceHost::new());
        let env = Environment::new_base();
        let result = interp.eval_expr(&Value::Real(7.0), &env).unwrap();
        assert!(matches!(result, Value::Real(x) if x == 7.0));
    }

    #[test]
    fn eval_expr_compiles_a_call() {
        let mut interp = Interpreter::new(ReferenceHost::new());
        let env = Environment::new_base();
        interp.host.install_base(&env, &mut interp.interns.borrow_mut());
        let plus = interp.interns.borrow_mut().intern("+");
        let call = Value::lang_call(
            Value::Symbol(plus),
            env::make_pairlist(vec![(None, Value::Real(1.0)), (None, Value::Real(2.0))]),
        );
        let result = interp.eval_expr(&call, &env).unwrap();
        assert!(matches!(result, Value::Real(x) if x == 3.0));
    }
}
