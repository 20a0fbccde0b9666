//! Environments: chained symbol -> value maps with a parent pointer.
//!
//! Modeled on `ouros::namespace::Namespaces` (recursion-depth accounting
//! before allocation) but re-keyed from static slot indices to dynamic
//! `StringId` lookup through a parent chain, since this core's environments
//! are first-class, host-visible, dynamically scoped maps (§3 Data Model),
//! unlike Python's statically resolved locals.
//!
//! Per §6, environment primitives are nominally part of the host contract;
//! this module is the reference implementation the core ships so it can run
//! standalone (see DESIGN.md).

use std::{cell::RefCell, rc::Rc};

use ahash::AHashMap;

use crate::{
    intern::StringId,
    value::{Cons, Value},
};

/// Default ceiling on environment-chain depth created by recursive closure
/// calls, standing in for `ouros::resource`'s recursion guard (trimmed to
/// just the counter this core needs; see SPEC_FULL.md §2a).
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecursionLimitExceeded;

/// The symbol `"..."`, pre-interned by `Interpreter::new` so `ldddvar_` and
/// dots-expansion never need to intern it on the hot path.
pub const DOTS_NAME: &str = "...";

#[derive(Debug)]
pub struct Environment {
    parent: Option<Rc<Environment>>,
    frame: RefCell<AHashMap<StringId, Value>>,
    depth: usize,
}

impl Environment {
    /// The base environment: no parent, depth 0.
    #[must_use]
    pub fn new_base() -> Rc<Self> {
        Rc::new(Self { parent: None, frame: RefCell::new(AHashMap::new()), depth: 0 })
    }

    /// Creates a child environment, failing if this would exceed the
    /// recursion-depth policy (mirrors `ouros::namespace::Namespaces::new_namespace`'s
    /// fail-fast-before-allocating check).
    pub fn new_child(parent: &Rc<Self>, max_depth: usize) -> Result<Rc<Self>, RecursionLimitExceeded> {
        let depth = parent.depth + 1;
        if depth > max_depth {
            return Err(RecursionLimitExceeded);
        }
        Ok(Rc::new(Self { parent: Some(Rc::clone(parent)), frame: RefCell::new(AHashMap::new()), depth }))
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn parent(&self) -> Option<&Rc<Self>> {
        self.parent.as_ref()
    }

    /// Defines (or overwrites) `name` in *this* frame only.
    pub fn define(&self, name: StringId, value: Value) {
        self.frame.borrow_mut().insert(name, value);
    }

    /// Walks the chain looking for `name`, returning a clone of the bound
    /// value (cheap: scalars are `Copy`-ish, everything else is `Rc`).
    #[must_use]
    pub fn find(&self, name: StringId) -> Option<Value> {
        if let Some(v) = self.frame.borrow().get(&name) {
            return Some(v.clone());
        }
        self.parent.as_ref().and_then(|p| p.find(name))
    }

    /// Like `find`, but skips bindings that are not callable (closures,
    /// builtins, specials) — the contract `ldfun_` needs.
    #[must_use]
    pub fn find_function(&self, name: StringId) -> Option<Value> {
        if let Some(v) = self.frame.borrow().get(&name) {
            if v.is_callable() {
                return Some(v.clone());
            }
        }
        self.parent.as_ref().and_then(|p| p.find_function(name))
    }

    /// Looks up the `...` binding and returns the `n`th (1-based) pending
    /// argument's value (forcing is the caller's job), per `ldddvar_`.
    #[must_use]
    pub fn find_dots_nth(&self, dots_name: StringId, n: usize) -> Option<Value> {
        let dots = self.find(dots_name)?;
        let mut cur = dots;
        let mut remaining = n;
        loop {
            match cur {
                Value::Pair(cell) => {
                    let cons = cell.borrow();
                    if remaining <= 1 {
                        return Some(cons.car.clone());
                    }
                    remaining -= 1;
                    cur = cons.cdr.clone();
                }
                _ => return None,
            }
        }
    }

    /// True if `name` is bound anywhere in the chain.
    #[must_use]
    pub fn is_bound(&self, name: StringId) -> bool {
        self.frame.borrow().contains_key(&name) || self.parent.as_ref().is_some_and(|p| p.is_bound(name))
    }

    /// Removes a binding from this frame only (used by a handful of host
    /// builtins like `rm()`; not otherwise needed by the core).
    pub fn remove(&self, name: StringId) -> Option<Value> {
        self.frame.borrow_mut().remove(&name)
    }
}

/// Builds a dotted-pair list value out of `(tag, value)` entries, innermost
/// (last) first — the representation `...` and `call_` argument lists share.
/// Generic over anything that yields entries back-to-front (a plain `Vec`
/// from the compiler, or the VM's `SmallVec`-backed `ActualArgs`).
#[must_use]
pub fn make_pairlist<I>(entries: I) -> Value
where
    I: IntoIterator<Item = (Option<StringId>, Value)>,
    I::IntoIter: DoubleEndedIterator,
{
    let mut cur = Value::Nil;
    for (tag, value) in entries.into_iter().rev() {
        cur = Value::Pair(Rc::new(RefCell::new(Cons { tag, car: value, cdr: cur })));
    }
    cur
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interns;

    #[test]
    fn chained_lookup_walks_parent() {
        let mut interns = Interns::new();
        let x = interns.intern("x");
        let base = Environment::new_base();
        base.define(x, Value::Real(1.0));
        let child = Environment::new_child(&base, DEFAULT_MAX_RECURSION_DEPTH).unwrap();
        assert!(matches!(child.find(x), Some(Value::Real(v)) if v == 1.0));
    }

    #[test]
    fn shadowing_in_child_does_not_affect_parent() {
        let mut interns = Interns::new();
        let x = interns.intern("x");
        let base = Environment::new_base();
        base.define(x, Value::Real(1.0));
        let child = Environment::new_child(&base, DEFAULT_MAX_RECURSION_DEPTH).unwrap();
        child.define(x, Value::Real(2.0));
        assert!(matches!(child.find(x), Some(Value::Real(v)) if v == 2.0));
        assert!(matches!(base.find(x), Some(Value::Real(v)) if v == 1.0));
    }

    #[test]
    fn find_function_skips_non_callable_bindings() {
        let mut interns = Interns::new();
        let f = interns.intern("f");
        let base = Environment::new_base();
        base.define(f, Value::Real(3.0));
        let child = Environment::new_child(&base, DEFAULT_MAX_RECURSION_DEPTH).unwrap();
        child.define(f, Value::Builtin(crate::value::BuiltinId(0)));
        assert!(child.find_function(f).is_some());
        assert!(base.find_function(f).is_none());
    }

    #[test]
    fn recursion_limit_enforced() {
        let base = Environment::new_base();
        let child = Environment::new_child(&base, 0);
        assert!(child.is_err());
    }
}
