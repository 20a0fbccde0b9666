//! The `Value` adapter: a typed view over host values.
//!
//! Component "Value/AST adapter" from the design overview. This single
//! tagged enum plays three roles at once, exactly as the host language's own
//! values do: runtime value, AST node (code is data: calls and pairs *are*
//! the AST), and first-class bytecode artifact (`Value::Code`,
//! `Value::Function`). A production embedding replaces the `Rc`/`RefCell`
//! sharing used here with its own GC'd handle type behind the same
//! predicates (see DESIGN.md).

use std::{cell::RefCell, fmt, rc::Rc};

use crate::{bytecode::code::FunctionObject, env::Environment, intern::StringId};

/// Three-valued logical, matching the host language's `NA` handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logical {
    False,
    True,
    Na,
}

impl Logical {
    #[must_use]
    pub fn from_bool(b: bool) -> Self {
        if b { Self::True } else { Self::False }
    }

    #[must_use]
    pub fn to_bool(self) -> Option<bool> {
        match self {
            Self::False => Some(false),
            Self::True => Some(true),
            Self::Na => None,
        }
    }
}

/// Sharing state standing in for the host's NAMED/refcount mechanism.
///
/// `Temporary` values may be mutated in place; once a value is stored under
/// a name (a `stvar_`) or forced out of a promise, it is elevated at least
/// to `Once`, and `uniq_` must shallow-duplicate before mutating anything
/// above `Temporary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Named {
    Temporary,
    Once,
    Always,
}

impl Named {
    pub fn raise(&mut self, at_least: Self) {
        if *self < at_least {
            *self = at_least;
        }
    }
}

/// A cons cell: backs both ordinary pairlists and language calls.
///
/// `tag` carries the argument name for a named pairlist entry (or `None`
/// for positional entries) — this is how call sites and `...` expansion
/// represent named/unnamed pending arguments (GLOSSARY: Dots).
#[derive(Debug, Clone)]
pub struct Cons {
    pub tag: Option<StringId>,
    pub car: Value,
    pub cdr: Value,
}

/// A named, mutable, heap-ish list — the thing `extract1_`/`subset1_`/
/// complex assignment actually operate on.
#[derive(Debug)]
pub struct VectorData {
    pub items: Vec<Value>,
    pub names: Vec<Option<StringId>>,
    pub named: RefCell<Named>,
}

impl VectorData {
    #[must_use]
    pub fn new(items: Vec<Value>, names: Vec<Option<StringId>>) -> Self {
        Self { items, names, named: RefCell::new(Named::Temporary) }
    }

    pub fn name_index(&self, name: StringId) -> Option<usize> {
        self.names.iter().position(|n| *n == Some(name))
    }
}

/// A closure: `(formals, body, defining_env)`, the one explicit type the
/// data model requires (§3).
#[derive(Debug)]
pub struct Closure {
    pub formals: Vec<FormalSpec>,
    pub env: Rc<Environment>,
    pub body: Rc<FunctionObject>,
}

/// One formal parameter. `default_code` indexes into `body`'s code pool
/// (§4.2.2): the closure's own `FunctionObject` owns the compiled default
/// expression alongside argument promise bodies.
#[derive(Debug, Clone, Copy)]
pub struct FormalSpec {
    pub name: StringId,
    pub default_code: Option<u32>,
}

/// A reference to one `CodeObject` inside a `FunctionObject`, pushed as a
/// first-class value by `push_code_` (used for `quote(x)` and for
/// promise-default plumbing).
#[derive(Debug, Clone)]
pub struct CodeRef {
    pub function: Rc<FunctionObject>,
    pub index: u32,
}

/// The body a promise forces.
#[derive(Debug, Clone)]
pub enum PromiseBody {
    /// A compiled promise body living in a `FunctionObject`'s code pool.
    Code(CodeRef),
    /// A bare AST fragment (e.g. a promise built directly by the host from
    /// an already-evaluated expression, or during complex-assignment
    /// rewriting).
    Expr(Value),
}

/// State of forcing: `Unforced` while the promise has not yet run its body,
/// `Forcing` while evaluation of the body is in flight (used to detect the
/// cyclic-forcing case the core treats as an internal bug, §4.3), `Forced`
/// once a value has been produced.
#[derive(Debug, Clone)]
pub enum PromiseState {
    Unforced,
    Forcing,
    Forced(Value),
}

#[derive(Debug)]
pub struct Promise {
    pub body: PromiseBody,
    pub env: Rc<Environment>,
    pub state: RefCell<PromiseState>,
}

impl Promise {
    #[must_use]
    pub fn new(body: PromiseBody, env: Rc<Environment>) -> Self {
        Self { body, env, state: RefCell::new(PromiseState::Unforced) }
    }

    /// Returns the already-computed value without forcing, if any.
    #[must_use]
    pub fn forced_value(&self) -> Option<Value> {
        match &*self.state.borrow() {
            PromiseState::Forced(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Host-provided builtin identifier (receives already-evaluated arguments).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuiltinId(pub u32);

/// Host-provided special identifier (receives the call AST unevaluated).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpecialId(pub u32);

/// A value wrapped with a class attribute, the thing `dispatch_`/`brobj_`
/// look for (predicate "is-object (has class attribute)").
#[derive(Debug)]
pub struct ObjectData {
    pub base: Value,
    pub class: Vec<StringId>,
    pub is_s4: bool,
}

/// The tagged union. See module docs.
#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    /// Sentinel pushed for a missing formal argument (`R_MissingArg`
    /// equivalent).
    MissingArg,
    Symbol(StringId),
    Real(f64),
    Int(i32),
    Logical(Logical),
    Str(Rc<str>),
    Pair(Rc<RefCell<Cons>>),
    LangCall(Rc<RefCell<Cons>>),
    Vector(Rc<VectorData>),
    Closure(Rc<Closure>),
    Builtin(BuiltinId),
    Special(SpecialId),
    Promise(Rc<Promise>),
    Environment(Rc<Environment>),
    Function(Rc<FunctionObject>),
    Code(CodeRef),
    Object(Rc<ObjectData>),
}

impl Value {
    #[must_use]
    pub fn symbol(id: StringId) -> Self {
        Self::Symbol(id)
    }

    #[must_use]
    pub fn str(s: impl Into<Rc<str>>) -> Self {
        Self::Str(s.into())
    }

    #[must_use]
    pub fn cons(tag: Option<StringId>, car: Value, cdr: Value) -> Self {
        Self::Pair(Rc::new(RefCell::new(Cons { tag, car, cdr })))
    }

    #[must_use]
    pub fn lang_call(head: Value, args: Value) -> Self {
        Self::LangCall(Rc::new(RefCell::new(Cons { tag: None, car: head, cdr: args })))
    }

    #[must_use]
    pub fn vector(items: Vec<Value>, names: Vec<Option<StringId>>) -> Self {
        Self::Vector(Rc::new(VectorData::new(items, names)))
    }

    // --- classification predicates (§3) ---

    #[must_use]
    pub fn is_symbol(&self) -> bool {
        matches!(self, Self::Symbol(_))
    }

    #[must_use]
    pub fn is_pair(&self) -> bool {
        matches!(self, Self::Nil | Self::Pair(_))
    }

    #[must_use]
    pub fn is_language_call(&self) -> bool {
        matches!(self, Self::LangCall(_))
    }

    #[must_use]
    pub fn is_closure(&self) -> bool {
        matches!(self, Self::Closure(_))
    }

    #[must_use]
    pub fn is_builtin(&self) -> bool {
        matches!(self, Self::Builtin(_))
    }

    #[must_use]
    pub fn is_special(&self) -> bool {
        matches!(self, Self::Special(_))
    }

    #[must_use]
    pub fn is_promise(&self) -> bool {
        matches!(self, Self::Promise(_))
    }

    #[must_use]
    pub fn is_environment(&self) -> bool {
        matches!(self, Self::Environment(_))
    }

    #[must_use]
    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    #[must_use]
    pub fn is_callable(&self) -> bool {
        self.is_closure() || self.is_builtin() || self.is_special()
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Nil)
    }

    #[must_use]
    pub fn is_list(&self) -> bool {
        matches!(self, Self::Vector(_))
    }

    /// Class vector, if this value carries one (unwraps `Object`).
    #[must_use]
    pub fn class(&self) -> Option<&[StringId]> {
        match self {
            Self::Object(o) => Some(&o.class),
            _ => None,
        }
    }

    /// The base value underneath an `Object` wrapper, or `self` if it isn't
    /// one.
    #[must_use]
    pub fn strip_object(&self) -> &Value {
        match self {
            Self::Object(o) => &o.base,
            other => other,
        }
    }

    /// Scalar-real fast-path accessor: `Some(x)` only for an un-objected
    /// `Real`.
    #[must_use]
    pub fn as_scalar_real(&self) -> Option<f64> {
        match self {
            Self::Real(x) => Some(*x),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_scalar_int(&self) -> Option<i32> {
        match self {
            Self::Int(x) => Some(*x),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "NULL"),
            Self::MissingArg => write!(f, "<missing>"),
            Self::Symbol(_) => write!(f, "<symbol>"),
            Self::Real(x) => write!(f, "{x}"),
            Self::Int(x) => write!(f, "{x}L"),
            Self::Logical(Logical::True) => write!(f, "TRUE"),
            Self::Logical(Logical::False) => write!(f, "FALSE"),
            Self::Logical(Logical::Na) => write!(f, "NA"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Pair(_) | Self::LangCall(_) => write!(f, "<pairlist>"),
            Self::Vector(_) => write!(f, "<list>"),
            Self::Closure(_) => write!(f, "<closure>"),
            Self::Builtin(_) => write!(f, "<builtin>"),
            Self::Special(_) => write!(f, "<special>"),
            Self::Promise(_) => write!(f, "<promise>"),
            Self::Environment(_) => write!(f, "<environment>"),
            Self::Function(_) => write!(f, "<function object>"),
            Self::Code(_) => write!(f, "<bytecode>"),
            Self::Object(_) => write!(f, "<object>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates() {
        assert!(Value::Nil.is_pair());
        assert!(!Value::Nil.is_language_call());
        assert!(Value::Symbol(StringId::for_test(0)).is_symbol());
    }

    #[test]
    fn named_raises_monotonically() {
        let mut n = Named::Temporary;
        n.raise(Named::Once);
        assert_eq!(n, Named::Once);
        n.raise(Named::Temporary);
        assert_eq!(n, Named::Once);
        n.raise(Named::Always);
        assert_eq!(n, Named::Always);
    }
}
