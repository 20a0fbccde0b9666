//! Error types (§7).
//!
//! Grounded on `ouros::exception_private::{RunError, ExcType}`: a hand-rolled
//! enum (no `thiserror`) with an `Internal` case for interpreter bugs split
//! from typed, catchable variants, plus `strum` for the error-kind tag the
//! same way `ouros` derives `Display`/`EnumString` on `ExcType`.

use std::fmt;

use strum::{Display as StrumDisplay, EnumString};

/// Which installed frame kind a non-local transfer is trying to reach.
///
/// Carried by `RunError::Transfer` so `frame::CallStack::unwind_to` can tell
/// a `break`/`next` transfer (wants the nearest `Loop` frame) from a
/// `return` transfer (wants the nearest `FunctionReturn` frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString)]
pub enum TransferKind {
    Break,
    Next,
    Return,
}

/// Tag identifying an error kind, independent of its message — lets host
/// code match on kind without string comparison, mirroring how `ExcType`
/// tags `ouros`'s `RunError` variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString)]
pub enum ErrorKind {
    UnboundVariable,
    MissingArgument,
    NonFunction,
    BadCondition,
    BadAssignmentTarget,
    OutOfRange,
    InternalBug,
}

/// Runtime errors surfaced by the compiler's dynamic fallback path and by
/// the interpreter (§7).
#[derive(Debug, Clone)]
pub enum RunError {
    /// `ldvar_`/`ldfun_` found no binding for the symbol.
    UnboundVariable { name: String },
    /// `ldvar_`/eager argument expansion hit a formal with no supplied or
    /// default value.
    MissingArgument { name: String },
    /// `ldfun_`/`isfun_` resolved a binding that is not callable.
    NonFunction { what: String },
    /// `asbool_` given a zero-length vector or an `NA`.
    BadCondition { reason: String },
    /// Compiler detected an `<-` LHS it cannot rewrite (surfaced as a
    /// `RunError` only when the dynamic fallback itself then fails at run
    /// time; the compile-time case is `CompileError::BadAssignmentTarget`).
    BadAssignmentTarget { reason: String },
    /// `extract1_` fast path saw an index past the end — callers must treat
    /// this as "fall through to the generic builtin", never as fatal.
    OutOfRange { index: i64, len: usize },
    /// Non-local control transfer in flight: a `break`/`next`/`return`
    /// bubbling up through `eval_code` until it reaches a matching frame
    /// (§5). Not a user-visible error; `Vm::run` catches it at frame
    /// boundaries.
    Transfer { kind: TransferKind, value: Box<crate::value::Value> },
    /// Any invariant violation in opcode dispatch or frame bookkeeping.
    /// Fatal: never expected to surface from a correctly compiled program.
    Internal { message: String },
}

impl RunError {
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::UnboundVariable { .. } => Some(ErrorKind::UnboundVariable),
            Self::MissingArgument { .. } => Some(ErrorKind::MissingArgument),
            Self::NonFunction { .. } => Some(ErrorKind::NonFunction),
            Self::BadCondition { .. } => Some(ErrorKind::BadCondition),
            Self::BadAssignmentTarget { .. } => Some(ErrorKind::BadAssignmentTarget),
            Self::OutOfRange { .. } => Some(ErrorKind::OutOfRange),
            Self::Internal { .. } => Some(ErrorKind::InternalBug),
            Self::Transfer { .. } => None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnboundVariable { name } => write!(f, "object '{name}' not found"),
            Self::MissingArgument { name } => write!(f, "argument \"{name}\" is missing, with no default"),
            Self::NonFunction { what } => write!(f, "attempt to apply non-function ({what})"),
            Self::BadCondition { reason } => write!(f, "{reason}"),
            Self::BadAssignmentTarget { reason } => write!(f, "invalid assignment target: {reason}"),
            Self::OutOfRange { index, len } => write!(f, "subscript {index} out of bounds for length {len}"),
            Self::Transfer { kind, .. } => write!(f, "uncaught non-local transfer ({kind})"),
            Self::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for RunError {}

/// Errors raised by the compiler before any bytecode runs (§7).
#[derive(Debug, Clone)]
pub enum CompileError {
    /// A special form was invoked with a shape the compiler cannot lower at
    /// all (e.g. `quote()` with the wrong arity) — unlike a malformed `<-`
    /// LHS, there is no dynamic fallback for this.
    BadSpecialForm { form: &'static str, reason: String },
    /// The LHS of `<-` is syntactically a call chain but compilation
    /// decided not to rewrite it (non-symbol intermediate head); the
    /// compiler itself falls back to a dynamic `call_stack_`-based
    /// assignment rather than surfacing this to the caller, so this
    /// variant exists for diagnostics/tests that want to observe the
    /// decision.
    BadAssignmentTarget { reason: String },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSpecialForm { form, reason } => write!(f, "invalid use of '{form}': {reason}"),
            Self::BadAssignmentTarget { reason } => write!(f, "invalid assignment target: {reason}"),
        }
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_match_expected_wording() {
        let e = RunError::UnboundVariable { name: "x".into() };
        assert_eq!(e.to_string(), "object 'x' not found");
        assert_eq!(e.kind(), Some(ErrorKind::UnboundVariable));
    }

    #[test]
    fn transfer_has_no_kind_tag() {
        let e = RunError::Transfer { kind: TransferKind::Break, value: Box::new(crate::value::Value::Nil) };
        assert_eq!(e.kind(), None);
    }
}
