//! Call frames and the frame stack (§3 "Call frame", §5).
//!
//! A frame records everything a non-local transfer needs to unwind to: the
//! instruction offset to resume at, the value-stack length to truncate back
//! to, and (for function frames) the saved program counter. Grounded on the
//! `stack_top_snapshot`/`saved_pc` discipline §5 describes and on
//! `ouros::namespace::Namespaces`' own "install before doing anything that
//! can fail" ordering, generalized here from namespace bookkeeping to the
//! full `{env, closure, call_expr}` tuple a closure/loop frame needs.

use std::rc::Rc;

use crate::{
    env::Environment,
    error::TransferKind,
    value::{Closure, Value},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    TopLevel,
    Loop,
    FunctionReturn,
    /// Reserved: no debugger REPL ships in this core, but the frame kind is
    /// kept so a host-side browser/debugger can hook the same frame chain
    /// (§3).
    Browser,
    Builtin,
}

/// One installed frame.
#[derive(Debug)]
pub struct CallFrame {
    pub kind: FrameKind,
    /// `Loop`: offset just past the loop's closing `br_` (where `break`
    /// lands). `FunctionReturn`: offset in the *caller's* code to resume at
    /// after the call returns. Unused for `TopLevel`/`Browser`/`Builtin`.
    pub return_target: usize,
    /// Value-stack length to truncate back to when unwinding to this frame.
    pub stack_top_snapshot: usize,
    /// `Loop`: offset of the loop body's first instruction, re-entered by
    /// `next`. Unused otherwise.
    pub saved_pc: usize,
    pub call_env: Option<Rc<Environment>>,
    pub closure: Option<Rc<Closure>>,
    /// Pending-argument pairlist bound at this call (`...`'s view of the
    /// actuals), present on `FunctionReturn` frames.
    pub args_list: Option<Value>,
    pub call_expr: Option<Value>,
    /// Reserved slot for a host-registered on-exit callback; the core never
    /// installs one itself, it only guarantees the slot survives unwinding
    /// so an embedder's `on.exit`-equivalent can be layered on top.
    pub exit_handler: Option<Value>,
}

impl CallFrame {
    #[must_use]
    pub fn top_level(stack_top_snapshot: usize) -> Self {
        Self {
            kind: FrameKind::TopLevel,
            return_target: 0,
            stack_top_snapshot,
            saved_pc: 0,
            call_env: None,
            closure: None,
            args_list: None,
            call_expr: None,
            exit_handler: None,
        }
    }

    #[must_use]
    pub fn loop_frame(return_target: usize, saved_pc: usize, stack_top_snapshot: usize) -> Self {
        Self {
            kind: FrameKind::Loop,
            return_target,
            stack_top_snapshot,
            saved_pc,
            call_env: None,
            closure: None,
            args_list: None,
            call_expr: None,
            exit_handler: None,
        }
    }

    #[must_use]
    pub fn function_return(
        return_target: usize,
        stack_top_snapshot: usize,
        call_env: Rc<Environment>,
        closure: Rc<Closure>,
        args_list: Value,
        call_expr: Value,
    ) -> Self {
        Self {
            kind: FrameKind::FunctionReturn,
            return_target,
            stack_top_snapshot,
            saved_pc: 0,
            call_env: Some(call_env),
            closure: Some(closure),
            args_list: Some(args_list),
            call_expr: Some(call_expr),
            exit_handler: None,
        }
    }
}

/// Where a non-local transfer lands once `CallStack::unwind` finds its
/// matching frame.
#[derive(Debug, Clone, Copy)]
pub struct UnwindTarget {
    pub resume_pc: usize,
    pub stack_top_snapshot: usize,
}

/// The frame stack for one interpreter invocation (§3: "frames form a stack
/// rooted in process-wide state" — here, rooted in the owning `Interpreter`
/// instance rather than a true process-wide global, per SPEC_FULL.md §9's
/// state-ownership decision).
#[derive(Debug, Default)]
pub struct CallStack {
    frames: Vec<CallFrame>,
}

impl CallStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: CallFrame) {
        self.frames.push(frame);
    }

    /// `endcontext_`: pops the innermost frame on normal fall-through.
    pub fn pop(&mut self) -> Option<CallFrame> {
        self.frames.pop()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[must_use]
    pub fn top(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    /// Truncates the frame stack back to `len`, used when a transfer that
    /// does not belong to this invocation's own range of pushed frames
    /// bubbles past it (the frames it pushed above `len` are abandoned).
    pub fn truncate_to(&mut self, len: usize) {
        self.frames.truncate(len);
    }

    /// Non-mutating lookup of the nearest frame matching `kind`'s target
    /// frame kind, returning its index. Used by `Vm::run` to decide whether
    /// a transfer belongs to *this* invocation (index within its own pushed
    /// range) or to an ancestor invocation, before committing via `unwind`.
    #[must_use]
    pub fn find(&self, kind: TransferKind) -> Option<usize> {
        let want = match kind {
            TransferKind::Break | TransferKind::Next => FrameKind::Loop,
            TransferKind::Return => FrameKind::FunctionReturn,
        };
        self.frames.iter().rposition(|f| f.kind == want)
    }

    /// Unwinds to the nearest frame matching `kind`'s target frame kind,
    /// discarding everything installed above it. `Break` and `Next` both
    /// leave the matching `Loop` frame itself installed: `break` resumes at
    /// `endcontext_`, which pops that frame on the way out exactly like the
    /// static-jump path does; `next` resumes at the loop body so it can
    /// re-enter. `Return` discards the matching `FunctionReturn` frame (the
    /// call is over, and any `Loop` frames nested inside it are abandoned
    /// along with it since their `endcontext_` will never run).
    ///
    /// Returns `None` if no matching frame is installed — a
    /// `RunError::Internal` case at the call site, since a well-formed
    /// compiled program never emits `break`/`next`/`return` without an
    /// enclosing frame of the right kind.
    pub fn unwind(&mut self, kind: TransferKind) -> Option<UnwindTarget> {
        let want = match kind {
            TransferKind::Break | TransferKind::Next => FrameKind::Loop,
            TransferKind::Return => FrameKind::FunctionReturn,
        };
        let idx = self.frames.iter().rposition(|f| f.kind == want)?;
        match kind {
            TransferKind::Next => {
                let frame = &self.frames[idx];
                let target = UnwindTarget { resume_pc: frame.saved_pc, stack_top_snapshot: frame.stack_top_snapshot };
                self.frames.truncate(idx + 1);
                Some(target)
            }
            TransferKind::Break => {
                let frame = &self.frames[idx];
                let target = UnwindTarget { resume_pc: frame.return_target, stack_top_snapshot: frame.stack_top_snapshot };
                self.frames.truncate(idx + 1);
                Some(target)
            }
            TransferKind::Return => {
                let frame = self.frames.split_off(idx).into_iter().next().expect("index in bounds");
                Some(UnwindTarget { resume_pc: frame.return_target, stack_top_snapshot: frame.stack_top_snapshot })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn break_leaves_loop_frame_for_endcontext_to_pop() {
        let mut stack = CallStack::new();
        stack.push(CallFrame::top_level(0));
        stack.push(CallFrame::loop_frame(100, 10, 3));
        let target = stack.unwind(TransferKind::Break).unwrap();
        assert_eq!(target.resume_pc, 100);
        assert_eq!(target.stack_top_snapshot, 3);
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.pop().unwrap().kind, FrameKind::Loop);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn next_keeps_loop_frame_installed() {
        let mut stack = CallStack::new();
        stack.push(CallFrame::top_level(0));
        stack.push(CallFrame::loop_frame(100, 10, 3));
        let target = stack.unwind(TransferKind::Next).unwrap();
        assert_eq!(target.resume_pc, 10);
        assert_eq!(stack.len(), 2);
    }

    #[test]
    fn return_unwinds_past_nested_loop_frames() {
        let mut stack = CallStack::new();
        stack.push(CallFrame::top_level(0));
        stack.push(CallFrame::function_return(
            50,
            1,
            Environment::new_base(),
            Rc::new(Closure {
                formals: vec![],
                env: Environment::new_base(),
                body: Rc::new(crate::bytecode::code::FunctionObject::new(
                    crate::bytecode::code::CodeObject::new(vec![], crate::pool::PoolKey::NONE, 0),
                    crate::pool::ConstPool::new(),
                    crate::pool::SourcePool::new(),
                )),
            }),
            Value::Nil,
            Value::Nil,
        ));
        stack.push(CallFrame::loop_frame(200, 20, 2));
        let target = stack.unwind(TransferKind::Return).unwrap();
        assert_eq!(target.resume_pc, 50);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn unwind_without_matching_frame_returns_none() {
        let mut stack = CallStack::new();
        stack.push(CallFrame::top_level(0));
        assert!(stack.unwind(TransferKind::Break).is_none());
    }
}
