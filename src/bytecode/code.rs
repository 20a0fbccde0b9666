//! `CodeObject` and `FunctionObject` (§3).
//!
//! Grounded on `ouros::bytecode::mod::CodeObject`-shaped container (bytes +
//! per-instruction metadata) and on `ouros::function::Function` for the
//! "one compiled unit owns its nested promise bodies" shape — here
//! `FunctionObject` owns an entry `CodeObject` plus every default-argument
//! and promise body compiled alongside it, addressed by index rather than
//! living in separate top-level objects.

use crate::pool::{ConstPool, PoolKey, SourcePool};

/// Sentinel packed into a `call_`'s argument-index vector in place of a real
/// code-object index, marking "splice the caller's `...` binding here"
/// (§4.2.1 `for`-loop/variadic-expansion lowering).
pub const DOTS_ARG_IDX: i32 = -1;

/// Sentinel packed into a `call_`'s argument-index vector marking "forward a
/// missing argument here" rather than a promise.
pub const MISSING_ARG_IDX: i32 = -2;

/// One compiled instruction stream.
///
/// `ops` is the raw encoded bytecode (see `bytecode::builder` for the
/// encoding and `bytecode::vm` for decoding). `src_index` is this code
/// object's own default source reference (§3: "fallback when a given
/// instruction carries no per-instruction entry"). `stack_depth` is the
/// maximum operand-stack depth `CodeBuilder::build` computed for this
/// stream, letting the VM preallocate its value stack.
#[derive(Debug, Clone)]
pub struct CodeObject {
    pub ops: Vec<u8>,
    /// Default/whole-expression source key (§3's `src`), used whenever no
    /// more specific per-instruction entry is recorded.
    pub src_index: PoolKey,
    pub stack_depth: usize,
    /// Sparse instruction-index -> source-pool-key table (§3's
    /// `src_index` sequence), recorded only at the handful of instructions
    /// that actually consult their source AST at run time (`call_`,
    /// `call_stack_`, `dispatch_`, `isspecial_`'s slow-path fallback).
    /// Kept sorted by pc so `src_at` can binary-search.
    pub src_table: Vec<(u32, PoolKey)>,
}

impl CodeObject {
    #[must_use]
    pub fn new(ops: Vec<u8>, src_index: PoolKey, stack_depth: usize) -> Self {
        Self { ops, src_index, stack_depth, src_table: Vec::new() }
    }

    #[must_use]
    pub fn with_src_table(ops: Vec<u8>, src_index: PoolKey, stack_depth: usize, src_table: Vec<(u32, PoolKey)>) -> Self {
        Self { ops, src_index, stack_depth, src_table }
    }

    /// Looks up the source key recorded for instruction `pc`, falling back
    /// to this code object's whole-expression `src_index`.
    #[must_use]
    pub fn src_at(&self, pc: usize) -> PoolKey {
        let pc = u32::try_from(pc).unwrap_or(u32::MAX);
        match self.src_table.binary_search_by_key(&pc, |(p, _)| *p) {
            Ok(i) => self.src_table[i].1,
            Err(_) => self.src_index,
        }
    }
}

/// A compiled function: one entry point plus every nested code object its
/// own body references (promise/default bodies pushed by `push_code_`,
/// argument-promise bodies referenced by `promise_`).
///
/// Index 0 is always the entry point (§3); indices 1.. are addressed by
/// `CodeRef::index` from the closure's formals and from `push_code_`
/// operands emitted while compiling this function's body.
#[derive(Debug)]
pub struct FunctionObject {
    pub codes: Vec<CodeObject>,
    pub consts: ConstPool,
    pub source: SourcePool,
}

impl FunctionObject {
    #[must_use]
    pub fn new(entry: CodeObject, consts: ConstPool, source: SourcePool) -> Self {
        Self { codes: vec![entry], consts, source }
    }

    /// Appends a nested code object (a promise or default-argument body),
    /// returning the index later referenced by `push_code_`/`promise_`.
    pub fn push_code(&mut self, code: CodeObject) -> u32 {
        let idx = self.codes.len();
        self.codes.push(code);
        u32::try_from(idx).expect("function exceeds u32 nested code objects")
    }

    #[must_use]
    pub fn entry(&self) -> &CodeObject {
        &self.codes[0]
    }

    #[must_use]
    pub fn code(&self, index: u32) -> &CodeObject {
        &self.codes[index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_is_index_zero() {
        let entry = CodeObject::new(vec![], PoolKey::NONE, 0);
        let func = FunctionObject::new(entry, ConstPool::new(), SourcePool::new());
        assert_eq!(func.codes.len(), 1);
        assert!(func.entry().ops.is_empty());
    }

    #[test]
    fn push_code_appends_and_addresses_by_index() {
        let entry = CodeObject::new(vec![], PoolKey::NONE, 0);
        let mut func = FunctionObject::new(entry, ConstPool::new(), SourcePool::new());
        let idx = func.push_code(CodeObject::new(vec![1, 2, 3], PoolKey::NONE, 1));
        assert_eq!(idx, 1);
        assert_eq!(func.code(idx).ops, vec![1, 2, 3]);
    }
}
