//! Constant & source pools.
//!
//! Append-only interned storage addressable by a small integer key, exactly
//! as `push_`/named-load instructions and per-instruction source references
//! expect (§3). Grounded on `ouros::bytecode::builder::CodeBuilder::add_const`'s
//! dedup-by-index contract and `ouros::intern`'s interner shape, generalized
//! here to arbitrary `Value`s (constants) and AST fragments (source
//! references) rather than just literals.

use ahash::AHashMap;

use crate::value::Value;

/// Index into a `ConstPool` or `SourcePool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey(u32);

impl PoolKey {
    /// Reserved key meaning "no source reference; fall back to the owning
    /// function's overall source" (§3 CodeObject.src_index).
    pub const NONE: Self = Self(0);

    /// Wraps a raw pool index decoded from a bytecode operand. The VM is the
    /// only caller outside this module that needs to go from "an integer
    /// read off the instruction stream" back to a `PoolKey`.
    #[must_use]
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Append-only value pool with numeric dedup.
///
/// Two secondary maps (`int`/`real`) deduplicate numeric constants so that
/// e.g. emitting the literal `1` twice in one function reuses one pool
/// slot, matching §3's "Constant pool" description.
#[derive(Debug, Default)]
pub struct ConstPool {
    values: Vec<Value>,
    int_index: AHashMap<i32, PoolKey>,
    real_index: AHashMap<u64, PoolKey>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `value`, deduplicating integer and real scalars.
    pub fn intern(&mut self, value: Value) -> PoolKey {
        match &value {
            Value::Int(i) => {
                if let Some(&key) = self.int_index.get(i) {
                    return key;
                }
                let key = self.push_raw(value);
                self.int_index.insert(*i, key);
                key
            }
            Value::Real(r) => {
                let bits = r.to_bits();
                if let Some(&key) = self.real_index.get(&bits) {
                    return key;
                }
                let key = self.push_raw(value);
                self.real_index.insert(bits, key);
                key
            }
            _ => self.push_raw(value),
        }
    }

    fn push_raw(&mut self, value: Value) -> PoolKey {
        let idx = self.values.len();
        let key = PoolKey(u32::try_from(idx).expect("constant pool exceeds u32 entries"));
        self.values.push(value);
        key
    }

    #[must_use]
    pub fn get(&self, key: PoolKey) -> &Value {
        &self.values[key.index()]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Append-only AST-fragment pool, one entry per instruction that needs a
/// source reference (error messages, dispatch selector resolution,
/// complex-assignment rewriting).
#[derive(Debug, Default)]
pub struct SourcePool {
    entries: Vec<Value>,
}

impl SourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Value::Nil` is a legitimate entry (key 0 is reserved by convention,
    /// see `PoolKey::NONE`, but this pool does not special-case it; callers
    /// that want "no source" use `PoolKey::NONE` and never dereference it).
    pub fn intern(&mut self, ast: Value) -> PoolKey {
        if self.entries.is_empty() {
            // Reserve index 0 so PoolKey::NONE never aliases a real entry.
            self.entries.push(Value::Nil);
        }
        let idx = self.entries.len();
        self.entries.push(ast);
        PoolKey(u32::try_from(idx).expect("source pool exceeds u32 entries"))
    }

    #[must_use]
    pub fn get(&self, key: PoolKey) -> Option<&Value> {
        if key == PoolKey::NONE {
            return None;
        }
        self.entries.get(key.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_constants_dedup() {
        let mut pool = ConstPool::new();
        let a = pool.intern(Value::Int(7));
        let b = pool.intern(Value::Int(7));
        let c = pool.intern(Value::Int(8));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn real_constants_dedup_by_bits() {
        let mut pool = ConstPool::new();
        let a = pool.intern(Value::Real(1.5));
        let b = pool.intern(Value::Real(1.5));
        assert_eq!(a, b);
    }

    #[test]
    fn source_pool_reserves_none_key() {
        let mut pool = SourcePool::new();
        let k = pool.intern(Value::Symbol(crate::intern::StringId::for_test(0)));
        assert_ne!(k, PoolKey::NONE);
        assert!(pool.get(PoolKey::NONE).is_none());
        assert!(pool.get(k).is_some());
    }
}
