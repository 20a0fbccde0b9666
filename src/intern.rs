//! Symbol interning.
//!
//! Every symbol the compiler or interpreter touches (variable names, formal
//! names, dispatch selectors, tag names) is interned once into a small
//! append-only table and referenced afterwards by a cheap `StringId`. This
//! avoids repeated string comparisons on the hot lookup path (`ldvar_`,
//! environment frame lookups) and lets `Value::Symbol` stay `Copy`.

use ahash::AHashMap;

/// Index into the interner's storage.
///
/// `u32` keeps `Value::Symbol` small; four billion distinct symbols is far
/// more than any compiled program will ever need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StringId(u32);

impl StringId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Append-only symbol table shared by the compiler and interpreter.
///
/// One `Interns` is owned per `Interpreter` instance (see `src/lib.rs`);
/// there is no process-wide global table.
#[derive(Debug, Default)]
pub struct Interns {
    strings: Vec<Box<str>>,
    by_str: AHashMap<Box<str>, StringId>,
}

impl Interns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `s`, returning the existing id if already present.
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.by_str.get(s) {
            return id;
        }
        let id = StringId(u32::try_from(self.strings.len()).expect("interner exceeds u32 symbols"));
        self.strings.push(s.into());
        self.by_str.insert(s.into(), id);
        id
    }

    #[must_use]
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.index()]
    }

    /// Looks up an id for `s` without interning it.
    pub fn lookup(&self, s: &str) -> Option<StringId> {
        self.by_str.get(s).copied()
    }
}

#[cfg(test)]
impl StringId {
    /// Test-only constructor for value-shape assertions that don't need a
    /// real interner around.
    pub fn for_test(raw: u32) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedups() {
        let mut interns = Interns::new();
        let a = interns.intern("x");
        let b = interns.intern("x");
        let c = interns.intern("y");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(interns.get(a), "x");
        assert_eq!(interns.get(c), "y");
    }

    #[test]
    fn lookup_without_interning() {
        let mut interns = Interns::new();
        assert_eq!(interns.lookup("z"), None);
        let id = interns.intern("z");
        assert_eq!(interns.lookup("z"), Some(id));
    }
}
