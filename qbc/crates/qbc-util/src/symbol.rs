//! Interned identifier names.
//!
//! The dialect compares identifiers case-insensitively, and a type sigil
//! (`%` `&` `!` `#` `$` `&&`) is part of the name: `A%` and `A!` are two
//! different variables. Interning folds the spelling to ASCII uppercase
//! once, so the rest of the pipeline compares names as plain `u32`s and
//! never thinks about case again.
//!
//! The interner is thread-local. A compilation runs on one thread, and a
//! `Symbol` is only meaningful within the thread that interned it.

use std::cell::RefCell;
use std::fmt;

use rustc_hash::FxHashMap;

/// An interned, case-folded identifier name.
///
/// # Examples
///
/// ```
/// use qbc_util::Symbol;
///
/// let a = Symbol::intern("count%");
/// let b = Symbol::intern("COUNT%");
/// let c = Symbol::intern("count!");
/// assert_eq!(a, b);
/// assert_ne!(a, c);
/// assert_eq!(a.as_str(), "COUNT%");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

thread_local! {
    static INTERNER: RefCell<Interner> = RefCell::new(Interner::new());
}

impl Symbol {
    /// Intern `name`, folding it to ASCII uppercase first.
    pub fn intern(name: &str) -> Symbol {
        INTERNER.with(|i| i.borrow_mut().intern(name))
    }

    /// The canonical (upper-cased) spelling.
    pub fn as_str(self) -> String {
        INTERNER.with(|i| i.borrow().resolve(self).to_string())
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({:?})", self.as_str())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

struct Interner {
    map: FxHashMap<String, Symbol>,
    strings: Vec<String>,
}

impl Interner {
    fn new() -> Self {
        Self {
            map: FxHashMap::default(),
            strings: Vec::new(),
        }
    }

    fn intern(&mut self, name: &str) -> Symbol {
        let folded = name.to_ascii_uppercase();
        if let Some(&sym) = self.map.get(&folded) {
            return sym;
        }
        let sym = Symbol(self.strings.len() as u32);
        self.map.insert(folded.clone(), sym);
        self.strings.push(folded);
        sym
    }

    fn resolve(&self, sym: Symbol) -> &str {
        &self.strings[sym.0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_case_insensitive() {
        let a = Symbol::intern("Total&");
        let b = Symbol::intern("TOTAL&");
        let c = Symbol::intern("total&");
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_sigil_distinguishes_names() {
        let pct = Symbol::intern("N%");
        let bang = Symbol::intern("N!");
        let bare = Symbol::intern("N");
        assert_ne!(pct, bang);
        assert_ne!(pct, bare);
        assert_ne!(bang, bare);
    }

    #[test]
    fn test_canonical_spelling_is_uppercase() {
        let sym = Symbol::intern("hello$");
        assert_eq!(sym.as_str(), "HELLO$");
    }

    #[test]
    fn test_same_symbol_same_index() {
        let a = Symbol::intern("x");
        let b = Symbol::intern("X");
        assert_eq!(a.index(), b.index());
    }
}
