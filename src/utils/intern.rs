//! Symbol interning for symbolic unknowns.
//!
//! Symbolic expressions refer to function parameters and opaque values by
//! name. Names are interned once so that expressions compare and hash as
//! small integers.

use string_interner::{StringInterner, DefaultSymbol, backend::StringBackend, Symbol as SymbolTrait};
use std::fmt;
use std::sync::RwLock;
use serde::{Serialize, Deserialize};
use once_cell::sync::Lazy;

/// Type alias for our interner backend
type Backend = StringBackend<DefaultSymbol>;

/// A symbol representing an interned string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(u32);

impl Symbol {
    pub fn as_raw(&self) -> u32 { self.0 }

    /// The interned text, or a placeholder if the symbol is foreign.
    pub fn name(&self) -> String {
        resolve(*self).unwrap_or_else(|| format!("?{}", self.0))
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({}:{})", self.0, self.name())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Global symbol interner (thread-safe).
static GLOBAL_INTERNER: Lazy<RwLock<StringInterner<Backend>>> =
    Lazy::new(|| RwLock::new(StringInterner::new()));

/// Intern a string in the global interner.
pub fn intern(s: &str) -> Symbol {
    let mut interner = GLOBAL_INTERNER
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let sym = interner.get_or_intern(s);
    Symbol(sym.to_usize() as u32)
}

/// Resolve a symbol from the global interner.
pub fn resolve(sym: Symbol) -> Option<String> {
    let interner = GLOBAL_INTERNER
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let internal_sym = DefaultSymbol::try_from_usize(sym.0 as usize)?;
    interner.resolve(internal_sym).map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_interner() {
        let sym1 = intern("test_string");
        let sym2 = intern("test_string");
        let sym3 = intern("other_string");
        assert_eq!(sym1, sym2);
        assert_ne!(sym1, sym3);
        assert_eq!(resolve(sym1), Some("test_string".to_string()));
    }

    #[test]
    fn test_display() {
        let sym = intern("%N");
        assert_eq!(format!("{}", sym), "%N");
    }
}
