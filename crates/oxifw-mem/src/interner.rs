//! Bidirectional string interner.
//!
//! Every distinct string is copied once into an [`Arena`] and assigned the
//! next dense [`Symbol`]. Lookups by string go through a hash map keyed by
//! the arena copy; lookups by symbol index a vector.
//!
//! ```
//! use oxifw_mem::StringInterner;
//!
//! let mut interner = StringInterner::new();
//! let a = interner.intern("speak");
//! let b = interner.intern("speak");
//! assert_eq!(a, b);
//! assert_eq!(interner.resolve(a), Some("speak"));
//! assert_eq!(interner.get("bark"), None);
//! ```

use crate::arena::Arena;
use crate::symbol::Symbol;

#[cfg(feature = "symbols")]
use hashbrown::HashMap;

#[cfg(not(feature = "symbols"))]
use std::collections::HashMap;

/// Interner that owns its string storage.
pub struct StringInterner {
    /// Keys borrow from `arena`. They are never handed out with `'static`.
    symbols: HashMap<&'static str, Symbol>,
    strings: Vec<&'static str>,
    arena: Arena,
}

impl StringInterner {
    /// Creates an empty interner.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty interner sized for `capacity` strings.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            symbols: HashMap::with_capacity(capacity),
            strings: Vec::with_capacity(capacity),
            arena: Arena::default(),
        }
    }

    /// Returns the symbol for `s`, copying it into the arena on first use.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX` distinct strings are interned.
    pub fn intern(&mut self, s: &str) -> Symbol {
        if let Some(&sym) = self.symbols.get(s) {
            return sym;
        }

        let id = match u32::try_from(self.strings.len()) {
            Ok(id) => id,
            Err(_) => panic!("string interner exhausted its 32-bit id space"),
        };
        let ptr = self.arena.alloc_str(s);
        // SAFETY: the arena never moves or frees a chunk before it is dropped,
        // and it is dropped together with `self`. The widened lifetime never
        // leaves this struct: `resolve` narrows it back to `&self`.
        let stored: &'static str = unsafe { ptr.as_ref() };

        let sym = Symbol::new(id);
        self.strings.push(stored);
        self.symbols.insert(stored, sym);
        sym
    }

    /// Returns the symbol for `s` without interning it.
    #[must_use]
    pub fn get(&self, s: &str) -> Option<Symbol> {
        self.symbols.get(s).copied()
    }

    /// Returns the string behind `sym`, or `None` for a foreign symbol.
    #[must_use]
    pub fn resolve(&self, sym: Symbol) -> Option<&str> {
        self.strings.get(sym.as_usize()).copied()
    }

    /// Number of distinct strings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Returns true if nothing has been interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Iterates over `(symbol, string)` pairs in interning order.
    pub fn iter(&self) -> impl Iterator<Item = (Symbol, &str)> + '_ {
        self.strings
            .iter()
            .zip(0u32..)
            .map(|(s, id)| (Symbol::new(id), *s))
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}
