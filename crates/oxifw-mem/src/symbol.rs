//! Compact identifiers for interned strings.

use std::fmt;

/// Dense 32-bit id handed out by a [`StringInterner`](crate::StringInterner).
///
/// Ids start at zero and increase by one per distinct string, so they can
/// index side tables directly.
///
/// ```
/// use oxifw_mem::Symbol;
///
/// let sym = Symbol::new(7);
/// assert_eq!(sym.as_usize(), 7);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol(u32);

impl Symbol {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the raw id as an index.
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_roundtrip() {
        let sym = Symbol::new(42);
        assert_eq!(sym.as_u32(), 42);
        assert_eq!(sym.as_usize(), 42);
        assert_eq!(sym.to_string(), "#42");
    }

    #[test]
    fn test_symbol_ordering() {
        assert!(Symbol::new(1) < Symbol::new(2));
        assert_eq!(Symbol::new(3), Symbol::new(3));
    }
}
