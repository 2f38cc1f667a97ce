//! Memory primitives for the `OxiFW` runtime.
//!
//! - [`arena`]: bump arena with stable pointers
//! - [`StringInterner`]: string to [`Symbol`] interning on top of the arena

pub mod arena;
pub mod interner;
pub mod symbol;

pub use arena::Arena;
pub use interner::StringInterner;
pub use symbol::Symbol;
