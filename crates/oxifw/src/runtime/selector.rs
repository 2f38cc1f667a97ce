//! Selector interning.
//!
//! A [`Selector`] is a 32-bit handle for a method name. The process-wide
//! table guarantees that equal names always produce the same handle, so
//! dispatch compares and hashes plain integers.
//!
//! # Sharding
//!
//! The table is split into `NUM_SHARDS` independent interners, picked by the
//! low bits of the name's `FxHash`. Each shard sits behind its own `RwLock`:
//! a hit takes one read lock, a miss upgrades to the write lock of that shard
//! only and re-checks before inserting, so two threads interning the same new
//! name still agree on one handle.
//!
//! The shard index is stored in the low `SHARD_BITS` bits of the handle and
//! the shard-local symbol in the rest, which makes name lookup a direct
//! index into the right shard.

use oxifw_mem::{StringInterner, Symbol};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{OnceLock, RwLock};

use crate::runtime::{read_lock, write_lock};

const SHARD_BITS: u32 = 4;
const NUM_SHARDS: usize = 1 << SHARD_BITS;
const SHARD_MASK: u32 = (NUM_SHARDS as u32) - 1;

/// Largest shard-local id that still fits beside the shard bits.
const MAX_LOCAL_ID: u32 = u32::MAX >> SHARD_BITS;

/// Interned method name.
///
/// ```
/// use oxifw::Selector;
///
/// let a = Selector::intern("setName:");
/// let b = Selector::intern("setName:");
/// assert_eq!(a, b);
/// assert_eq!(a.name(), "setName:");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Selector(u32);

impl Selector {
    /// Interns `name` in the process-wide table.
    ///
    /// # Panics
    ///
    /// Panics if a shard runs out of ids (more than 2^28 names in one shard).
    #[must_use]
    pub fn intern(name: &str) -> Self {
        table().intern(name)
    }

    /// Returns the selector for `name` if it was interned before.
    #[must_use]
    pub fn lookup(name: &str) -> Option<Self> {
        table().lookup(name)
    }

    /// Returns the canonical name.
    #[must_use]
    pub fn name(self) -> &'static str {
        // Handles are only minted by the global table, so resolution of a
        // handle obtained through the public API always succeeds.
        table().name(self).unwrap_or("<unknown selector>")
    }

    /// Raw handle value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Number of arguments implied by the name: one per `:`.
    #[must_use]
    pub fn arity(self) -> usize {
        self.name().bytes().filter(|&b| b == b':').count()
    }

    const fn shard(self) -> usize {
        (self.0 & SHARD_MASK) as usize
    }

    const fn symbol(self) -> Symbol {
        Symbol::new(self.0 >> SHARD_BITS)
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({})", self.name())
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&str> for Selector {
    fn from(name: &str) -> Self {
        Self::intern(name)
    }
}

/// Returns true if both selectors name the same method.
#[must_use]
pub fn sel_is_equal(a: Selector, b: Selector) -> bool {
    a == b
}

/// Sharded selector registry.
pub(crate) struct SelectorTable {
    shards: [RwLock<StringInterner>; NUM_SHARDS],
}

static TABLE: OnceLock<SelectorTable> = OnceLock::new();

fn table() -> &'static SelectorTable {
    TABLE.get_or_init(SelectorTable::new)
}

/// Number of distinct selectors interned so far.
#[must_use]
pub fn selector_count() -> usize {
    table().len()
}

impl SelectorTable {
    pub(crate) fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| RwLock::new(StringInterner::new())),
        }
    }

    fn shard_of(name: &str) -> usize {
        let mut hasher = fxhash::FxHasher::default();
        name.hash(&mut hasher);
        (hasher.finish() as u32 & SHARD_MASK) as usize
    }

    fn pack(shard: usize, sym: Symbol) -> Selector {
        let local = sym.as_u32();
        assert!(local <= MAX_LOCAL_ID, "selector shard {shard} exhausted");
        Selector((local << SHARD_BITS) | shard as u32)
    }

    pub(crate) fn intern(&self, name: &str) -> Selector {
        let shard = Self::shard_of(name);

        if let Some(sym) = read_lock(&self.shards[shard]).get(name) {
            return Self::pack(shard, sym);
        }

        // `StringInterner::intern` re-checks under the write lock, so a
        // racing thread that inserted first is found here.
        let sym = write_lock(&self.shards[shard]).intern(name);
        Self::pack(shard, sym)
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<Selector> {
        let shard = Self::shard_of(name);
        read_lock(&self.shards[shard])
            .get(name)
            .map(|sym| Self::pack(shard, sym))
    }

    pub(crate) fn name(&self, sel: Selector) -> Option<&str> {
        let guard = read_lock(&self.shards[sel.shard()]);
        let name = guard.resolve(sel.symbol())?;
        // SAFETY: the string lives in an arena chunk owned by the interner in
        // this shard. Interners only grow: chunks are never freed or moved
        // until the table itself is dropped, and `&self` keeps it alive.
        Some(unsafe { &*std::ptr::from_ref::<str>(name) })
    }

    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|s| read_lock(s).len()).sum()
    }
}
