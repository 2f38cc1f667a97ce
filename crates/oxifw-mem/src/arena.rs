//! Bump-pointer arena for interned string bytes.
//!
//! The arena hands out byte ranges from a list of fixed chunks. A chunk is
//! never moved or freed while the arena lives, so every pointer returned by
//! [`Arena::alloc_str`] stays valid until the arena is dropped. Chunks grow
//! geometrically up to [`MAX_CHUNK_SIZE`]; a request bigger than that gets a
//! dedicated chunk of its own.
//!
//! # Example
//!
//! ```
//! use oxifw_mem::arena::Arena;
//!
//! let mut arena = Arena::new(4096);
//! let name = arena.alloc_str("initWithName:");
//! // SAFETY: the arena is still alive and was not reset.
//! assert_eq!(unsafe { name.as_ref() }, "initWithName:");
//! ```

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Smallest chunk the arena will allocate.
pub const MIN_CHUNK_SIZE: usize = 4096;

/// Largest chunk produced by geometric growth.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// One contiguous block owned by the arena.
struct Chunk {
    start: NonNull<u8>,
    used: usize,
    capacity: usize,
}

impl Chunk {
    fn new(capacity: usize) -> Self {
        let layout = Self::layout(capacity);
        // SAFETY: layout has a non-zero size (capacity >= 1 is enforced by
        // every caller through `max(MIN_CHUNK_SIZE)` or `max(1)`).
        let raw = unsafe { alloc::alloc(layout) };
        let Some(start) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        Chunk {
            start,
            used: 0,
            capacity,
        }
    }

    fn layout(capacity: usize) -> Layout {
        match Layout::from_size_align(capacity, 1) {
            Ok(layout) => layout,
            Err(_) => alloc::handle_alloc_error(Layout::new::<u8>()),
        }
    }

    #[inline]
    fn try_alloc(&mut self, len: usize) -> Option<NonNull<u8>> {
        let end = self.used.checked_add(len)?;
        if end > self.capacity {
            return None;
        }
        // SAFETY: `used + len <= capacity`, so the offset stays inside the
        // block allocated in `new`.
        let ptr = unsafe { self.start.add(self.used) };
        self.used = end;
        Some(ptr)
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: `start` came from `alloc::alloc` with exactly this layout.
        unsafe { alloc::dealloc(self.start.as_ptr(), Self::layout(self.capacity)) }
    }
}

/// Growable bump arena.
///
/// Allocation needs `&mut self`; shared references only read previously
/// returned ranges, which the arena never touches again.
pub struct Arena {
    chunks: Vec<Chunk>,
    next_size: usize,
}

// SAFETY: the arena exclusively owns its chunks and has no thread affinity.
// Mutation requires `&mut Arena`, so sharing `&Arena` across threads exposes
// nothing but immutable bytes.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Creates an arena whose first chunk holds at least `initial_size` bytes.
    #[must_use]
    pub fn new(initial_size: usize) -> Self {
        let size = initial_size.max(MIN_CHUNK_SIZE).next_power_of_two();
        Arena {
            chunks: vec![Chunk::new(size)],
            next_size: (size * 2).min(MAX_CHUNK_SIZE),
        }
    }

    /// Copies `s` into the arena and returns a pointer to the copy.
    ///
    /// The returned pointer is valid for as long as the arena lives.
    pub fn alloc_str(&mut self, s: &str) -> NonNull<str> {
        let len = s.len();
        let dst = self.alloc_bytes(len);
        // SAFETY: `dst` is valid for `len` freshly reserved bytes that no
        // other pointer aliases, and `s` is valid for `len` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(s.as_ptr(), dst.as_ptr(), len);
        }
        let bytes = NonNull::slice_from_raw_parts(dst, len);
        // SAFETY: the bytes are an exact copy of a `str`, hence valid UTF-8.
        // `[u8]` and `str` share layout, so the fat pointer cast is sound.
        unsafe { NonNull::new_unchecked(bytes.as_ptr() as *mut str) }
    }

    fn alloc_bytes(&mut self, len: usize) -> NonNull<u8> {
        if let Some(chunk) = self.chunks.last_mut()
            && let Some(ptr) = chunk.try_alloc(len)
        {
            return ptr;
        }

        let capacity = self.next_size.max(len).max(1);
        self.next_size = (self.next_size * 2).min(MAX_CHUNK_SIZE);
        let mut chunk = Chunk::new(capacity);
        let ptr = chunk
            .try_alloc(len)
            .unwrap_or_else(|| alloc::handle_alloc_error(Chunk::layout(capacity)));
        self.chunks.push(chunk);
        ptr
    }

    /// Number of chunks currently owned.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Total bytes handed out so far.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.used).sum()
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new(MIN_CHUNK_SIZE)
    }
}
