//! Per-thread autorelease pools.
//!
//! Each thread has a stack of pool frames. [`autorelease`] hands one
//! reference to the top frame; popping a frame releases its entries in
//! reverse order. Popping a frame that is not on top first pops, and drains,
//! every frame above it.
//!
//! Releases run after the stack borrow ends, so destructors may push, pop
//! or autorelease on the same thread.
//!
//! Frames still pushed when the thread exits are drained with a warning.
//! While that happens the stack is gone: autoreleasing releases at once,
//! pushing and popping report [`Error::PoolsTornDown`], and the queries
//! report an empty stack.
//!
//! ```
//! use oxifw::runtime::autorelease;
//!
//! let outer = autorelease::push();
//! let inner = autorelease::push();
//! assert_eq!(autorelease::depth(), 2);
//! autorelease::pop(outer); // also pops `inner`
//! assert_eq!(autorelease::depth(), 0);
//! # let _ = inner;
//! ```

use std::cell::RefCell;
use std::marker::PhantomData;

use crate::error::{Error, OrFatal, Result};
use crate::runtime::object::Object;

struct Frame {
    id: u64,
    objects: Vec<Object>,
}

#[derive(Default)]
struct PoolStack {
    frames: Vec<Frame>,
    next_id: u64,
    stats: PoolStats,
}

impl Drop for PoolStack {
    fn drop(&mut self) {
        if self.frames.is_empty() {
            return;
        }
        let pending: usize = self.frames.iter().map(|f| f.objects.len()).sum();
        oxifw_log::warn!(
            "thread exited with {} autorelease pool(s) still pushed; releasing {pending} object(s)",
            self.frames.len()
        );
        while let Some(frame) = self.frames.pop() {
            drain(frame.objects);
        }
    }
}

/// Autorelease counters for the current thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Frames pushed.
    pub pushed: u64,
    /// Frames popped, explicitly or because an outer frame was popped.
    pub popped: u64,
    /// Objects autoreleased.
    pub autoreleased: u64,
    /// Largest stack depth seen.
    pub max_depth: usize,
}

thread_local! {
    static POOLS: RefCell<PoolStack> = RefCell::new(PoolStack::default());
}

/// Runs `f` on this thread's stack, or fails once the stack is torn down.
fn with_stack<R>(f: impl FnOnce(&mut PoolStack) -> R) -> Result<R> {
    POOLS
        .try_with(|cell| f(&mut cell.borrow_mut()))
        .map_err(|_| Error::PoolsTornDown)
}

/// Releases in reverse registration order.
fn drain(mut objects: Vec<Object>) {
    while let Some(object) = objects.pop() {
        drop(object);
    }
}

/// Opaque handle to a pushed pool frame. Bound to the pushing thread.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a pushed pool must be popped"]
pub struct PoolHandle {
    id: u64,
    _not_send: PhantomData<*const ()>,
}

/// Pushes a new pool frame on this thread.
///
/// # Errors
///
/// Returns [`Error::PoolsTornDown`] if the thread is exiting.
pub fn try_push() -> Result<PoolHandle> {
    with_stack(|stack| {
        let id = stack.next_id;
        stack.next_id += 1;
        stack.frames.push(Frame {
            id,
            objects: Vec::new(),
        });
        stack.stats.pushed += 1;
        stack.stats.max_depth = stack.stats.max_depth.max(stack.frames.len());
        PoolHandle {
            id,
            _not_send: PhantomData,
        }
    })
}

/// Pushes a new pool frame on this thread.
pub fn push() -> PoolHandle {
    try_push().or_fatal()
}

/// Hands `object` to the innermost pool, which releases it when popped.
///
/// # Errors
///
/// - [`Error::NoActivePool`] if no pool is pushed on this thread
/// - [`Error::PoolsTornDown`] if the thread is exiting
///
/// The object is released immediately in both cases.
pub fn try_autorelease(object: Object) -> Result<()> {
    let mut slot = Some(object);
    let outcome = with_stack(|stack| match stack.frames.last_mut() {
        Some(frame) => {
            frame.objects.extend(slot.take());
            stack.stats.autoreleased += 1;
            Ok(())
        }
        None => Err(Error::NoActivePool),
    })
    .and_then(|pushed| pushed);
    // Rejected objects are released outside the stack borrow.
    drop(slot);
    outcome
}

/// Autoreleases `object`, treating a missing pool as fatal.
///
/// During thread exit the object is released at once instead.
pub fn autorelease(object: Object) {
    match try_autorelease(object) {
        Err(Error::PoolsTornDown) => {
            oxifw_log::trace!("autorelease during thread exit; released immediately");
        }
        other => other.or_fatal(),
    }
}

/// Pops the frame for `handle` and every frame above it, innermost first.
///
/// # Errors
///
/// - [`Error::UnbalancedPool`] if `handle` is not on this thread's stack,
///   for example because an outer pool was already popped
/// - [`Error::PoolsTornDown`] if the thread is exiting; its frames are
///   drained by the teardown
pub fn try_pop(handle: PoolHandle) -> Result<()> {
    let drained = with_stack(|stack| {
        let index = stack
            .frames
            .iter()
            .rposition(|frame| frame.id == handle.id)
            .ok_or(Error::UnbalancedPool)?;
        let frames = stack.frames.split_off(index);
        stack.stats.popped += frames.len() as u64;
        Ok::<_, Error>(frames)
    })??;

    if drained.len() > 1 {
        oxifw_log::debug!("popping {} nested autorelease pool(s)", drained.len() - 1);
    }
    for frame in drained.into_iter().rev() {
        drain(frame.objects);
    }
    Ok(())
}

/// Pops a pool, treating an unbalanced pop as fatal.
pub fn pop(handle: PoolHandle) {
    try_pop(handle).or_fatal();
}

/// Number of pool frames pushed on this thread.
#[must_use]
pub fn depth() -> usize {
    with_stack(|stack| stack.frames.len()).unwrap_or(0)
}

/// Objects waiting in all of this thread's frames.
#[must_use]
pub fn pending() -> usize {
    with_stack(|stack| stack.frames.iter().map(|f| f.objects.len()).sum()).unwrap_or(0)
}

/// Counters for this thread.
#[must_use]
pub fn stats() -> PoolStats {
    with_stack(|stack| stack.stats).unwrap_or_default()
}

/// Pool scoped to a value: pushed on creation, popped on drop.
#[must_use = "the pool is popped as soon as the guard is dropped"]
pub struct AutoreleasePool {
    handle: Option<PoolHandle>,
}

impl AutoreleasePool {
    /// Pushes a pool. During thread exit the guard holds no pool.
    pub fn new() -> Self {
        let handle = match try_push() {
            Ok(handle) => Some(handle),
            Err(err) => {
                oxifw_log::trace!("no pool pushed: {err}");
                None
            }
        };
        Self { handle }
    }

    /// Pops the pool now.
    pub fn drain(mut self) {
        if let Some(handle) = self.handle.take() {
            pop(handle);
        }
    }
}

impl Default for AutoreleasePool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AutoreleasePool {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(err) = try_pop(handle)
        {
            // An outer pool, or thread teardown, already drained us.
            oxifw_log::warn!("autorelease pool guard dropped late: {err}");
        }
    }
}

/// Runs `f` inside a fresh pool.
pub fn autoreleasepool<R>(f: impl FnOnce() -> R) -> R {
    let _pool = AutoreleasePool::new();
    f()
}
