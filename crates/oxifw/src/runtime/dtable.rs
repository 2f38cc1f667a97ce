//! Per-class dispatch tables.
//!
//! A [`DTableSlot`] publishes at most one flattened selector to
//! implementation map at a time through an `ArcSwapOption`. Readers load it
//! and probe the map without taking any lock. Writers (a build or an
//! invalidation) serialise on the slot's mutex.
//!
//! An invalidated table is freed as soon as the last reader that loaded it
//! lets go.

use arc_swap::ArcSwapOption;
use fxhash::FxBuildHasher;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::runtime::class::Imp;
use crate::runtime::lock;
use crate::runtime::selector::Selector;

/// Flattened selector to implementation map.
pub(crate) type DTable = hashbrown::HashMap<Selector, Imp, FxBuildHasher>;

pub(crate) struct DTableSlot {
    current: ArcSwapOption<DTable>,
    /// Held for every build and invalidation.
    writer: Mutex<()>,
    builds: AtomicU32,
}

impl DTableSlot {
    pub(crate) fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            writer: Mutex::new(()),
            builds: AtomicU32::new(0),
        }
    }

    /// Probes the published table. `None` if no table is published.
    #[inline]
    pub(crate) fn probe(&self, sel: Selector) -> Option<Option<Imp>> {
        let guard = self.current.load();
        Option::as_ref(&*guard).map(|table| table.get(&sel).copied())
    }

    /// Returns the published table, building it with `build` if there is
    /// none. Concurrent callers build at most once.
    pub(crate) fn get_or_build(&self, build: impl FnOnce() -> DTable) -> Arc<DTable> {
        if let Some(table) = self.current.load_full() {
            return table;
        }

        let _writer = lock(&self.writer);
        if let Some(table) = self.current.load_full() {
            return table;
        }

        let table = Arc::new(build());
        self.current.store(Some(Arc::clone(&table)));
        self.builds.fetch_add(1, Ordering::Relaxed);
        table
    }

    /// Unpublishes the current table. Returns false if none was published.
    pub(crate) fn invalidate(&self) -> bool {
        let _writer = lock(&self.writer);
        self.current.swap(None).is_some()
    }

    pub(crate) fn is_built(&self) -> bool {
        self.current.load().is_some()
    }

    pub(crate) fn builds(&self) -> u32 {
        self.builds.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::runtime::dispatch::Value;
    use crate::runtime::object::Object;

    fn imp(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
        Value::Nil
    }

    fn table_with(name: &str) -> DTable {
        let mut table = DTable::default();
        table.insert(Selector::intern(name), imp as Imp);
        table
    }

    #[test]
    fn test_build_once() {
        let slot = DTableSlot::new();
        assert!(slot.probe(Selector::intern("x")).is_none());
        assert!(!slot.is_built());

        let table = slot.get_or_build(|| table_with("x"));
        assert!(table.contains_key(&Selector::intern("x")));
        slot.get_or_build(|| panic!("must not rebuild"));
        assert_eq!(slot.builds(), 1);
        assert!(slot.is_built());
        assert!(slot.probe(Selector::intern("x")).is_some_and(|imp| imp.is_some()));
        assert!(matches!(slot.probe(Selector::intern("y")), Some(None)));
    }

    #[test]
    fn test_invalidated_table_outlives_its_readers_only() {
        let slot = DTableSlot::new();
        assert!(!slot.invalidate());

        let old = slot.get_or_build(|| table_with("old"));
        assert!(slot.invalidate());
        assert!(!slot.is_built());
        // Still readable through the reader's handle, owned by nobody else.
        assert!(old.contains_key(&Selector::intern("old")));
        assert_eq!(Arc::strong_count(&old), 1);

        let new = slot.get_or_build(|| table_with("new"));
        assert!(new.contains_key(&Selector::intern("new")));
        assert_eq!(slot.builds(), 2);
    }

    #[test]
    fn test_repeated_invalidation_frees_old_tables() {
        let slot = DTableSlot::new();
        let sel = Selector::intern("churn");
        let mut dropped = Vec::new();
        for _ in 0..10_000 {
            assert!(slot.probe(sel).is_none());
            let table = slot.get_or_build(|| table_with("churn"));
            assert!(slot.probe(sel).is_some_and(|imp| imp.is_some()));
            dropped.push(Arc::downgrade(&table));
            drop(table);
            assert!(slot.invalidate());
        }
        assert!(dropped.iter().all(|weak| weak.upgrade().is_none()));
        assert_eq!(slot.builds(), 10_000);
    }

    #[test]
    fn test_concurrent_builds_agree() {
        let slot = Arc::new(DTableSlot::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let slot = Arc::clone(&slot);
                std::thread::spawn(move || {
                    let table = slot.get_or_build(|| table_with("shared"));
                    Arc::as_ptr(&table) as usize
                })
            })
            .collect();
        let addrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addrs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(slot.builds(), 1);
    }
}
