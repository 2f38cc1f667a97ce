//! Forwarding: last-resort handling of dispatch misses.
//!
//! Each runtime has one forwarding handler slot; the last installed handler
//! wins. On a miss the handler is asked for an implementation for
//! `(receiver, selector)` and, if it supplies one, that implementation is
//! invoked with the original arguments. Otherwise the send fails with
//! [`Error::DoesNotUnderstand`].
//!
//! The handler is cloned out of its slot before it runs, so it may install
//! a new handler or send messages itself.
//!
//! # Loop detection
//!
//! A per-thread depth counter is held for the whole forwarded invocation.
//! Forwarding that re-enters forwarding more than
//! [`RuntimeConfig::max_forwarding_depth`](crate::RuntimeConfig) times fails
//! with [`Error::ForwardingLoop`].

use std::cell::Cell;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::runtime::class::Imp;
use crate::runtime::dispatch::Value;
use crate::runtime::object::Object;
use crate::runtime::selector::Selector;
use crate::runtime::{Runtime, read_lock, write_lock};

/// Supplies an implementation for a selector the receiver's class lacks.
pub type ForwardingHandler = Arc<dyn Fn(&Object, Selector) -> Option<Imp> + Send + Sync>;

thread_local! {
    static FORWARDING_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Holds one level of forwarding depth on this thread.
struct DepthGuard;

impl DepthGuard {
    fn enter(max: u32, sel: Selector) -> Result<Self> {
        FORWARDING_DEPTH.with(|depth| {
            let current = depth.get();
            if current >= max {
                Err(Error::ForwardingLoop {
                    selector: sel.name().to_string(),
                    depth: current,
                })
            } else {
                depth.set(current + 1);
                Ok(DepthGuard)
            }
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        FORWARDING_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Forwarding depth currently held on this thread.
#[must_use]
pub fn forwarding_depth() -> u32 {
    FORWARDING_DEPTH.with(Cell::get)
}

impl Runtime {
    /// Installs the forwarding handler, replacing any previous one.
    ///
    /// ```
    /// use oxifw::{ClassDescriptor, Imp, Object, Runtime, Selector, Value};
    ///
    /// fn fallback(_: &Runtime, _: &Object, sel: Selector, _: &[Value]) -> Value {
    ///     Value::from(sel.name())
    /// }
    ///
    /// let rt = Runtime::new();
    /// rt.register_class(ClassDescriptor::root("Empty"));
    /// rt.link();
    /// rt.set_forwarding_handler(|_, _| Some(fallback as Imp));
    ///
    /// let obj = Object::allocate(&rt.get_class("Empty"));
    /// let got = rt.send(Some(&obj), Selector::intern("anything"), &[]);
    /// assert_eq!(got.as_str(), Some("anything"));
    /// ```
    pub fn set_forwarding_handler<F>(&self, handler: F)
    where
        F: Fn(&Object, Selector) -> Option<Imp> + Send + Sync + 'static,
    {
        *write_lock(&self.forwarding) = Some(Arc::new(handler));
        oxifw_log::debug!("forwarding handler installed");
    }

    /// Removes the forwarding handler.
    pub fn clear_forwarding_handler(&self) {
        write_lock(&self.forwarding).take();
    }

    /// Returns true if a forwarding handler is installed.
    #[must_use]
    pub fn has_forwarding_handler(&self) -> bool {
        read_lock(&self.forwarding).is_some()
    }

    fn handler(&self) -> Option<ForwardingHandler> {
        read_lock(&self.forwarding).clone()
    }

    fn does_not_understand(receiver: &Object, sel: Selector) -> Error {
        Error::DoesNotUnderstand {
            class: receiver.class_name().to_string(),
            selector: sel.name().to_string(),
        }
    }

    /// Asks the handler for an implementation without invoking it.
    pub(crate) fn forwarding_target(&self, receiver: &Object, sel: Selector) -> Result<Imp> {
        self.handler()
            .and_then(|handler| handler(receiver, sel))
            .ok_or_else(|| Self::does_not_understand(receiver, sel))
    }

    /// Handles a dispatch miss.
    pub(crate) fn forward(&self, receiver: &Object, sel: Selector, args: &[Value]) -> Result<Value> {
        let _depth = DepthGuard::enter(self.config.max_forwarding_depth, sel)?;
        let imp = self.forwarding_target(receiver, sel)?;
        oxifw_log::debug!("forwarding -[{} {}]", receiver.class_name(), sel);
        Ok(imp(self, receiver, sel, args))
    }
}
