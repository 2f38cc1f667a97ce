//! The `OxiFW` object runtime.
//!
//! A [`Runtime`] owns the class, protocol and category registries plus the
//! forwarding handler. Selectors are process-wide (see [`selector`]) and
//! autorelease pools are per-thread (see [`autorelease`]), so neither is
//! tied to a runtime instance.
//!
//! # Modules
//!
//! - [`selector`]: sharded selector interning
//! - [`class`]: class metadata, method lists and method replacement
//! - [`link`]: superclass resolution, ivar layout, metaclass creation
//! - [`category`]: categories merged into linked classes
//! - [`protocol`]: protocol registration and conformance
//! - [`dtable`]: lock-free per-class dispatch tables
//! - [`dispatch`]: message sending, `+initialize` and the nil receiver
//! - [`forwarding`]: last-resort handling of dispatch misses
//! - [`object`]: instance allocation, reference counting and ivars
//! - [`autorelease`]: per-thread autorelease pool stack
//! - [`encoding`]: type encodings
//!
//! # Example
//!
//! ```
//! use oxifw::{ClassDescriptor, Method, Module, Object, Runtime, Selector, Value};
//!
//! fn speak(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
//!     Value::from("...")
//! }
//!
//! fn bark(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
//!     Value::from("Woof")
//! }
//!
//! let rt = Runtime::new();
//! rt.load(
//!     Module::new()
//!         .class(ClassDescriptor::root("Animal").method(Method::new("speak", speak)))
//!         .class(ClassDescriptor::subclass("Dog", "Animal").method(Method::new("speak", bark))),
//! );
//!
//! let dog = Object::allocate(&rt.get_class("Dog"));
//! let said: String = rt.send_as(Some(&dog), Selector::intern("speak"), &[]);
//! assert_eq!(said, "Woof");
//! ```

pub mod autorelease;
pub mod category;
pub mod class;
pub mod dispatch;
pub(crate) mod dtable;
pub mod encoding;
pub mod forwarding;
pub mod link;
pub mod object;
pub mod protocol;
pub mod selector;

pub use autorelease::{AutoreleasePool, PoolHandle, autoreleasepool};
pub use category::CategoryDescriptor;
pub use class::{
    Class, ClassDescriptor, ClassFlags, Destructor, Imp, Ivar, IvarDescriptor, Method, Property,
    PropertyAttributes,
};
pub use dispatch::{FromValue, Value, nil_imp};
pub use forwarding::ForwardingHandler;
pub use object::{IvarValue, Object};
pub use protocol::{MethodSignature, Protocol, ProtocolDescriptor, protocol_is_equal};
pub use selector::{Selector, sel_is_equal, selector_count};

use fxhash::FxBuildHasher;
use indexmap::IndexMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::RuntimeConfig;
use crate::error::{OrFatal, Result};
use category::CategoryTable;
use protocol::ProtocolTable;

#[inline]
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

#[inline]
pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) type ClassTable = IndexMap<String, Class, FxBuildHasher>;

/// Registries and settings for one object world.
///
/// Lock order, outermost first: classes, categories, protocols. Dispatch
/// takes none of them once a class's dispatch table is built.
pub struct Runtime {
    pub(crate) config: RuntimeConfig,
    pub(crate) classes: RwLock<ClassTable>,
    pub(crate) protocols: RwLock<ProtocolTable>,
    pub(crate) categories: Mutex<CategoryTable>,
    pub(crate) forwarding: RwLock<Option<ForwardingHandler>>,
}

impl Runtime {
    /// Creates an empty runtime with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Creates an empty runtime.
    ///
    /// A configured log level is applied to the process-wide logger.
    #[must_use]
    pub fn with_config(config: RuntimeConfig) -> Self {
        if let Some(level) = config.log_level {
            oxifw_log::set_level(level);
        }
        Self {
            config,
            classes: RwLock::new(IndexMap::default()),
            protocols: RwLock::new(IndexMap::default()),
            categories: Mutex::new(CategoryTable::default()),
            forwarding: RwLock::new(None),
        }
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Registers everything in `module`, links and merges its categories.
    ///
    /// Protocols are registered as one batch, then classes, then the
    /// registry is linked, then categories are registered.
    ///
    /// # Errors
    ///
    /// Returns the first registration or link error. Entities registered
    /// before the failure stay registered.
    pub fn try_load(&self, module: Module) -> Result<usize> {
        let Module {
            protocols,
            classes,
            categories,
        } = module;

        if !protocols.is_empty() {
            self.try_register_protocols(&protocols)?;
        }
        for class in classes {
            self.try_register_class(class)?;
        }
        let linked = self.try_link()?;
        for category in categories {
            self.try_register_category(category)?;
        }
        oxifw_log::debug!("loaded module, {linked} class(es) linked");
        Ok(linked)
    }

    /// Loads a module, treating failure as fatal. Returns the number of
    /// classes linked.
    pub fn load(&self, module: Module) -> usize {
        self.try_load(module).or_fatal()
    }

    /// Drops every registered class, protocol, pending category and the
    /// forwarding handler.
    ///
    /// Instances that outlive this keep their classes alive.
    pub fn shutdown(&self) {
        let classes = std::mem::take(&mut *write_lock(&self.classes));
        let categories = std::mem::take(&mut *lock(&self.categories));
        let protocols = std::mem::take(&mut *write_lock(&self.protocols));
        self.clear_forwarding_handler();
        oxifw_log::debug!(
            "runtime shut down: {} class(es), {} protocol(s), {} pending category(ies)",
            classes.len(),
            protocols.len(),
            categories.pending_len()
        );
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("classes", &read_lock(&self.classes).len())
            .field("protocols", &read_lock(&self.protocols).len())
            .field("forwarding", &self.has_forwarding_handler())
            .finish_non_exhaustive()
    }
}

/// Process-wide runtime, configured from the environment on first use.
///
/// An unparsable setting is logged and the defaults are used instead.
pub fn global() -> &'static Runtime {
    static GLOBAL: OnceLock<Runtime> = OnceLock::new();
    GLOBAL.get_or_init(|| {
        let config = RuntimeConfig::from_env().unwrap_or_else(|err| {
            oxifw_log::warn!("{err}; using default runtime configuration");
            RuntimeConfig::default()
        });
        Runtime::with_config(config)
    })
}

/// A unit of metadata loaded together, as a compiler would emit per
/// translation unit.
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// Protocols, registered as one batch.
    pub protocols: Vec<ProtocolDescriptor>,
    /// Classes, registered in order before linking.
    pub classes: Vec<ClassDescriptor>,
    /// Categories, registered after linking.
    pub categories: Vec<CategoryDescriptor>,
}

impl Module {
    /// Creates an empty module.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: ProtocolDescriptor) -> Self {
        self.protocols.push(protocol);
        self
    }

    /// Adds a class.
    #[must_use]
    pub fn class(mut self, class: ClassDescriptor) -> Self {
        self.classes.push(class);
        self
    }

    /// Adds a category.
    #[must_use]
    pub fn category(mut self, category: CategoryDescriptor) -> Self {
        self.categories.push(category);
        self
    }
}
