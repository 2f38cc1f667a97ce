//! `OxiFW`: a dynamic object runtime.
//!
//! `OxiFW` gives compiled code an object model with late binding:
//!
//! - **Selectors** interned process-wide and compared by handle
//! - **Classes and metaclasses** registered from descriptors and linked by
//!   name, with categories merged at or after link time
//! - **Message dispatch** through lock-free per-class dispatch tables, with
//!   super sends, a nil receiver that answers zero, and forwarding
//! - **Protocols** with transitive adoption and inherited conformance
//! - **Reference-counted instances** with per-class destructors and typed
//!   ivar access
//! - **Autorelease pools** scoped per thread
//!
//! # Example
//!
//! ```rust
//! use oxifw::{ClassDescriptor, Method, Object, Runtime, Selector, Value};
//!
//! fn speak(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
//!     Value::from("...")
//! }
//!
//! fn bark(rt: &Runtime, dog: &Object, sel: Selector, args: &[Value]) -> Value {
//!     let animal = rt.get_class("Dog");
//!     let _generic = rt.send_super(Some(dog), &animal, sel, args);
//!     Value::from("Woof")
//! }
//!
//! let rt = Runtime::new();
//! rt.register_class(ClassDescriptor::root("Animal").method(Method::new("speak", speak)));
//! rt.register_class(ClassDescriptor::subclass("Dog", "Animal").method(Method::new("speak", bark)));
//! rt.link();
//!
//! let dog = Object::allocate(&rt.get_class("Dog"));
//! let speak = Selector::intern("speak");
//! assert_eq!(rt.send_as::<String>(Some(&dog), speak, &[]), "Woof");
//! assert_eq!(rt.send(None, speak, &[]), Value::Nil);
//! ```

pub mod config;
pub mod error;
pub mod runtime;

pub use config::RuntimeConfig;
pub use error::{Error, Result, fatal};
pub use runtime::autorelease::{self, AutoreleasePool, autoreleasepool};
pub use runtime::{
    CategoryDescriptor, Class, ClassDescriptor, ClassFlags, Destructor, FromValue,
    ForwardingHandler, Imp, Ivar, IvarDescriptor, IvarValue, Method, MethodSignature, Module,
    Object, Property, PropertyAttributes, Protocol, ProtocolDescriptor, Runtime, Selector, Value,
    global, nil_imp, protocol_is_equal, sel_is_equal,
};
