//! Classes, metaclasses and their method lists.
//!
//! A class starts life as a [`ClassDescriptor`]: plain metadata whose
//! superclass and protocols are referenced by name. Registration turns it
//! into a [`Class`] in the `REGISTERED` state; linking (see
//! [`link`](crate::runtime::link)) resolves the superclass, lays out the
//! ivars, builds the metaclass and sets `LINKED`.
//!
//! # Method lists and dispatch tables
//!
//! Each class owns an insertion-ordered method list keyed by selector. The
//! flattened view used by dispatch lives in the class's [`DTableSlot`] and is
//! rebuilt lazily from the list and all ancestors' lists after
//! [`Runtime::replace_method`] or a category merge invalidates it.
//!
//! # Ownership
//!
//! - a class holds its superclass and metaclass strongly
//! - subclasses are tracked weakly, only for invalidation
//! - the root metaclass points back to the root class weakly
//!
//! so the graph has no strong cycles and a class lives as long as its
//! runtime or its longest-lived instance.

use bitflags::bitflags;
use fxhash::FxBuildHasher;
use indexmap::IndexMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::thread::{self, ThreadId};

use crate::error::{Error, OrFatal, Result};
use crate::runtime::dispatch::Value;
use crate::runtime::dtable::{DTable, DTableSlot};
use crate::runtime::encoding::{self, ivar_layout};
use crate::runtime::object::Object;
use crate::runtime::protocol::Protocol;
use crate::runtime::selector::Selector;
use crate::runtime::{Runtime, lock, read_lock, write_lock};

/// Method implementation.
///
/// Receives the runtime performing the send, the receiver, the selector that
/// was sent and the arguments.
pub type Imp = fn(&Runtime, &Object, Selector, &[Value]) -> Value;

/// Per-class teardown hook, run most-derived first when an instance dies.
///
/// Hooks see the instance with its ivars still in place. They must not keep
/// a reference to it.
pub type Destructor = fn(&Object);

bitflags! {
    /// Lifecycle state of a class.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClassFlags: u8 {
        /// Present in a runtime registry.
        const REGISTERED = 1 << 0;
        /// Superclass resolved and ivars laid out.
        const LINKED = 1 << 1;
        /// A dispatch table is currently published.
        const DTABLE_BUILT = 1 << 2;
        /// `+initialize` has run.
        const INITIALIZED = 1 << 3;
        /// This is the class of a class object.
        const METACLASS = 1 << 4;
    }
}

bitflags! {
    /// Declared attributes of a [`Property`].
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct PropertyAttributes: u8 {
        /// No setter.
        const READONLY = 0x01;
        /// A custom getter name is set.
        const GETTER = 0x02;
        /// Setter stores the value as is.
        const ASSIGN = 0x04;
        /// Getter and setter.
        const READWRITE = 0x08;
        /// Setter retains the new value.
        const RETAIN = 0x10;
        /// Setter stores a copy.
        const COPY = 0x20;
        /// Accessors take no lock.
        const NONATOMIC = 0x40;
        /// A custom setter name is set.
        const SETTER = 0x80;
    }
}

/// Declared property.
///
/// Only metadata: the accessors are ordinary methods the class defines.
///
/// ```
/// use oxifw::{Property, PropertyAttributes, Selector};
///
/// let blocking = Property::new("blocking", PropertyAttributes::READWRITE).getter("isBlocking");
/// assert_eq!(blocking.getter_selector(), Selector::intern("isBlocking"));
/// assert_eq!(blocking.setter_selector(), Some(Selector::intern("setBlocking:")));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// Property name.
    pub name: String,
    /// Declared attributes.
    pub attributes: PropertyAttributes,
    /// Optional type encoding of the value.
    pub types: Option<String>,
    /// Custom getter name.
    pub getter: Option<String>,
    /// Custom setter name.
    pub setter: Option<String>,
}

impl Property {
    /// Declares `name` with `attributes`.
    #[must_use]
    pub fn new(name: &str, attributes: PropertyAttributes) -> Self {
        Self {
            name: name.to_string(),
            attributes,
            types: None,
            getter: None,
            setter: None,
        }
    }

    /// Sets the value's type encoding.
    #[must_use]
    pub fn with_types(mut self, types: &str) -> Self {
        self.types = Some(types.to_string());
        self
    }

    /// Uses `name` instead of the property name for the getter.
    #[must_use]
    pub fn getter(mut self, name: &str) -> Self {
        self.getter = Some(name.to_string());
        self.attributes |= PropertyAttributes::GETTER;
        self
    }

    /// Uses `name` instead of `set<Name>:` for the setter.
    #[must_use]
    pub fn setter(mut self, name: &str) -> Self {
        self.setter = Some(name.to_string());
        self.attributes |= PropertyAttributes::SETTER;
        self
    }

    /// Selector of the getter.
    #[must_use]
    pub fn getter_selector(&self) -> Selector {
        Selector::intern(self.getter.as_deref().unwrap_or(&self.name))
    }

    /// Selector of the setter; `None` for read-only properties.
    #[must_use]
    pub fn setter_selector(&self) -> Option<Selector> {
        if self.attributes.contains(PropertyAttributes::READONLY) {
            return None;
        }
        if let Some(setter) = &self.setter {
            return Some(Selector::intern(setter));
        }
        let mut chars = self.name.chars();
        let head: String = chars.next().map(char::to_uppercase).into_iter().flatten().collect();
        Some(Selector::intern(&format!("set{head}{}:", chars.as_str())))
    }
}

/// A selector bound to an implementation.
#[derive(Debug, Clone)]
pub struct Method {
    /// Method name.
    pub selector: Selector,
    /// Implementation.
    pub imp: Imp,
    /// Optional signature, see [`encoding`](crate::runtime::encoding).
    pub types: Option<Arc<str>>,
}

impl Method {
    /// Creates an untyped method.
    #[must_use]
    pub fn new(name: &str, imp: Imp) -> Self {
        Self {
            selector: Selector::intern(name),
            imp,
            types: None,
        }
    }

    /// Attaches a type signature such as `"v@:"`.
    #[must_use]
    pub fn with_types(mut self, types: &str) -> Self {
        self.types = Some(Arc::from(types));
        self
    }

    fn validate(&self) -> Result<()> {
        match &self.types {
            Some(types) => encoding::validate_method_encoding(types),
            None => Ok(()),
        }
    }

    fn same_as(&self, other: &Method) -> bool {
        self.selector == other.selector
            && std::ptr::fn_addr_eq(self.imp, other.imp)
            && self.types == other.types
    }
}

/// Declared instance variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvarDescriptor {
    /// Ivar name, unique within its class.
    pub name: String,
    /// Single-character type encoding.
    pub types: String,
}

/// Instance variable after layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ivar {
    /// Ivar name.
    pub name: Arc<str>,
    /// Type encoding character.
    pub type_char: char,
    /// Size in bytes.
    pub size: usize,
    /// Byte offset from the start of the instance.
    pub offset: usize,
}

/// Class metadata as produced by a code generator.
///
/// ```
/// use oxifw::{ClassDescriptor, Method, Object, Runtime, Selector, Value};
///
/// fn speak(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
///     Value::from("...")
/// }
///
/// let animal = ClassDescriptor::root("Animal")
///     .ivar("legs", "i")
///     .method(Method::new("speak", speak).with_types("@@:"));
/// assert_eq!(animal.superclass, None);
/// ```
#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    /// Class name, unique within a runtime.
    pub name: String,
    /// Superclass name; `None` only for root classes.
    pub superclass: Option<String>,
    /// Ivars declared by this class, in layout order.
    pub ivars: Vec<IvarDescriptor>,
    /// Instance methods.
    pub methods: Vec<Method>,
    /// Class methods, installed on the metaclass.
    pub class_methods: Vec<Method>,
    /// Names of adopted protocols.
    pub protocols: Vec<String>,
    /// Declared properties.
    pub properties: Vec<Property>,
    /// Teardown hook for this class's ivars.
    pub destructor: Option<Destructor>,
}

impl ClassDescriptor {
    /// Starts a root class.
    #[must_use]
    pub fn root(name: &str) -> Self {
        Self {
            name: name.to_string(),
            superclass: None,
            ivars: Vec::new(),
            methods: Vec::new(),
            class_methods: Vec::new(),
            protocols: Vec::new(),
            properties: Vec::new(),
            destructor: None,
        }
    }

    /// Starts a subclass of `superclass`.
    #[must_use]
    pub fn subclass(name: &str, superclass: &str) -> Self {
        Self {
            superclass: Some(superclass.to_string()),
            ..Self::root(name)
        }
    }

    /// Declares an ivar.
    #[must_use]
    pub fn ivar(mut self, name: &str, types: &str) -> Self {
        self.ivars.push(IvarDescriptor {
            name: name.to_string(),
            types: types.to_string(),
        });
        self
    }

    /// Adds an instance method.
    #[must_use]
    pub fn method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    /// Adds a class method.
    #[must_use]
    pub fn class_method(mut self, method: Method) -> Self {
        self.class_methods.push(method);
        self
    }

    /// Adopts a protocol by name.
    #[must_use]
    pub fn adopts(mut self, protocol: &str) -> Self {
        self.protocols.push(protocol.to_string());
        self
    }

    /// Declares a property.
    #[must_use]
    pub fn property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    /// Sets the destructor hook.
    #[must_use]
    pub fn destructor(mut self, destructor: Destructor) -> Self {
        self.destructor = Some(destructor);
        self
    }

    fn same_metadata(&self, other: &ClassDescriptor) -> bool {
        fn same_methods(a: &[Method], b: &[Method]) -> bool {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
        }
        let same_destructor = match (self.destructor, other.destructor) {
            (None, None) => true,
            (Some(a), Some(b)) => std::ptr::fn_addr_eq(a, b),
            _ => false,
        };

        self.name == other.name
            && self.superclass == other.superclass
            && self.ivars == other.ivars
            && self.protocols == other.protocols
            && self.properties == other.properties
            && same_methods(&self.methods, &other.methods)
            && same_methods(&self.class_methods, &other.class_methods)
            && same_destructor
    }

    fn validate(&self) -> Result<()> {
        for method in self.methods.iter().chain(&self.class_methods) {
            method.validate()?;
        }
        for (i, ivar) in self.ivars.iter().enumerate() {
            ivar_layout(&ivar.types)?;
            if self.ivars[..i].iter().any(|other| other.name == ivar.name) {
                return Err(Error::DuplicateRegistration {
                    name: format!("{}.{}", self.name, ivar.name),
                });
            }
        }
        for (i, property) in self.properties.iter().enumerate() {
            if self.properties[..i].iter().any(|other| other.name == property.name) {
                return Err(Error::DuplicateRegistration {
                    name: format!("{}.{}", self.name, property.name),
                });
            }
        }
        Ok(())
    }
}

pub(crate) type MethodList = IndexMap<Selector, Method, FxBuildHasher>;

fn method_list(methods: &[Method]) -> MethodList {
    let mut list = MethodList::with_capacity_and_hasher(methods.len(), FxBuildHasher::default());
    for method in methods {
        list.insert(method.selector, method.clone());
    }
    list
}

/// Link from a class to its superclass.
enum SuperLink {
    None,
    Strong(Class),
    /// Root metaclass to root class.
    Root(Weak<ClassInner>),
}

#[derive(Debug)]
pub(crate) struct Layout {
    pub(crate) instance_size: usize,
    pub(crate) ivars: Vec<Ivar>,
}

#[derive(Default)]
struct InitState {
    owner: Mutex<Option<ThreadId>>,
    done: Condvar,
}

pub(crate) struct ClassInner {
    name: Arc<str>,
    descriptor: Option<ClassDescriptor>,
    flags: AtomicU8,
    superclass: OnceLock<SuperLink>,
    metaclass: OnceLock<Class>,
    instance_class: Option<Weak<ClassInner>>,
    layout: OnceLock<Layout>,
    methods: RwLock<MethodList>,
    protocols: RwLock<Vec<Protocol>>,
    subclasses: Mutex<Vec<Weak<ClassInner>>>,
    class_object: OnceLock<Object>,
    destructor: Option<Destructor>,
    dtable: DTableSlot,
    init: InitState,
}

/// Shared handle to a registered class or metaclass.
///
/// Equality and hashing use identity.
#[derive(Clone)]
pub struct Class(Arc<ClassInner>);

impl Class {
    pub(crate) fn from_descriptor(descriptor: ClassDescriptor) -> Result<Self> {
        descriptor.validate()?;
        let inner = ClassInner {
            name: Arc::from(descriptor.name.as_str()),
            flags: AtomicU8::new(ClassFlags::REGISTERED.bits()),
            superclass: OnceLock::new(),
            metaclass: OnceLock::new(),
            instance_class: None,
            layout: OnceLock::new(),
            methods: RwLock::new(method_list(&descriptor.methods)),
            protocols: RwLock::new(Vec::new()),
            subclasses: Mutex::new(Vec::new()),
            class_object: OnceLock::new(),
            destructor: descriptor.destructor,
            dtable: DTableSlot::new(),
            init: InitState::default(),
            descriptor: Some(descriptor),
        };
        Ok(Class(Arc::new(inner)))
    }

    /// Builds and links the metaclass of `class`.
    pub(crate) fn new_metaclass(class: &Class, superclass: Option<&Class>) -> Class {
        let class_methods = class
            .0
            .descriptor
            .as_ref()
            .map(|d| method_list(&d.class_methods))
            .unwrap_or_default();

        let link = match superclass.and_then(Class::metaclass) {
            Some(super_meta) => SuperLink::Strong(super_meta),
            None => SuperLink::Root(Arc::downgrade(&class.0)),
        };

        let flags = ClassFlags::REGISTERED | ClassFlags::LINKED | ClassFlags::METACLASS;
        let meta = Class(Arc::new(ClassInner {
            name: Arc::clone(&class.0.name),
            descriptor: None,
            flags: AtomicU8::new(flags.bits()),
            superclass: OnceLock::new(),
            metaclass: OnceLock::new(),
            instance_class: Some(Arc::downgrade(&class.0)),
            layout: OnceLock::new(),
            methods: RwLock::new(class_methods),
            protocols: RwLock::new(Vec::new()),
            subclasses: Mutex::new(Vec::new()),
            class_object: OnceLock::new(),
            destructor: None,
            dtable: DTableSlot::new(),
            init: InitState::default(),
        }));

        let _ = meta.0.layout.set(Layout {
            instance_size: std::mem::size_of::<usize>(),
            ivars: Vec::new(),
        });
        match &link {
            SuperLink::Strong(parent) => parent.add_subclass(&meta),
            SuperLink::Root(_) => class.add_subclass(&meta),
            SuperLink::None => {}
        }
        let _ = meta.0.superclass.set(link);
        meta
    }

    /// Records the results of linking and marks the class `LINKED`.
    pub(crate) fn finish_link(
        &self,
        superclass: Option<Class>,
        layout: Layout,
        metaclass: Class,
        protocols: Vec<Protocol>,
    ) {
        if let Some(parent) = &superclass {
            parent.add_subclass(self);
        }
        let link = superclass.map_or(SuperLink::None, SuperLink::Strong);
        let _ = self.0.superclass.set(link);
        let _ = self.0.layout.set(layout);
        let _ = self.0.class_object.set(Object::new_class_object(&metaclass));
        let _ = self.0.metaclass.set(metaclass);
        *write_lock(&self.0.protocols) = protocols;
        self.set_flag(ClassFlags::LINKED);
    }

    fn add_subclass(&self, sub: &Class) {
        lock(&self.0.subclasses).push(Arc::downgrade(&sub.0));
    }

    fn set_flag(&self, flag: ClassFlags) {
        self.0.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    fn has_flag(&self, flag: ClassFlags) -> bool {
        self.0.flags.load(Ordering::Acquire) & flag.bits() == flag.bits()
    }

    /// Class name. A metaclass shares the name of its class.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Current lifecycle flags.
    #[must_use]
    pub fn flags(&self) -> ClassFlags {
        let mut flags = ClassFlags::from_bits_truncate(self.0.flags.load(Ordering::Acquire));
        flags.set(ClassFlags::DTABLE_BUILT, self.0.dtable.is_built());
        flags
    }

    /// Returns true once linking completed.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.has_flag(ClassFlags::LINKED)
    }

    /// Returns true once `+initialize` has run.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.has_flag(ClassFlags::INITIALIZED)
    }

    /// Returns true for metaclasses.
    #[must_use]
    pub fn is_metaclass(&self) -> bool {
        self.has_flag(ClassFlags::METACLASS)
    }

    /// Superclass, or `None` for a root class or an unlinked class.
    ///
    /// The superclass of the root metaclass is the root class.
    #[must_use]
    pub fn superclass(&self) -> Option<Class> {
        match self.0.superclass.get()? {
            SuperLink::None => None,
            SuperLink::Strong(class) => Some(class.clone()),
            SuperLink::Root(weak) => weak.upgrade().map(Class),
        }
    }

    /// Name of the declared superclass, available before linking.
    #[must_use]
    pub fn superclass_name(&self) -> Option<&str> {
        self.0.descriptor.as_ref()?.superclass.as_deref()
    }

    /// Metaclass, once linked. Metaclasses themselves return `None`.
    #[must_use]
    pub fn metaclass(&self) -> Option<Class> {
        self.0.metaclass.get().cloned()
    }

    /// For a metaclass, the class whose class object it describes.
    #[must_use]
    pub fn instance_class(&self) -> Option<Class> {
        self.0.instance_class.as_ref()?.upgrade().map(Class)
    }

    /// The object standing for this class as a message receiver.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotLinked`] before linking.
    pub fn class_object(&self) -> Result<Object> {
        self.0.class_object.get().cloned().ok_or_else(|| self.not_linked())
    }

    /// Instance size in bytes, including the class pointer slot.
    #[must_use]
    pub fn instance_size(&self) -> Option<usize> {
        self.0.layout.get().map(|l| l.instance_size)
    }

    /// Ivars declared by this class itself, after layout.
    #[must_use]
    pub fn ivars(&self) -> Vec<Ivar> {
        self.0.layout.get().map(|l| l.ivars.clone()).unwrap_or_default()
    }

    /// Finds an ivar by name in this class or its ancestors.
    #[must_use]
    pub fn ivar(&self, name: &str) -> Option<Ivar> {
        let mut current = Some(self.clone());
        while let Some(class) = current {
            if let Some(layout) = class.0.layout.get()
                && let Some(ivar) = layout.ivars.iter().find(|i| &*i.name == name)
            {
                return Some(ivar.clone());
            }
            current = class.superclass();
        }
        None
    }

    /// Properties declared by this class itself.
    #[must_use]
    pub fn properties(&self) -> &[Property] {
        self.0.descriptor.as_ref().map_or(&[], |d| d.properties.as_slice())
    }

    /// Finds a property by name in this class or its ancestors.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<Property> {
        let mut current = Some(self.clone());
        while let Some(class) = current {
            if let Some(property) = class.properties().iter().find(|p| p.name == name) {
                return Some(property.clone());
            }
            current = class.superclass();
        }
        None
    }

    pub(crate) fn ivar_descriptors(&self) -> &[IvarDescriptor] {
        self.0
            .descriptor
            .as_ref()
            .map(|d| d.ivars.as_slice())
            .unwrap_or_default()
    }

    pub(crate) fn protocol_names(&self) -> &[String] {
        self.0
            .descriptor
            .as_ref()
            .map(|d| d.protocols.as_slice())
            .unwrap_or_default()
    }

    pub(crate) fn same_metadata(&self, descriptor: &ClassDescriptor) -> bool {
        self.0
            .descriptor
            .as_ref()
            .is_some_and(|d| d.same_metadata(descriptor))
    }

    pub(crate) fn destructor(&self) -> Option<Destructor> {
        self.0.destructor
    }

    /// Snapshot of this class's own method list, in insertion order.
    #[must_use]
    pub fn methods(&self) -> Vec<Method> {
        read_lock(&self.0.methods).values().cloned().collect()
    }

    /// Method defined by this class itself, ignoring ancestors.
    #[must_use]
    pub fn own_method(&self, sel: Selector) -> Option<Method> {
        read_lock(&self.0.methods).get(&sel).cloned()
    }

    /// Adds or overwrites a method on this class, returning the old one.
    ///
    /// An untyped replacement keeps the signature of the method it replaces.
    pub(crate) fn put_method(&self, mut method: Method) -> Option<Method> {
        let mut methods = write_lock(&self.0.methods);
        if method.types.is_none()
            && let Some(old) = methods.get(&method.selector)
        {
            method.types.clone_from(&old.types);
        }
        methods.insert(method.selector, method)
    }

    pub(crate) fn put_method_if_absent(&self, method: Method) -> bool {
        let mut methods = write_lock(&self.0.methods);
        if methods.contains_key(&method.selector) {
            return false;
        }
        methods.insert(method.selector, method);
        true
    }

    /// Adopted protocols, including those merged from categories.
    #[must_use]
    pub fn protocols(&self) -> Vec<Protocol> {
        read_lock(&self.0.protocols).clone()
    }

    pub(crate) fn add_protocols(&self, extra: &[Protocol]) {
        let mut protocols = write_lock(&self.0.protocols);
        for protocol in extra {
            if !protocols.contains(protocol) {
                protocols.push(protocol.clone());
            }
        }
    }

    /// Linked subclasses still alive, metaclasses included.
    #[must_use]
    pub fn subclasses(&self) -> Vec<Class> {
        lock(&self.0.subclasses)
            .iter()
            .filter_map(Weak::upgrade)
            .map(Class)
            .collect()
    }

    /// Returns true if `self` is `other` or inherits from it.
    #[must_use]
    pub fn is_subclass_of(&self, other: &Class) -> bool {
        let mut current = Some(self.clone());
        while let Some(class) = current {
            if class == *other {
                return true;
            }
            current = class.superclass();
        }
        false
    }

    /// Returns true if this class or an ancestor adopts `protocol`, directly
    /// or through protocol adoption.
    #[must_use]
    pub fn conforms_to(&self, protocol: &Protocol) -> bool {
        let mut current = Some(self.clone());
        while let Some(class) = current {
            if read_lock(&class.0.protocols)
                .iter()
                .any(|p| p.conforms_to(protocol))
            {
                return true;
            }
            current = class.superclass();
        }
        false
    }

    /// Resolves `sel` through the dispatch table, building it on first use.
    ///
    /// Unlinked classes resolve nothing.
    #[inline]
    #[must_use]
    pub fn lookup(&self, sel: Selector) -> Option<Imp> {
        if let Some(found) = self.0.dtable.probe(sel) {
            return found;
        }
        if !self.is_linked() {
            return None;
        }
        self.0
            .dtable
            .get_or_build(|| self.flatten())
            .get(&sel)
            .copied()
    }

    /// Returns true if instances of this class answer `sel` without
    /// forwarding.
    #[must_use]
    pub fn responds_to(&self, sel: Selector) -> bool {
        self.lookup(sel).is_some()
    }

    /// Implementation instances of this class run for `sel`, if any.
    #[must_use]
    pub fn method_implementation(&self, sel: Selector) -> Option<Imp> {
        self.lookup(sel)
    }

    /// Signature of the method that answers `sel`, searching ancestors.
    #[must_use]
    pub fn type_encoding(&self, sel: Selector) -> Option<Arc<str>> {
        let mut current = Some(self.clone());
        while let Some(class) = current {
            if let Some(method) = read_lock(&class.0.methods).get(&sel) {
                return method.types.clone();
            }
            current = class.superclass();
        }
        None
    }

    /// Own methods first, then each ancestor nearest to furthest; the first
    /// definition of a selector wins.
    fn flatten(&self) -> DTable {
        let mut table = DTable::default();
        let mut current = Some(self.clone());
        while let Some(class) = current {
            for (sel, method) in read_lock(&class.0.methods).iter() {
                table.entry(*sel).or_insert(method.imp);
            }
            current = class.superclass();
        }
        oxifw_log::trace!(
            "built dtable for {}{} with {} entries",
            if self.is_metaclass() { "+" } else { "" },
            self.name(),
            table.len()
        );
        table
    }

    /// Clears the dispatch tables of this class and every descendant.
    ///
    /// Returns the classes that were visited.
    pub(crate) fn invalidate_tree(&self) -> Vec<Class> {
        let mut visited = Vec::new();
        let mut stack = vec![self.clone()];
        while let Some(class) = stack.pop() {
            if visited.contains(&class) {
                continue;
            }
            class.0.dtable.invalidate();
            stack.extend(class.subclasses());
            visited.push(class);
        }
        visited
    }

    /// Rebuilds the dispatch table now if it is missing.
    pub(crate) fn rebuild_dtable(&self) {
        if self.is_linked() {
            self.0.dtable.get_or_build(|| self.flatten());
        }
    }

    /// Number of dispatch tables built for this class so far.
    #[must_use]
    pub fn dtable_builds(&self) -> u32 {
        self.0.dtable.builds()
    }

    /// Class method defined by this class itself.
    pub(crate) fn own_class_method(&self, sel: Selector) -> Option<Imp> {
        self.metaclass()?.own_method(sel).map(|m| m.imp)
    }

    /// Claims the right to run `+initialize`.
    ///
    /// Returns false if initialization already finished or is running on the
    /// calling thread. Blocks while another thread runs it.
    pub(crate) fn begin_initialize(&self) -> bool {
        let me = thread::current().id();
        let mut owner = lock(&self.0.init.owner);
        loop {
            if self.is_initialized() {
                return false;
            }
            match *owner {
                None => {
                    *owner = Some(me);
                    return true;
                }
                Some(id) if id == me => return false,
                Some(_) => {
                    owner = self
                        .0
                        .init
                        .done
                        .wait(owner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    pub(crate) fn finish_initialize(&self) {
        let mut owner = lock(&self.0.init.owner);
        self.set_flag(ClassFlags::INITIALIZED);
        *owner = None;
        self.0.init.done.notify_all();
    }

    pub(crate) fn not_linked(&self) -> Error {
        Error::NotLinked {
            class: self.name().to_string(),
        }
    }

    pub(crate) fn ptr_eq(&self, other: &Class) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Class {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Class {}

impl Hash for Class {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name())
            .field("flags", &self.flags())
            .finish()
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Runtime {
    /// Registers a class, returning its handle.
    ///
    /// Registering a descriptor identical to an existing one returns the
    /// existing class.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateRegistration`] if the name is taken by different
    ///   metadata or an ivar name repeats
    /// - [`Error::InvalidEncoding`] for a malformed ivar or method encoding
    pub fn try_register_class(&self, descriptor: ClassDescriptor) -> Result<Class> {
        let mut classes = write_lock(&self.classes);
        if let Some(existing) = classes.get(descriptor.name.as_str()) {
            if existing.same_metadata(&descriptor) {
                return Ok(existing.clone());
            }
            return Err(Error::DuplicateRegistration {
                name: descriptor.name,
            });
        }

        let name = descriptor.name.clone();
        let class = Class::from_descriptor(descriptor)?;
        classes.insert(name, class.clone());
        oxifw_log::debug!("registered class {}", class.name());
        Ok(class)
    }

    /// Registers a class, treating failure as fatal.
    pub fn register_class(&self, descriptor: ClassDescriptor) -> Class {
        self.try_register_class(descriptor).or_fatal()
    }

    /// Returns the class registered under `name`, if any.
    #[must_use]
    pub fn lookup_class(&self, name: &str) -> Option<Class> {
        read_lock(&self.classes).get(name).cloned()
    }

    /// Returns the class registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClassNotFound`] if there is none.
    pub fn try_get_class(&self, name: &str) -> Result<Class> {
        self.lookup_class(name).ok_or_else(|| Error::ClassNotFound {
            name: name.to_string(),
        })
    }

    /// Returns the class registered under `name`, treating absence as fatal.
    pub fn get_class(&self, name: &str) -> Class {
        self.try_get_class(name).or_fatal()
    }

    /// Names of all registered classes in registration order.
    #[must_use]
    pub fn class_names(&self) -> Vec<String> {
        read_lock(&self.classes).keys().cloned().collect()
    }

    /// Replaces or adds an instance method on `class` only.
    ///
    /// Every instance of `class`, and of subclasses that do not override
    /// `sel`, sees `imp` on its next send. Returns the implementation that
    /// was replaced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEncoding`] for a malformed `types`.
    pub fn try_replace_method(
        &self,
        class: &Class,
        sel: Selector,
        imp: Imp,
        types: Option<&str>,
    ) -> Result<Option<Imp>> {
        let method = Method {
            selector: sel,
            imp,
            types: types.map(Arc::from),
        };
        method.validate()?;
        let previous = class.put_method(method);
        oxifw_log::debug!(
            "{} -[{} {}]",
            if previous.is_some() { "replaced" } else { "added" },
            class.name(),
            sel
        );
        self.invalidate(class);
        Ok(previous.map(|m| m.imp))
    }

    /// Replaces or adds an instance method, treating failure as fatal.
    pub fn replace_method(
        &self,
        class: &Class,
        sel: Selector,
        imp: Imp,
        types: Option<&str>,
    ) -> Option<Imp> {
        self.try_replace_method(class, sel, imp, types).or_fatal()
    }

    /// Replaces or adds a class method on `class`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotLinked`] if `class` has no metaclass yet
    /// - [`Error::InvalidEncoding`] for a malformed `types`
    pub fn try_replace_class_method(
        &self,
        class: &Class,
        sel: Selector,
        imp: Imp,
        types: Option<&str>,
    ) -> Result<Option<Imp>> {
        let meta = class.metaclass().ok_or_else(|| class.not_linked())?;
        self.try_replace_method(&meta, sel, imp, types)
    }

    /// Replaces or adds a class method, treating failure as fatal.
    pub fn replace_class_method(
        &self,
        class: &Class,
        sel: Selector,
        imp: Imp,
        types: Option<&str>,
    ) -> Option<Imp> {
        self.try_replace_class_method(class, sel, imp, types).or_fatal()
    }

    /// Adds `method` to `class` unless the class itself already defines the
    /// selector. Returns whether it was added.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEncoding`] for a malformed signature.
    pub fn add_method(&self, class: &Class, method: Method) -> Result<bool> {
        method.validate()?;
        let sel = method.selector;
        let added = class.put_method_if_absent(method);
        if added {
            oxifw_log::debug!("added -[{} {}]", class.name(), sel);
            self.invalidate(class);
        }
        Ok(added)
    }

    /// Invalidates the dispatch tables of `class` and its descendants,
    /// rebuilding them at once when the runtime is configured to.
    pub(crate) fn invalidate(&self, class: &Class) {
        let visited = class.invalidate_tree();
        oxifw_log::trace!(
            "invalidated {} dtable(s) under {}",
            visited.len(),
            class.name()
        );
        if self.config.eager_dtable_rebuild {
            for class in &visited {
                class.rebuild_dtable();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imp_a(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
        Value::Int(1)
    }

    fn imp_b(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
        Value::Int(2)
    }

    #[test]
    fn test_register_is_idempotent_for_identical_metadata() {
        let rt = Runtime::new();
        let desc = ClassDescriptor::root("Root").method(Method::new("a", imp_a));
        let first = rt.try_register_class(desc.clone()).unwrap();
        let second = rt.try_register_class(desc).unwrap();
        assert_eq!(first, second);
        assert_eq!(rt.class_names(), vec!["Root".to_string()]);
    }

    #[test]
    fn test_register_conflict_is_duplicate() {
        let rt = Runtime::new();
        rt.try_register_class(ClassDescriptor::root("Root").method(Method::new("a", imp_a)))
            .unwrap();
        let err = rt
            .try_register_class(ClassDescriptor::root("Root").method(Method::new("a", imp_b)))
            .unwrap_err();
        assert_eq!(err, Error::DuplicateRegistration { name: "Root".into() });
    }

    #[test]
    fn test_register_rejects_bad_encodings() {
        let rt = Runtime::new();
        let bad_ivar = ClassDescriptor::root("BadIvar").ivar("x", "zz");
        assert!(matches!(
            rt.try_register_class(bad_ivar),
            Err(Error::InvalidEncoding { .. })
        ));
        let bad_method =
            ClassDescriptor::root("BadMethod").method(Method::new("a", imp_a).with_types("v"));
        assert!(matches!(
            rt.try_register_class(bad_method),
            Err(Error::InvalidEncoding { .. })
        ));
        let dup_ivar = ClassDescriptor::root("DupIvar").ivar("x", "i").ivar("x", "q");
        assert!(matches!(
            rt.try_register_class(dup_ivar),
            Err(Error::DuplicateRegistration { .. })
        ));
    }

    #[test]
    fn test_unlinked_class_state() {
        let rt = Runtime::new();
        let class = rt.register_class(ClassDescriptor::subclass("Orphan", "Missing"));
        assert_eq!(class.flags(), ClassFlags::REGISTERED);
        assert_eq!(class.instance_size(), None);
        assert_eq!(class.superclass_name(), Some("Missing"));
        assert!(class.lookup(Selector::intern("a")).is_none());
        assert!(class.class_object().is_err());
    }

    #[test]
    fn test_put_method_keeps_signature() {
        let rt = Runtime::new();
        let class = rt.register_class(
            ClassDescriptor::root("Typed").method(Method::new("a", imp_a).with_types("q@:")),
        );
        let old = class.put_method(Method::new("a", imp_b)).unwrap();
        assert!(std::ptr::fn_addr_eq(old.imp, imp_a as Imp));
        assert_eq!(class.own_method(Selector::intern("a")).unwrap().types.as_deref(), Some("q@:"));
    }

    #[test]
    fn test_lookup_class() {
        let rt = Runtime::new();
        assert!(rt.lookup_class("Nope").is_none());
        assert_eq!(
            rt.try_get_class("Nope").unwrap_err(),
            Error::ClassNotFound { name: "Nope".into() }
        );
    }

    #[test]
    fn test_properties_inherited_and_named() {
        let rt = Runtime::new();
        rt.register_class(ClassDescriptor::root("Stream").property(
            Property::new("atEnd", PropertyAttributes::READONLY).getter("isAtEnd").with_types("c"),
        ));
        rt.register_class(ClassDescriptor::subclass("File", "Stream").property(Property::new(
            "path",
            PropertyAttributes::READWRITE | PropertyAttributes::COPY,
        )));
        rt.link();

        let file = rt.get_class("File");
        assert_eq!(file.properties().len(), 1);
        assert!(file.metaclass().unwrap().properties().is_empty());

        let at_end = file.property("atEnd").unwrap();
        assert!(at_end.attributes.contains(PropertyAttributes::GETTER));
        assert_eq!(at_end.getter_selector(), Selector::intern("isAtEnd"));
        assert_eq!(at_end.setter_selector(), None);

        let path = file.property("path").unwrap();
        assert_eq!(path.setter_selector(), Some(Selector::intern("setPath:")));
        assert!(file.property("size").is_none());
    }

    #[test]
    fn test_duplicate_property_rejected() {
        let rt = Runtime::new();
        let desc = ClassDescriptor::root("Twice")
            .property(Property::new("x", PropertyAttributes::READWRITE))
            .property(Property::new("x", PropertyAttributes::READONLY));
        assert_eq!(
            rt.try_register_class(desc).unwrap_err(),
            Error::DuplicateRegistration { name: "Twice.x".into() }
        );
    }
}
