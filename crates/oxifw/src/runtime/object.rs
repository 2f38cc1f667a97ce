//! Instances and their reference counts.
//!
//! An [`Object`] is a counted pointer to a heap block holding the class
//! pointer, the reference count and the ivar storage. `Clone` retains and
//! `Drop` releases; the release that brings the count to zero runs the
//! destructor chain (most-derived class first) and frees the block.
//!
//! Ivar storage is a zeroed byte image of `instance_size` bytes laid out as
//! computed at link time, with object-typed ivars (`@`, `#`) kept beside it
//! so they hold real references.
//!
//! # Example
//!
//! ```
//! use oxifw::{ClassDescriptor, Object, Runtime};
//!
//! let rt = Runtime::new();
//! rt.register_class(ClassDescriptor::root("Point").ivar("x", "i").ivar("y", "d"));
//! rt.link();
//!
//! let point = Object::allocate(&rt.get_class("Point"));
//! point.set_ivar("x", 3i32).unwrap();
//! assert_eq!(point.get_ivar::<i32>("x").unwrap(), 3);
//! assert_eq!(point.get_ivar::<f64>("y").unwrap(), 0.0);
//! ```

use fxhash::FxBuildHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{self, AtomicUsize, Ordering};

use crate::error::{Error, OrFatal, Result};
use crate::runtime::class::{Class, Ivar};
use crate::runtime::lock;
use crate::runtime::protocol::Protocol;
use crate::runtime::selector::Selector;

/// Count above which a retain is treated as a leak loop.
const MAX_REFCOUNT: usize = isize::MAX as usize;

struct IvarStorage {
    bytes: Box<[u8]>,
    objects: hashbrown::HashMap<usize, Object, FxBuildHasher>,
}

struct RawObject {
    isa: Class,
    refcount: AtomicUsize,
    ivars: Mutex<IvarStorage>,
}

/// Reference-counted instance of a linked class.
pub struct Object {
    ptr: NonNull<RawObject>,
}

// SAFETY: the pointee is only reached through shared references; the class
// handle is `Send + Sync`, the count is atomic and ivars sit behind a mutex.
unsafe impl Send for Object {}
unsafe impl Sync for Object {}

impl Object {
    fn from_parts(isa: Class, size: usize) -> Self {
        let raw = Box::new(RawObject {
            isa,
            refcount: AtomicUsize::new(1),
            ivars: Mutex::new(IvarStorage {
                bytes: vec![0u8; size].into_boxed_slice(),
                objects: hashbrown::HashMap::default(),
            }),
        });
        Object {
            ptr: NonNull::from(Box::leak(raw)),
        }
    }

    /// Allocates a zeroed instance of `class` with a reference count of one.
    ///
    /// # Errors
    ///
    /// - [`Error::NotLinked`] if `class` has not been linked
    /// - [`Error::MetaclassInstance`] if `class` is a metaclass
    pub fn try_allocate(class: &Class) -> Result<Self> {
        if class.is_metaclass() {
            return Err(Error::MetaclassInstance {
                class: class.name().to_string(),
            });
        }
        if !class.is_linked() {
            return Err(class.not_linked());
        }
        let size = class.instance_size().ok_or_else(|| class.not_linked())?;
        Ok(Self::from_parts(class.clone(), size))
    }

    /// Allocates an instance, treating failure as fatal.
    #[must_use]
    pub fn allocate(class: &Class) -> Self {
        Self::try_allocate(class).or_fatal()
    }

    pub(crate) fn new_class_object(metaclass: &Class) -> Self {
        Self::from_parts(metaclass.clone(), std::mem::size_of::<usize>())
    }

    #[inline]
    fn raw(&self) -> &RawObject {
        // SAFETY: `ptr` stays valid while any `Object` for it exists; this
        // one keeps the count above zero.
        unsafe { self.ptr.as_ref() }
    }

    /// The receiver's class. For a class object this is its metaclass.
    #[inline]
    #[must_use]
    pub fn class(&self) -> &Class {
        &self.raw().isa
    }

    /// Name of the receiver's class.
    #[must_use]
    pub fn class_name(&self) -> &str {
        self.class().name()
    }

    /// The class this object stands for, if it is a class object.
    #[must_use]
    pub fn as_class(&self) -> Option<Class> {
        if self.class().is_metaclass() {
            self.class().instance_class()
        } else {
            None
        }
    }

    /// Current reference count.
    #[must_use]
    pub fn retain_count(&self) -> usize {
        self.raw().refcount.load(Ordering::Acquire)
    }

    /// Returns true if both handles refer to the same instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Object) -> bool {
        self.ptr == other.ptr
    }

    /// Returns true if the receiver's class is `class` or inherits from it.
    #[must_use]
    pub fn is_kind_of(&self, class: &Class) -> bool {
        self.class().is_subclass_of(class)
    }

    /// Returns true if the receiver answers `sel` without forwarding.
    #[must_use]
    pub fn responds_to(&self, sel: Selector) -> bool {
        self.class().responds_to(sel)
    }

    /// Returns true if the receiver's class conforms to `protocol`.
    #[must_use]
    pub fn conforms_to(&self, protocol: &Protocol) -> bool {
        self.class().conforms_to(protocol)
    }

    fn find_ivar(&self, name: &str) -> Result<Ivar> {
        self.class().ivar(name).ok_or_else(|| Error::IvarNotFound {
            class: self.class_name().to_string(),
            ivar: name.to_string(),
        })
    }

    fn scalar_ivar<T: IvarValue>(&self, name: &str) -> Result<Ivar> {
        let ivar = self.find_ivar(name)?;
        if !T::accepts(ivar.type_char) || ivar.size != std::mem::size_of::<T>() {
            return Err(Error::IvarTypeMismatch {
                ivar: name.to_string(),
                expected: T::TYPE_NAME,
                found: ivar.type_char,
            });
        }
        Ok(ivar)
    }

    /// Reads a scalar ivar.
    ///
    /// # Errors
    ///
    /// - [`Error::IvarNotFound`] if no class in the chain declares `name`
    /// - [`Error::IvarTypeMismatch`] if `T` does not match the encoding
    pub fn get_ivar<T: IvarValue>(&self, name: &str) -> Result<T> {
        let ivar = self.scalar_ivar::<T>(name)?;
        let storage = lock(&self.raw().ivars);
        Ok(T::read(&storage.bytes[ivar.offset..ivar.offset + ivar.size]))
    }

    /// Writes a scalar ivar.
    ///
    /// # Errors
    ///
    /// See [`Object::get_ivar`].
    pub fn set_ivar<T: IvarValue>(&self, name: &str, value: T) -> Result<()> {
        let ivar = self.scalar_ivar::<T>(name)?;
        let mut storage = lock(&self.raw().ivars);
        value.write(&mut storage.bytes[ivar.offset..ivar.offset + ivar.size]);
        Ok(())
    }

    fn object_ivar_slot(&self, name: &str) -> Result<Ivar> {
        let ivar = self.find_ivar(name)?;
        if !matches!(ivar.type_char, '@' | '#') {
            return Err(Error::IvarTypeMismatch {
                ivar: name.to_string(),
                expected: "object",
                found: ivar.type_char,
            });
        }
        Ok(ivar)
    }

    /// Reads an object ivar, retaining the result.
    ///
    /// # Errors
    ///
    /// - [`Error::IvarNotFound`] if no class in the chain declares `name`
    /// - [`Error::IvarTypeMismatch`] if the ivar is not object-typed
    pub fn object_ivar(&self, name: &str) -> Result<Option<Object>> {
        let ivar = self.object_ivar_slot(name)?;
        Ok(lock(&self.raw().ivars).objects.get(&ivar.offset).cloned())
    }

    /// Stores an object ivar. The previous value is released after the
    /// ivar lock is dropped.
    ///
    /// # Errors
    ///
    /// See [`Object::object_ivar`].
    pub fn set_object_ivar(&self, name: &str, value: Option<Object>) -> Result<()> {
        let ivar = self.object_ivar_slot(name)?;
        let previous = {
            let mut storage = lock(&self.raw().ivars);
            match value {
                Some(object) => storage.objects.insert(ivar.offset, object),
                None => storage.objects.remove(&ivar.offset),
            }
        };
        drop(previous);
        Ok(())
    }

    /// Runs the destructor chain and frees the instance.
    ///
    /// The count is parked at one while destructors run, so a destructor
    /// that briefly clones the object does not re-enter teardown.
    #[cold]
    fn destroy(&mut self) {
        let raw = self.raw();
        raw.refcount.store(1, Ordering::Relaxed);

        if !raw.isa.is_metaclass() {
            let this = ManuallyDrop::new(Object { ptr: self.ptr });
            let mut current = Some(raw.isa.clone());
            while let Some(class) = current {
                if let Some(destructor) = class.destructor() {
                    destructor(&this);
                }
                current = class.superclass();
            }
        }

        if raw
            .refcount
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            oxifw_log::warn!(
                "instance of {} was retained by its destructor; leaking it",
                raw.isa.name()
            );
            return;
        }

        // SAFETY: the count is zero and no destructor kept a reference, so
        // this is the last handle. The block came from `Box::leak`.
        drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
    }
}

impl Clone for Object {
    fn clone(&self) -> Self {
        let old = self.raw().refcount.fetch_add(1, Ordering::Relaxed);
        if old > MAX_REFCOUNT {
            std::process::abort();
        }
        Object { ptr: self.ptr }
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        if self.raw().refcount.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        atomic::fence(Ordering::Acquire);
        self.destroy();
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Object {}

impl Hash for Object {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.hash(state);
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}: {:p}>", self.class_name(), self.ptr)
    }
}

/// Scalar types that can be stored in an ivar.
pub trait IvarValue: Copy {
    /// Human-readable type name used in errors.
    const TYPE_NAME: &'static str;

    /// Returns true if this type can be stored under `type_char`.
    fn accepts(type_char: char) -> bool;

    /// Decodes a value from exactly `size_of::<Self>()` bytes.
    fn read(bytes: &[u8]) -> Self;

    /// Encodes into exactly `size_of::<Self>()` bytes.
    fn write(self, bytes: &mut [u8]);
}

macro_rules! impl_ivar_value {
    ($ty:ty, $name:literal, $($enc:literal)|+) => {
        impl IvarValue for $ty {
            const TYPE_NAME: &'static str = $name;

            fn accepts(type_char: char) -> bool {
                matches!(type_char, $($enc)|+)
            }

            fn read(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_ne_bytes(raw)
            }

            fn write(self, bytes: &mut [u8]) {
                bytes.copy_from_slice(&self.to_ne_bytes());
            }
        }
    };
}

impl_ivar_value!(i8, "i8", 'c');
impl_ivar_value!(u8, "u8", 'C');
impl_ivar_value!(i16, "i16", 's');
impl_ivar_value!(u16, "u16", 'S');
impl_ivar_value!(i32, "i32", 'i');
impl_ivar_value!(u32, "u32", 'I');
impl_ivar_value!(i64, "i64", 'q' | 'l');
impl_ivar_value!(u64, "u64", 'Q');
impl_ivar_value!(f32, "f32", 'f');
impl_ivar_value!(f64, "f64", 'd');

impl IvarValue for bool {
    const TYPE_NAME: &'static str = "bool";

    fn accepts(type_char: char) -> bool {
        type_char == 'B'
    }

    fn read(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn write(self, bytes: &mut [u8]) {
        bytes[0] = u8::from(self);
    }
}
