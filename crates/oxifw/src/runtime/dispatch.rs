//! Message sending.
//!
//! Two calling conventions are offered:
//!
//! - direct: [`Runtime::send`], [`Runtime::send_super`] and the typed
//!   [`Runtime::send_as`] resolve and invoke in one step
//! - lookup-then-call: [`Runtime::msg_lookup`] and
//!   [`Runtime::msg_lookup_super`] return the implementation for the caller
//!   to invoke
//!
//! Sending to `None` (the nil receiver) yields the zero value and touches no
//! class state. Every send to a live receiver first makes sure the class has
//! run `+initialize`, superclass first. A dispatch miss goes to the
//! forwarding handler (see [`forwarding`](crate::runtime::forwarding)).

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, OrFatal, Result};
use crate::runtime::Runtime;
use crate::runtime::class::{Class, Imp};
use crate::runtime::object::Object;
use crate::runtime::selector::Selector;

/// Argument or result of a message send.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Nothing, or the nil object.
    #[default]
    Nil,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    UInt(u64),
    /// Floating point number.
    Float(f64),
    /// Immutable string.
    Str(Arc<str>),
    /// Selector.
    Sel(Selector),
    /// Object reference.
    Object(Object),
}

impl Value {
    /// Short name of the variant, for diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Sel(_) => "selector",
            Value::Object(_) => "object",
        }
    }

    #[must_use]
    pub const fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer value, converting an unsigned value that fits.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    /// Unsigned value, converting a non-negative signed value.
    #[must_use]
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::UInt(u) => Some(*u),
            Value::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(&**s),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_selector(&self) -> Option<Selector> {
        match self {
            Value::Sel(sel) => Some(*sel),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::UInt(u) => write!(f, "{u}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Sel(sel) => write!(f, "@selector({sel})"),
            Value::Object(obj) => write!(f, "{obj:?}"),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => |$v:ident| $body:expr),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from($v: $ty) -> Self {
                    $body
                }
            }
        )*
    };
}

impl_from! {
    bool => |b| Value::Bool(b),
    i32 => |i| Value::Int(i64::from(i)),
    i64 => |i| Value::Int(i),
    u32 => |u| Value::UInt(u64::from(u)),
    u64 => |u| Value::UInt(u),
    f64 => |x| Value::Float(x),
    &str => |s| Value::Str(Arc::from(s)),
    String => |s| Value::Str(Arc::from(s)),
    Arc<str> => |s| Value::Str(s),
    Selector => |sel| Value::Sel(sel),
    Object => |obj| Value::Object(obj),
    Option<Object> => |obj| obj.map_or(Value::Nil, Value::Object),
}

/// Conversion from a send result, with the zero value a nil receiver
/// produces.
pub trait FromValue: Sized {
    /// Type name used in [`Error::TypeMismatch`].
    const EXPECTED: &'static str;

    /// Result of messaging nil.
    fn zero() -> Self;

    /// Converts a result, or returns `None` if the variant does not fit.
    fn from_value(value: Value) -> Option<Self>;
}

impl FromValue for Value {
    const EXPECTED: &'static str = "value";

    fn zero() -> Self {
        Value::Nil
    }

    fn from_value(value: Value) -> Option<Self> {
        Some(value)
    }
}

impl FromValue for () {
    const EXPECTED: &'static str = "void";

    fn zero() -> Self {}

    fn from_value(_: Value) -> Option<Self> {
        Some(())
    }
}

impl FromValue for bool {
    const EXPECTED: &'static str = "bool";

    fn zero() -> Self {
        false
    }

    fn from_value(value: Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FromValue for i64 {
    const EXPECTED: &'static str = "int";

    fn zero() -> Self {
        0
    }

    fn from_value(value: Value) -> Option<Self> {
        value.as_int()
    }
}

impl FromValue for i32 {
    const EXPECTED: &'static str = "int";

    fn zero() -> Self {
        0
    }

    fn from_value(value: Value) -> Option<Self> {
        value.as_int().and_then(|i| i32::try_from(i).ok())
    }
}

impl FromValue for u64 {
    const EXPECTED: &'static str = "uint";

    fn zero() -> Self {
        0
    }

    fn from_value(value: Value) -> Option<Self> {
        value.as_uint()
    }
}

impl FromValue for f64 {
    const EXPECTED: &'static str = "float";

    fn zero() -> Self {
        0.0
    }

    fn from_value(value: Value) -> Option<Self> {
        value.as_float()
    }
}

impl FromValue for String {
    const EXPECTED: &'static str = "string";

    fn zero() -> Self {
        String::new()
    }

    fn from_value(value: Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl FromValue for Option<Object> {
    const EXPECTED: &'static str = "object";

    fn zero() -> Self {
        None
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Nil => Some(None),
            Value::Object(obj) => Some(Some(obj)),
            _ => None,
        }
    }
}

impl FromValue for Option<Selector> {
    const EXPECTED: &'static str = "selector";

    fn zero() -> Self {
        None
    }

    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Nil => Some(None),
            Value::Sel(sel) => Some(Some(sel)),
            _ => None,
        }
    }
}

/// Implementation handed out for the nil receiver. Returns [`Value::Nil`].
pub fn nil_imp(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
    Value::Nil
}

fn convert<T: FromValue>(value: Value) -> Result<T> {
    let found = value.kind();
    T::from_value(value).ok_or(Error::TypeMismatch {
        expected: T::EXPECTED,
        found,
    })
}

/// Marks a class initialized even if its `+initialize` panics.
struct FinishInitialize<'a>(&'a Class);

impl Drop for FinishInitialize<'_> {
    fn drop(&mut self) {
        self.0.finish_initialize();
    }
}

impl Runtime {
    /// Sends `sel` to `receiver`.
    ///
    /// A `None` receiver returns [`Value::Nil`].
    ///
    /// # Errors
    ///
    /// - [`Error::DoesNotUnderstand`] if neither the class nor the
    ///   forwarding handler supplies an implementation
    /// - [`Error::ForwardingLoop`] if forwarding nests too deeply
    pub fn try_send(&self, receiver: Option<&Object>, sel: Selector, args: &[Value]) -> Result<Value> {
        let Some(receiver) = receiver else {
            return Ok(Value::Nil);
        };
        let class = receiver.class();
        self.ensure_initialized(class);
        match class.lookup(sel) {
            Some(imp) => Ok(imp(self, receiver, sel, args)),
            None => self.forward(receiver, sel, args),
        }
    }

    /// Sends `sel` to `receiver`, treating failure as fatal.
    pub fn send(&self, receiver: Option<&Object>, sel: Selector, args: &[Value]) -> Value {
        self.try_send(receiver, sel, args).or_fatal()
    }

    /// Sends `sel` and converts the result. A `None` receiver returns
    /// [`FromValue::zero`].
    ///
    /// # Errors
    ///
    /// As [`Runtime::try_send`], plus [`Error::TypeMismatch`] when the result
    /// does not convert to `T`.
    pub fn try_send_as<T: FromValue>(
        &self,
        receiver: Option<&Object>,
        sel: Selector,
        args: &[Value],
    ) -> Result<T> {
        if receiver.is_none() {
            return Ok(T::zero());
        }
        convert(self.try_send(receiver, sel, args)?)
    }

    /// Typed send, treating failure as fatal.
    pub fn send_as<T: FromValue>(&self, receiver: Option<&Object>, sel: Selector, args: &[Value]) -> T {
        self.try_send_as(receiver, sel, args).or_fatal()
    }

    /// Sends `sel` to `receiver`, starting the lookup at the superclass of
    /// `start`.
    ///
    /// `start` is the class whose method is making the call, not
    /// necessarily the receiver's class.
    ///
    /// # Errors
    ///
    /// See [`Runtime::try_send`].
    pub fn try_send_super(
        &self,
        receiver: Option<&Object>,
        start: &Class,
        sel: Selector,
        args: &[Value],
    ) -> Result<Value> {
        let Some(receiver) = receiver else {
            return Ok(Value::Nil);
        };
        self.ensure_initialized(receiver.class());
        match start.superclass().and_then(|parent| parent.lookup(sel)) {
            Some(imp) => Ok(imp(self, receiver, sel, args)),
            None => self.forward(receiver, sel, args),
        }
    }

    /// Super send, treating failure as fatal.
    pub fn send_super(
        &self,
        receiver: Option<&Object>,
        start: &Class,
        sel: Selector,
        args: &[Value],
    ) -> Value {
        self.try_send_super(receiver, start, sel, args).or_fatal()
    }

    /// Sends a class message to `class`.
    ///
    /// # Errors
    ///
    /// [`Error::NotLinked`] before linking, otherwise as
    /// [`Runtime::try_send`].
    pub fn try_send_class(&self, class: &Class, sel: Selector, args: &[Value]) -> Result<Value> {
        let object = class.class_object()?;
        self.try_send(Some(&object), sel, args)
    }

    /// Class message send, treating failure as fatal.
    pub fn send_class(&self, class: &Class, sel: Selector, args: &[Value]) -> Value {
        self.try_send_class(class, sel, args).or_fatal()
    }

    /// Implementation `receiver` would run for `sel`.
    ///
    /// A `None` receiver yields [`nil_imp`]. A miss asks the forwarding
    /// handler without invoking anything.
    ///
    /// # Errors
    ///
    /// [`Error::DoesNotUnderstand`] if nothing answers `sel`.
    pub fn try_msg_lookup(&self, receiver: Option<&Object>, sel: Selector) -> Result<Imp> {
        let Some(receiver) = receiver else {
            return Ok(nil_imp);
        };
        let class = receiver.class();
        self.ensure_initialized(class);
        match class.lookup(sel) {
            Some(imp) => Ok(imp),
            None => self.forwarding_target(receiver, sel),
        }
    }

    /// Lookup, treating failure as fatal.
    pub fn msg_lookup(&self, receiver: Option<&Object>, sel: Selector) -> Imp {
        self.try_msg_lookup(receiver, sel).or_fatal()
    }

    /// Implementation a super send from `start` would run.
    ///
    /// # Errors
    ///
    /// See [`Runtime::try_msg_lookup`].
    pub fn try_msg_lookup_super(
        &self,
        receiver: Option<&Object>,
        start: &Class,
        sel: Selector,
    ) -> Result<Imp> {
        let Some(receiver) = receiver else {
            return Ok(nil_imp);
        };
        self.ensure_initialized(receiver.class());
        match start.superclass().and_then(|parent| parent.lookup(sel)) {
            Some(imp) => Ok(imp),
            None => self.forwarding_target(receiver, sel),
        }
    }

    /// Super lookup, treating failure as fatal.
    pub fn msg_lookup_super(&self, receiver: Option<&Object>, start: &Class, sel: Selector) -> Imp {
        self.try_msg_lookup_super(receiver, start, sel).or_fatal()
    }

    /// Returns true if instances of `class` answer `sel` without
    /// forwarding.
    #[must_use]
    pub fn responds_to(&self, class: &Class, sel: Selector) -> bool {
        class.responds_to(sel)
    }

    /// Runs `+initialize` for the class behind `class` if it has not run.
    ///
    /// For a metaclass this is its instance class.
    pub(crate) fn ensure_initialized(&self, class: &Class) {
        if class.is_metaclass() {
            if let Some(instance_class) = class.instance_class()
                && !instance_class.is_initialized()
            {
                self.initialize(&instance_class);
            }
        } else if !class.is_initialized() {
            self.initialize(class);
        }
    }

    fn initialize(&self, class: &Class) {
        if let Some(parent) = class.superclass()
            && !parent.is_initialized()
        {
            self.initialize(&parent);
        }
        if !class.begin_initialize() {
            return;
        }
        let _finish = FinishInitialize(class);

        let sel = Selector::intern("initialize");
        if let Some(imp) = class.own_class_method(sel)
            && let Ok(object) = class.class_object()
        {
            oxifw_log::debug!("+[{} initialize]", class.name());
            imp(self, &object, sel, &[]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::class::{ClassDescriptor, Method};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn answer(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
        Value::Int(42)
    }

    fn echo(_: &Runtime, _: &Object, _: Selector, args: &[Value]) -> Value {
        args.first().cloned().unwrap_or_default()
    }

    fn linked(rt: &Runtime, desc: ClassDescriptor) -> Class {
        let class = rt.register_class(desc);
        rt.link();
        class
    }

    #[test]
    fn test_nil_receiver_returns_zero() {
        let rt = Runtime::new();
        let class = linked(&rt, ClassDescriptor::root("Untouched").method(Method::new("a", answer)));
        let sel = Selector::intern("a");

        assert_eq!(rt.send(None, sel, &[]), Value::Nil);
        assert_eq!(rt.send_as::<i64>(None, sel, &[]), 0);
        assert_eq!(rt.send_as::<String>(None, Selector::intern("nothing"), &[]), "");
        assert_eq!(rt.send_as::<Option<Object>>(None, sel, &[]), None);
        assert_eq!(class.dtable_builds(), 0);
        assert!(!class.is_initialized());

        let imp = rt.msg_lookup(None, sel);
        assert!(std::ptr::fn_addr_eq(imp, nil_imp as Imp));
    }

    #[test]
    fn test_send_passes_arguments() {
        let rt = Runtime::new();
        let class = linked(&rt, ClassDescriptor::root("Echo").method(Method::new("echo:", echo)));
        let obj = Object::allocate(&class);
        let got = rt.send(Some(&obj), Selector::intern("echo:"), &[Value::from("hi")]);
        assert_eq!(got.as_str(), Some("hi"));
    }

    #[test]
    fn test_send_as_type_mismatch() {
        let rt = Runtime::new();
        let class = linked(&rt, ClassDescriptor::root("Answer").method(Method::new("a", answer)));
        let obj = Object::allocate(&class);
        let sel = Selector::intern("a");

        assert_eq!(rt.send_as::<i64>(Some(&obj), sel, &[]), 42);
        assert_eq!(rt.send_as::<i32>(Some(&obj), sel, &[]), 42);
        assert_eq!(
            rt.try_send_as::<String>(Some(&obj), sel, &[]).unwrap_err(),
            Error::TypeMismatch {
                expected: "string",
                found: "int"
            }
        );
    }

    #[test]
    fn test_msg_lookup_matches_send() {
        let rt = Runtime::new();
        let class = linked(&rt, ClassDescriptor::root("Lookup").method(Method::new("a", answer)));
        let obj = Object::allocate(&class);
        let sel = Selector::intern("a");
        let imp = rt.msg_lookup(Some(&obj), sel);
        assert_eq!(imp(&rt, &obj, sel, &[]), rt.send(Some(&obj), sel, &[]));
        assert!(matches!(
            rt.try_msg_lookup(Some(&obj), Selector::intern("missing")),
            Err(Error::DoesNotUnderstand { .. })
        ));
    }

    static INITIALIZED: AtomicUsize = AtomicUsize::new(0);

    fn count_initialize(_: &Runtime, _: &Object, _: Selector, _: &[Value]) -> Value {
        INITIALIZED.fetch_add(1, Ordering::SeqCst);
        Value::Nil
    }

    #[test]
    fn test_initialize_runs_once_per_defining_class() {
        let rt = Runtime::new();
        let base = rt.register_class(
            ClassDescriptor::root("InitBase")
                .class_method(Method::new("initialize", count_initialize))
                .method(Method::new("a", answer)),
        );
        let child = rt.register_class(ClassDescriptor::subclass("InitChild", "InitBase"));
        rt.link();

        let obj = Object::allocate(&child);
        rt.send(Some(&obj), Selector::intern("a"), &[]);
        rt.send(Some(&obj), Selector::intern("a"), &[]);
        // The child does not define +initialize, so only the base runs it.
        assert_eq!(INITIALIZED.load(Ordering::SeqCst), 1);
        assert!(base.is_initialized());
        assert!(child.is_initialized());
    }
}
