//! Error types for the `OxiFW` runtime.
//!
//! Every fallible entry point has a `try_` form returning [`Result`]. The
//! plain forms treat an error as a programming bug and hand it to [`fatal`],
//! which logs it and panics.

use thiserror::Error;

/// Errors raised by registration, linking, dispatch and pool management.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Inheritance or protocol adoption graph is cyclic or references a
    /// missing entity.
    #[error("malformed hierarchy at '{name}': {reason}")]
    MalformedHierarchy {
        /// Class or protocol where the problem was found.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A name was registered again with different metadata.
    #[error("'{name}' is already registered with different metadata")]
    DuplicateRegistration {
        /// The conflicting class, protocol or category name.
        name: String,
    },

    /// Dispatch missed and forwarding supplied nothing.
    #[error("{class} does not understand '{selector}'")]
    DoesNotUnderstand {
        /// Class of the receiver.
        class: String,
        /// Selector that was sent.
        selector: String,
    },

    /// A pool handle was popped that is not on this thread's stack.
    #[error("autorelease pool popped out of order or more than once")]
    UnbalancedPool,

    /// An object was autoreleased with no pool pushed on this thread.
    #[error("object autoreleased with no autorelease pool in place")]
    NoActivePool,

    /// This thread's pool stack is being torn down at thread exit.
    #[error("autorelease pools are unavailable while the thread exits")]
    PoolsTornDown,

    /// The class has not been linked yet.
    #[error("class '{class}' is not linked")]
    NotLinked {
        /// Class name.
        class: String,
    },

    /// Metaclasses describe class objects and cannot be instantiated.
    #[error("cannot allocate an instance of metaclass '{class}'")]
    MetaclassInstance {
        /// Metaclass name.
        class: String,
    },

    /// No class is registered under this name.
    #[error("class '{name}' not found")]
    ClassNotFound {
        /// Requested name.
        name: String,
    },

    /// No protocol is registered under this name.
    #[error("protocol '{name}' not found")]
    ProtocolNotFound {
        /// Requested name.
        name: String,
    },

    /// The class declares no instance variable with this name.
    #[error("class '{class}' has no ivar '{ivar}'")]
    IvarNotFound {
        /// Class searched, including its ancestors.
        class: String,
        /// Ivar name.
        ivar: String,
    },

    /// Typed ivar access with a type that does not match the encoding.
    #[error("ivar '{ivar}' is encoded as '{found}', not {expected}")]
    IvarTypeMismatch {
        /// Ivar name.
        ivar: String,
        /// Rust type requested by the caller.
        expected: &'static str,
        /// Declared type encoding.
        found: char,
    },

    /// Type encoding string could not be parsed.
    #[error("invalid type encoding '{encoding}'")]
    InvalidEncoding {
        /// The offending encoding.
        encoding: String,
    },

    /// Forwarding re-entered itself more often than the configured limit.
    #[error("forwarding loop detected for '{selector}' at depth {depth}")]
    ForwardingLoop {
        /// Selector being forwarded.
        selector: String,
        /// Depth at which the loop was cut.
        depth: u32,
    },

    /// A message result could not be converted to the requested type.
    #[error("expected {expected} result, got {found}")]
    TypeMismatch {
        /// Requested type.
        expected: &'static str,
        /// Kind of value actually returned.
        found: &'static str,
    },

    /// A class claims a protocol but lacks one of its required methods.
    #[error("{class} conforms to {protocol} but does not implement '{selector}'")]
    MissingProtocolMethod {
        /// Class checked.
        class: String,
        /// Protocol checked.
        protocol: String,
        /// First missing required selector.
        selector: String,
    },

    /// A configuration value could not be parsed.
    #[error("invalid value '{value}' for {key}")]
    InvalidConfig {
        /// Setting name.
        key: &'static str,
        /// Raw value.
        value: String,
    },
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Logs `err` and aborts the current operation by panicking.
///
/// With the `fatal_backtrace` feature the backtrace of the failing call is
/// logged as well.
#[cold]
#[track_caller]
pub fn fatal(err: Error) -> ! {
    oxifw_log::error!("{err}");
    #[cfg(feature = "fatal_backtrace")]
    oxifw_log::error!("{:?}", backtrace::Backtrace::new());
    panic!("{err}")
}

/// Extension for unwrapping a runtime [`Result`] through [`fatal`].
pub(crate) trait OrFatal<T> {
    fn or_fatal(self) -> T;
}

impl<T> OrFatal<T> for Result<T> {
    #[inline]
    #[track_caller]
    fn or_fatal(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => fatal(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::DoesNotUnderstand {
            class: "Dog".into(),
            selector: "fly".into(),
        };
        assert_eq!(err.to_string(), "Dog does not understand 'fly'");
        assert_eq!(
            Error::NotLinked { class: "Cat".into() }.to_string(),
            "class 'Cat' is not linked"
        );
    }

    #[test]
    fn test_error_equality() {
        assert_eq!(Error::UnbalancedPool, Error::UnbalancedPool);
        assert_ne!(
            Error::ClassNotFound { name: "A".into() },
            Error::ClassNotFound { name: "B".into() }
        );
    }

    #[test]
    #[should_panic(expected = "no autorelease pool")]
    fn test_fatal_panics_with_message() {
        fatal(Error::NoActivePool);
    }

    #[test]
    fn test_or_fatal_passes_values_through() {
        let ok: Result<u8> = Ok(3);
        assert_eq!(ok.or_fatal(), 3);
    }
}
