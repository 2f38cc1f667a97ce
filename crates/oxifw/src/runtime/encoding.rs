//! Type encodings for ivars and method signatures.
//!
//! One character per type:
//!
//! | char | type            | char | type               |
//! |------|-----------------|------|--------------------|
//! | `v`  | void            | `c`  | signed char (`i8`) |
//! | `@`  | object          | `C`  | `u8`               |
//! | `#`  | class           | `s`  | `i16`              |
//! | `:`  | selector        | `S`  | `u16`              |
//! | `*`  | C string        | `i`  | `i32`              |
//! | `^`  | pointer         | `I`  | `u32`              |
//! | `?`  | unknown pointer | `l`  | long (`i64`)       |
//! | `B`  | `bool`          | `q`  | `i64`              |
//! | `f`  | `f32`           | `Q`  | `u64`              |
//! | `d`  | `f64`           |      |                    |
//!
//! Method signatures list the return type, then `@` (receiver) and `:`
//! (selector), then the arguments. Frame offsets after each type, as in
//! `v16@0:8`, are accepted and ignored.

use crate::error::{Error, Result};

const PTR: usize = std::mem::size_of::<usize>();

/// Size in bytes of a value with this encoding.
///
/// ```
/// use oxifw::runtime::encoding::size_of_type;
///
/// assert_eq!(size_of_type('i'), Some(4));
/// assert_eq!(size_of_type('v'), Some(0));
/// assert_eq!(size_of_type('x'), None);
/// ```
#[must_use]
pub const fn size_of_type(type_char: char) -> Option<usize> {
    match type_char {
        'v' => Some(0),
        'c' | 'C' | 'B' => Some(1),
        's' | 'S' => Some(2),
        'i' | 'I' | 'f' => Some(4),
        'l' | 'q' | 'Q' | 'd' => Some(8),
        '@' | '#' | ':' | '*' | '^' | '?' => Some(PTR),
        _ => None,
    }
}

/// Natural alignment of a value with this encoding.
#[must_use]
pub const fn align_of_type(type_char: char) -> Option<usize> {
    match size_of_type(type_char) {
        Some(0) => Some(1),
        other => other,
    }
}

const fn is_valid_type_char(ch: char) -> bool {
    size_of_type(ch).is_some()
}

/// Parses an ivar encoding: exactly one non-void type character.
///
/// Returns `(type_char, size, align)`.
///
/// # Errors
///
/// Returns [`Error::InvalidEncoding`] for anything else.
pub fn ivar_layout(encoding: &str) -> Result<(char, usize, usize)> {
    let mut chars = encoding.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) if ch != 'v' => match (size_of_type(ch), align_of_type(ch)) {
            (Some(size), Some(align)) => Ok((ch, size, align)),
            _ => Err(invalid(encoding)),
        },
        _ => Err(invalid(encoding)),
    }
}

/// Splits a method signature into its return type and argument types,
/// skipping frame offsets.
///
/// ```
/// use oxifw::runtime::encoding::parse_signature;
///
/// let (ret, args) = parse_signature("i24@0:8i16").unwrap();
/// assert_eq!(ret, 'i');
/// assert_eq!(args, vec!['@', ':', 'i']);
/// ```
///
/// # Errors
///
/// Returns [`Error::InvalidEncoding`] if a character is not a type, or the
/// receiver and selector slots are missing.
pub fn parse_signature(encoding: &str) -> Result<(char, Vec<char>)> {
    let mut types = encoding.chars().filter(|c| !c.is_ascii_digit());

    let ret = types.next().ok_or_else(|| invalid(encoding))?;
    if !is_valid_type_char(ret) {
        return Err(invalid(encoding));
    }

    let args: Vec<char> = types.collect();
    if args.iter().any(|&c| !is_valid_type_char(c) || c == 'v') {
        return Err(invalid(encoding));
    }
    if args.len() < 2 || args[0] != '@' || args[1] != ':' {
        return Err(invalid(encoding));
    }

    Ok((ret, args))
}

/// Checks a method signature without allocating the argument list.
///
/// # Errors
///
/// See [`parse_signature`].
pub fn validate_method_encoding(encoding: &str) -> Result<()> {
    parse_signature(encoding).map(|_| ())
}

fn invalid(encoding: &str) -> Error {
    Error::InvalidEncoding {
        encoding: encoding.to_string(),
    }
}

/// Rounds `offset` up to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}
