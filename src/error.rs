//! Error types surfaced by every fallible operation in this crate.
use alloc::borrow::Cow;
use alloc::string::ToString;
use core::fmt::{Debug, Display};

/// Every failure this crate can produce, grouped the way the design doc's
/// error taxonomy groups them. Variants are distinguished for logging; callers
/// are expected to treat all of them as terminal for the load in progress.
#[derive(Debug)]
pub enum Error {
    /// Bad magic, version, class, endianness, or header/entry sizes.
    Malformed { msg: Cow<'static, str> },
    /// Machine mismatch or an architecture-specific ABI flag mismatch.
    Unsupported { msg: Cow<'static, str> },
    /// Overlapping/oversized segments, or unbalanced paired dynamic tags.
    Structural { msg: Cow<'static, str> },
    /// A needed library could not be located, or a relocation referenced a
    /// symbol that could not be resolved.
    Resolution { msg: Cow<'static, str> },
    /// A host read or seek failed or returned short.
    Io { msg: Cow<'static, str> },
    /// A fallible allocation failed, or the host's segment allocator failed.
    Resource { msg: Cow<'static, str> },
    /// A relocation type the target port does not implement.
    UnsupportedRelocation { msg: Cow<'static, str> },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Malformed { msg } => write!(f, "malformed ELF: {msg}"),
            Error::Unsupported { msg } => write!(f, "unsupported target: {msg}"),
            Error::Structural { msg } => write!(f, "structural violation: {msg}"),
            Error::Resolution { msg } => write!(f, "resolution failure: {msg}"),
            Error::Io { msg } => write!(f, "I/O failure: {msg}"),
            Error::Resource { msg } => write!(f, "resource exhaustion: {msg}"),
            Error::UnsupportedRelocation { msg } => write!(f, "unsupported relocation: {msg}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

// Public: a `Host` implementation needs to be able to report its own
// failures (a bad read, an exhausted allocator) as a `crate::Error` too.

#[cold]
#[inline(never)]
pub fn malformed(msg: impl ToString) -> Error {
    Error::Malformed {
        msg: Cow::Owned(msg.to_string()),
    }
}

#[cold]
#[inline(never)]
pub fn unsupported(msg: impl ToString) -> Error {
    Error::Unsupported {
        msg: Cow::Owned(msg.to_string()),
    }
}

#[cold]
#[inline(never)]
pub fn structural(msg: impl ToString) -> Error {
    Error::Structural {
        msg: Cow::Owned(msg.to_string()),
    }
}

#[cold]
#[inline(never)]
pub fn resolution(msg: impl ToString) -> Error {
    Error::Resolution {
        msg: Cow::Owned(msg.to_string()),
    }
}

#[cold]
#[inline(never)]
pub fn io_error(msg: impl ToString) -> Error {
    Error::Io {
        msg: Cow::Owned(msg.to_string()),
    }
}

#[cold]
#[inline(never)]
pub fn resource(msg: impl ToString) -> Error {
    Error::Resource {
        msg: Cow::Owned(msg.to_string()),
    }
}

#[cold]
#[inline(never)]
pub fn unsupported_relocation(ty: u32) -> Error {
    Error::UnsupportedRelocation {
        msg: Cow::Owned(alloc::format!("relocation type {ty}")),
    }
}

pub type Result<T> = core::result::Result<T, Error>;
