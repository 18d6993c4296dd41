//! Error taxonomy for the derived allocation layer.
//!
//! Every failure is reported synchronously. The ABI layer maps these onto the
//! C conventions (null pointer, errno, or a returned error code); nothing here
//! retries, logs to a stream, or aborts.

use std::ffi::c_int;

use thiserror::Error;

/// Failure of a derived allocation operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The primitive `allocate` returned null.
    #[error("primitive allocator could not provide {requested} bytes")]
    OutOfMemory { requested: usize },
    /// Alignment was zero or not a power of two.
    #[error("alignment {alignment} is not a non-zero power of two")]
    InvalidAlignment { alignment: usize },
    /// A size computation would wrap around `usize`.
    #[error("size computation {lhs} x {rhs} overflows")]
    Overflow { lhs: usize, rhs: usize },
}

impl AllocError {
    /// POSIX error code matching this failure.
    #[must_use]
    pub const fn errno(self) -> c_int {
        match self {
            Self::OutOfMemory { .. } | Self::Overflow { .. } => libc::ENOMEM,
            Self::InvalidAlignment { .. } => libc::EINVAL,
        }
    }

    /// Stable outcome label used in lifecycle records.
    #[must_use]
    pub const fn outcome(self) -> &'static str {
        match self {
            Self::OutOfMemory { .. } => "oom",
            Self::InvalidAlignment { .. } => "invalid_alignment",
            Self::Overflow { .. } => "overflow",
        }
    }
}

/// Failure to install the descriptor as the platform default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("descriptor is already registered for this process")]
    AlreadyRegistered,
}

/// Rejected export prefix for the primitive symbol names.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrefixError {
    #[error("export prefix must not be empty")]
    Empty,
    #[error("export prefix must not start with a digit: {0:?}")]
    LeadingDigit(String),
    #[error("export prefix contains {found:?}, which is not valid in a C identifier")]
    InvalidCharacter { found: char },
}
