//! Thread-state syscall errors

use zos_ptrauth_core::{CodecError, ProtectionFailure};

pub const KERN_SUCCESS: i32 = 0;
pub const KERN_PROTECTION_FAILURE: i32 = 2;
pub const KERN_INVALID_ARGUMENT: i32 = 4;

/// Error returned by a thread-state syscall.
///
/// The kernel-held state of the target is unchanged whenever one of these
/// is returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ThreadStateError {
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] CodecError),
    #[error("protection failure: {0}")]
    Protection(#[from] ProtectionFailure),
}

impl ThreadStateError {
    /// Kernel return code for this error
    pub fn kern_return(&self) -> i32 {
        match self {
            Self::InvalidArgument(_) => KERN_INVALID_ARGUMENT,
            Self::Protection(_) => KERN_PROTECTION_FAILURE,
        }
    }
}

/// Collapse a syscall result into its kernel return code.
pub fn kern_return<T>(result: &Result<T, ThreadStateError>) -> i32 {
    match result {
        Ok(_) => KERN_SUCCESS,
        Err(e) => e.kern_return(),
    }
}
