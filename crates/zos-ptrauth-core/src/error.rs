//! Error types for the conversion layer

use alloc::string::String;

use crate::codec::Flavor;

/// Import refused for security reasons.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtectionFailure {
    /// A caller without pointer authentication tried to set the state of
    /// a thread that has it.
    #[error("unauthenticated caller cannot set state of an authenticated thread")]
    UnauthenticatedCaller,
    /// A stored sigreturn token did not match the recomputed value.
    #[error("sigreturn token mismatch")]
    SigreturnTokenMismatch,
}

/// A thread-state buffer could not be interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unknown thread state flavor {0}")]
    UnknownFlavor(u32),
    #[error("flavor {flavor:?} expects {expected} words, got {got}")]
    CountMismatch {
        flavor: Flavor,
        expected: usize,
        got: usize,
    },
    #[error("unified header names flavor {flavor} with count {count}")]
    UnifiedHeaderMismatch { flavor: u32, count: u32 },
    #[error("output buffer holds {got} words, {needed} needed")]
    BufferTooSmall { needed: usize, got: usize },
    #[error("state width does not match the thread")]
    WidthMismatch,
}

/// Policy configuration could not be loaded.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("malformed policy: {0}")]
    Parse(String),
    #[error("anomaly rate window must be non-zero")]
    ZeroRateWindow,
}
