//! Zero OS Thread-State Syscalls
//!
//! This crate wires the pointer-authentication conversion layer into the
//! kernel paths that move user register state across the boundary:
//! - Debugger access (`thread_get_state` / `thread_set_state`)
//! - pc-only updates and initial state for not-yet-run threads
//! - Exception delivery and reply
//! - Signal frames and sigreturn
//!
//! States held by the kernel always contain raw pointers; states seen by
//! user code always contain signed ones.

#![no_std]
extern crate alloc;

pub mod error;
pub mod service;
pub mod thread;

pub use error::{kern_return, ThreadStateError, KERN_INVALID_ARGUMENT, KERN_PROTECTION_FAILURE, KERN_SUCCESS};
pub use service::{SignalFrame, ThreadStateService};
pub use thread::ThreadHandle;

// Re-export core types used at the syscall surface
pub use zos_ptrauth_core::codec::{
    ARM_THREAD_STATE, ARM_THREAD_STATE32, ARM_THREAD_STATE32_COUNT, ARM_THREAD_STATE64,
    ARM_THREAD_STATE64_COUNT, ARM_UNIFIED_THREAD_STATE_COUNT,
};
pub use zos_ptrauth_core::{
    AnomalyKind, AnomalyLog, AnomalyRecord, PtrAuthPolicy, Task, TelemetrySink, Thread, ThreadId,
    ThreadState,
};
