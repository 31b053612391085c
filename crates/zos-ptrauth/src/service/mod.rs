//! ThreadStateService - the syscall surface for user thread states.
//!
//! Every path that moves a thread's registers across the user/kernel
//! boundary goes through here, so every such path signs on the way out and
//! authenticates on the way in.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ThreadStateService                        │
//! │                                                             │
//! │   thread_get_state ──────┐                                  │
//! │   thread_set_state ──────┤      ┌──────────────────────┐    │
//! │   set_state_pc_only ─────┼─────▶│ codec (words <-> regs)│    │
//! │   set_initial_state ─────┤      └──────────┬───────────┘    │
//! │   deliver_exception ─────┤                 ▼                │
//! │   send_signal/sigreturn ─┘      ┌──────────────────────┐    │
//! │                                 │ PacConverter          │    │
//! │                                 │  export / import      │    │
//! │                                 └──────────┬───────────┘    │
//! │                                            ▼                │
//! │                                 ThreadHandle (saved state)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each operation takes the target's state lock, works on a copy, and
//! only writes the copy back once conversion succeeded.

mod exception;
mod signal;
mod state;

pub use signal::SignalFrame;

use zos_ptrauth_core::{
    AnomalyReporter, CodecError, ConversionScope, Flavor, PacConverter, PtrAuthPolicy,
    TelemetrySink, Thread,
};
use zos_ptrauth_hal::PtrAuthHal;

use crate::error::ThreadStateError;
use crate::thread::ThreadHandle;

/// Thread-state syscalls over a HAL and a telemetry sink.
pub struct ThreadStateService<H: PtrAuthHal, S: TelemetrySink> {
    hal: H,
    reporter: AnomalyReporter<S>,
    policy: PtrAuthPolicy,
}

impl<H: PtrAuthHal, S: TelemetrySink> ThreadStateService<H, S> {
    pub fn new(hal: H, sink: S, policy: PtrAuthPolicy) -> Self {
        log::info!(
            "ptrauth: user_jop_disabled={} enforce_sigreturn_token={} pin_exception_reply_pointers={}",
            policy.user_jop_disabled,
            policy.enforce_sigreturn_token,
            policy.pin_exception_reply_pointers
        );
        let reporter = AnomalyReporter::new(sink, policy.anomaly_rate_limit);
        Self {
            hal,
            reporter,
            policy,
        }
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn reporter(&self) -> &AnomalyReporter<S> {
        &self.reporter
    }

    pub fn policy(&self) -> &PtrAuthPolicy {
        &self.policy
    }

    pub(crate) fn converter(&self) -> PacConverter<'_, H, S> {
        PacConverter::new(&self.hal, &self.reporter, &self.policy)
    }

    // ========================================================================
    // Debugger-style access
    // ========================================================================

    /// Read `target`'s state into `out`; `out.len()` is the requested count.
    ///
    /// Returns the number of words written.
    pub fn thread_get_state(
        &self,
        caller: &Thread,
        target: &ThreadHandle,
        flavor: u32,
        out: &mut [u32],
    ) -> Result<usize, ThreadStateError> {
        state::execute_get_state(self, caller, target, flavor, out)
    }

    /// Replace `target`'s state with a user-supplied one.
    pub fn thread_set_state(
        &self,
        caller: &Thread,
        target: &ThreadHandle,
        flavor: u32,
        words: &[u32],
    ) -> Result<(), ThreadStateError> {
        state::execute_set_state(self, caller, target, flavor, words)
    }

    /// Move only `target`'s pc; every other register keeps its current value.
    pub fn thread_set_state_pc_only(
        &self,
        caller: &Thread,
        target: &ThreadHandle,
        flavor: u32,
        words: &[u32],
    ) -> Result<(), ThreadStateError> {
        state::execute_set_state_pc_only(self, caller, target, flavor, words)
    }

    /// Install the first user state of a thread that has not run yet.
    ///
    /// pc and lr are expected to be signed with the task's diversifier.
    pub fn thread_set_initial_state(
        &self,
        caller: &Thread,
        target: &ThreadHandle,
        flavor: u32,
        words: &[u32],
    ) -> Result<(), ThreadStateError> {
        state::execute_set_initial_state(self, caller, target, flavor, words)
    }

    // ========================================================================
    // Exceptions and signals
    // ========================================================================

    /// Hand `target`'s state to an exception handler and apply its reply.
    ///
    /// `handler` receives the exported state as `count` words of `flavor`
    /// and may modify them in place. The state lock is not held while it
    /// runs, and the reply replaces the saved state as a whole: a state
    /// written by someone else in the meantime is overwritten.
    pub fn deliver_exception<F>(
        &self,
        target: &ThreadHandle,
        flavor: u32,
        count: usize,
        handler: F,
    ) -> Result<(), ThreadStateError>
    where
        F: FnOnce(&mut [u32]),
    {
        exception::execute_deliver_exception(self, target, flavor, count, handler)
    }

    /// Push a signal frame and redirect `target` to its handler.
    pub fn send_signal(
        &self,
        target: &ThreadHandle,
        handler_pc: u64,
        trampoline_lr: u64,
    ) -> Result<SignalFrame, ThreadStateError> {
        signal::execute_send_signal(self, target, handler_pc, trampoline_lr)
    }

    /// Restore `target` from a signal frame.
    pub fn sigreturn(&self, target: &ThreadHandle, frame: &SignalFrame) -> Result<(), ThreadStateError> {
        signal::execute_sigreturn(self, target, frame)
    }
}

/// Conversion scope for `caller` acting on `target`.
pub(in crate::service) fn scope<'a>(caller: &'a Thread, target: &'a ThreadHandle) -> ConversionScope<'a> {
    ConversionScope {
        caller,
        target: target.thread(),
        task: target.task(),
    }
}

pub(in crate::service) fn parse_flavor(raw: u32) -> Result<Flavor, CodecError> {
    Flavor::from_raw(raw).ok_or(CodecError::UnknownFlavor(raw))
}
