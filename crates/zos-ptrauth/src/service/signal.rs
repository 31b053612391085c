//! Signal delivery and sigreturn
//!
//! The interrupted state is saved on the user stack as a unified-flavor
//! frame, signed with a fresh random diversifier and carrying sigreturn
//! tokens. The kernel keeps no per-signal record: on sigreturn the frame is
//! validated purely from its own contents and the thread's secret.

use alloc::vec;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};
use zos_ptrauth_core::codec::{self, ARM_UNIFIED_THREAD_STATE_COUNT};
use zos_ptrauth_core::{
    CodecError, ConversionScope, ExportOptions, Flavor, ImportOptions, TelemetrySink, ThreadState,
};
use zos_ptrauth_hal::PtrAuthHal;

use super::ThreadStateService;
use crate::error::ThreadStateError;
use crate::thread::ThreadHandle;

const FRAME_OPTIONS: ExportOptions =
    ExportOptions::STASH_SIGRETURN_TOKEN.union(ExportOptions::RANDOM_USER_DIV);

/// Machine context saved on the user stack while a signal handler runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalFrame {
    words: Vec<u32>,
}

impl SignalFrame {
    /// Raw unified-flavor words
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    /// Mutable access, as user code has to the stack
    pub fn words_mut(&mut self) -> &mut [u32] {
        &mut self.words
    }

    /// Decode the saved state.
    pub fn state(&self) -> Result<ThreadState, CodecError> {
        let kind = codec::resolve(Flavor::Unified, &self.words)?;
        codec::decode(kind, &self.words)
    }

    /// Overwrite the saved state, as a handler editing its context does.
    pub fn set_state(&mut self, state: &ThreadState) -> Result<(), CodecError> {
        let kind = codec::resolve_for_width(Flavor::Unified, self.words.len(), state.width())?;
        codec::encode(kind, state, &mut self.words)?;
        Ok(())
    }
}

pub(in crate::service) fn execute_send_signal<H: PtrAuthHal, S: TelemetrySink>(
    svc: &ThreadStateService<H, S>,
    target: &ThreadHandle,
    handler_pc: u64,
    trampoline_lr: u64,
) -> Result<SignalFrame, ThreadStateError> {
    let scope = ConversionScope::own(target.thread(), target.task());

    let mut saved = target.lock();
    let mut frame_state = *saved;
    svc.converter().export_state(scope, &mut frame_state, FRAME_OPTIONS);

    let kind = codec::resolve_for_width(
        Flavor::Unified,
        ARM_UNIFIED_THREAD_STATE_COUNT,
        frame_state.width(),
    )?;
    let mut words = vec![0u32; kind.count()];
    codec::encode(kind, &frame_state, &mut words)?;

    saved.set_pc_lr(handler_pc, trampoline_lr);
    log::debug!(
        "signal frame pushed for tid={}, handler={:#x}",
        target.thread().tid.0,
        handler_pc
    );
    Ok(SignalFrame { words })
}

pub(in crate::service) fn execute_sigreturn<H: PtrAuthHal, S: TelemetrySink>(
    svc: &ThreadStateService<H, S>,
    target: &ThreadHandle,
    frame: &SignalFrame,
) -> Result<(), ThreadStateError> {
    let mut state = frame.state()?;
    if state.width() != target.thread().width() {
        return Err(CodecError::WidthMismatch.into());
    }

    let mut options = ImportOptions::CHECK_SIGRETURN_TOKEN | ImportOptions::RANDOM_USER_DIV;
    if svc.policy().enforce_sigreturn_token {
        options |= ImportOptions::ALLOW_ONLY_MATCHING_TOKEN;
    }
    let scope = ConversionScope::own(target.thread(), target.task());

    let mut saved = target.lock();
    if let Err(e) = svc.converter().import_state(scope, &mut state, None, options) {
        log::warn!("sigreturn rejected for tid={}: {}", target.thread().tid.0, e);
        return Err(e.into());
    }
    state.clear_flags();
    *saved = state;
    Ok(())
}
