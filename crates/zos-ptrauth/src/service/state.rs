//! Get/set state handlers
//!
//! - `execute_get_state()` - export the saved state for a caller
//! - `execute_set_state()` - import a full state from a caller
//! - `execute_set_state_pc_only()` - import a state where only pc may move
//! - `execute_set_initial_state()` - import a task-diversified initial state

use zos_ptrauth_core::codec;
use zos_ptrauth_core::{
    CodecError, ExportOptions, ImportOptions, StateFlags, TelemetrySink, Thread, ThreadState,
};
use zos_ptrauth_hal::PtrAuthHal;

use super::{parse_flavor, scope, ThreadStateService};
use crate::error::ThreadStateError;
use crate::thread::ThreadHandle;

pub(in crate::service) fn execute_get_state<H: PtrAuthHal, S: TelemetrySink>(
    svc: &ThreadStateService<H, S>,
    caller: &Thread,
    target: &ThreadHandle,
    flavor: u32,
    out: &mut [u32],
) -> Result<usize, ThreadStateError> {
    let flavor = parse_flavor(flavor)?;
    let saved = target.lock();
    let kind = codec::resolve_for_width(flavor, out.len(), saved.width())?;

    let mut state = *saved;
    svc.converter()
        .export_state(scope(caller, target), &mut state, ExportOptions::empty());
    Ok(codec::encode(kind, &state, out)?)
}

/// Decode an incoming buffer for `target`.
fn decode_for(target: &ThreadHandle, flavor: u32, words: &[u32]) -> Result<ThreadState, ThreadStateError> {
    let flavor = parse_flavor(flavor)?;
    let kind = codec::resolve(flavor, words)?;
    let state = codec::decode(kind, words)?;
    if state.width() != target.thread().width() {
        return Err(CodecError::WidthMismatch.into());
    }
    Ok(state)
}

pub(in crate::service) fn execute_set_state<H: PtrAuthHal, S: TelemetrySink>(
    svc: &ThreadStateService<H, S>,
    caller: &Thread,
    target: &ThreadHandle,
    flavor: u32,
    words: &[u32],
) -> Result<(), ThreadStateError> {
    let mut incoming = decode_for(target, flavor, words)?;

    let mut saved = target.lock();
    svc.converter()
        .import_state(scope(caller, target), &mut incoming, None, ImportOptions::empty())?;

    incoming.clear_flags();
    *saved = incoming;
    log::debug!("tid={} set state of tid={}", caller.tid.0, target.thread().tid.0);
    Ok(())
}

pub(in crate::service) fn execute_set_state_pc_only<H: PtrAuthHal, S: TelemetrySink>(
    svc: &ThreadStateService<H, S>,
    caller: &Thread,
    target: &ThreadHandle,
    flavor: u32,
    words: &[u32],
) -> Result<(), ThreadStateError> {
    let mut incoming = decode_for(target, flavor, words)?;
    let scope = scope(caller, target);
    let converter = svc.converter();

    let mut saved = target.lock();
    // The trusted copy is what the caller would have read
    let mut old = *saved;
    converter.export_state(scope, &mut old, ExportOptions::empty());
    keep_lr_signer(&mut incoming, &old);
    converter.import_state(scope, &mut incoming, Some(&old), ImportOptions::ONLY_PC)?;

    incoming.clear_flags();
    *saved = incoming;
    Ok(())
}

/// lr is not the caller's to move, so neither is the record of who signed it.
fn keep_lr_signer(incoming: &mut ThreadState, old: &ThreadState) {
    const LR_SIGNER: StateFlags = StateFlags::IB_SIGNED_LR.union(StateFlags::KERNEL_SIGNED_LR);

    if let (Some(ts), Some(old)) = (incoming.as_64_mut(), old.as_64()) {
        ts.flags.remove(LR_SIGNER);
        ts.flags.insert(old.flags.intersection(LR_SIGNER));
    }
}

pub(in crate::service) fn execute_set_initial_state<H: PtrAuthHal, S: TelemetrySink>(
    svc: &ThreadStateService<H, S>,
    caller: &Thread,
    target: &ThreadHandle,
    flavor: u32,
    words: &[u32],
) -> Result<(), ThreadStateError> {
    let mut incoming = decode_for(target, flavor, words)?;

    let mut saved = target.lock();
    svc.converter().import_state(
        scope(caller, target),
        &mut incoming,
        None,
        ImportOptions::TASK_USER_DIV,
    )?;

    incoming.clear_flags();
    *saved = incoming;
    log::debug!("initial state installed for tid={}", target.thread().tid.0);
    Ok(())
}
