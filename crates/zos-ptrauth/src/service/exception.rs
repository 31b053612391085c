//! Exception delivery
//!
//! The faulting thread's state is exported with a thread-persistent
//! diversifier and sigreturn tokens, handed to the handler, and the reply is
//! imported against the delivered copy. Kernel-signed pc/lr in the reply
//! are checked against that copy and, under the default policy, pinned to it.
//!
//! The state lock is not held while the handler runs. The reply replaces the
//! saved state as a whole, so a `thread_set_state` landing in that window is
//! overwritten; this is detected and logged at commit.

use alloc::vec;
use zos_ptrauth_core::codec;
use zos_ptrauth_core::{CodecError, ConversionScope, ExportOptions, ImportOptions, TelemetrySink};
use zos_ptrauth_hal::PtrAuthHal;

use super::{parse_flavor, ThreadStateService};
use crate::error::ThreadStateError;
use crate::thread::ThreadHandle;

const DELIVERY_OPTIONS: ExportOptions =
    ExportOptions::THREAD_USER_DIV.union(ExportOptions::STASH_SIGRETURN_TOKEN);

pub(in crate::service) fn execute_deliver_exception<H, S, F>(
    svc: &ThreadStateService<H, S>,
    target: &ThreadHandle,
    flavor: u32,
    count: usize,
    handler: F,
) -> Result<(), ThreadStateError>
where
    H: PtrAuthHal,
    S: TelemetrySink,
    F: FnOnce(&mut [u32]),
{
    let flavor = parse_flavor(flavor)?;
    let scope = ConversionScope::own(target.thread(), target.task());
    let converter = svc.converter();

    let (kind, snapshot) = {
        let saved = target.lock();
        let kind = codec::resolve_for_width(flavor, count, saved.width())?;
        (kind, *saved)
    };
    let mut delivered = snapshot;
    converter.export_state(scope, &mut delivered, DELIVERY_OPTIONS);

    let mut words = vec![0u32; count];
    codec::encode(kind, &delivered, &mut words)?;

    handler(&mut words);

    let reply_kind = codec::resolve(flavor, &words)?;
    let mut reply = codec::decode(reply_kind, &words)?;
    if reply.width() != delivered.width() {
        return Err(CodecError::WidthMismatch.into());
    }

    let mut options = ImportOptions::CHECK_USER_FLAGS | ImportOptions::THREAD_USER_DIV;
    if svc.policy().pin_exception_reply_pointers {
        options |= ImportOptions::ALLOW_ONLY_USER_PTRS;
    }

    let mut saved = target.lock();
    converter.import_state(scope, &mut reply, Some(&delivered), options)?;
    if *saved != snapshot {
        log::warn!(
            "state of tid={} changed while its exception handler ran; reply overrides it",
            target.thread().tid.0
        );
    }
    reply.clear_flags();
    *saved = reply;
    Ok(())
}
