//! Key context: does pointer authentication apply to this thread pair?
//!
//! Two threads take part in every conversion: the caller whose execution
//! context runs the conversion, and the target whose state is converted.
//! Signing is skipped only when neither of them authenticates pointers.
//!
//! ```text
//!                 target active        target inactive
//! caller active   Active               Active
//! caller inactive export: Active       Inactive
//!                 import: Denied
//! ```

use crate::types::Thread;

/// Whether `thread` runs without user pointer authentication.
pub fn user_jop_inactive(thread: &Thread) -> bool {
    thread.jop_disabled || !thread.is_64bit_addr
}

/// Whether an exported state must be signed.
///
/// A caller with authentication disabled still signs pointers that belong
/// to a target which authenticates them.
pub fn is_authentication_active(caller: &Thread, target: &Thread) -> bool {
    !(user_jop_inactive(caller) && user_jop_inactive(target))
}

/// Outcome of the import-side authority check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImportAuthority {
    /// Validate and authenticate the incoming pointers
    Active,
    /// Neither side authenticates; accept the state as-is
    Inactive,
    /// Caller cannot produce signed pointers for this target
    Denied,
}

/// Decide how an import from `caller` into `target` proceeds.
///
/// FAIL CLOSED: an unauthenticated caller never writes into an
/// authenticated thread.
pub fn import_authority(caller: &Thread, target: &Thread) -> ImportAuthority {
    match (user_jop_inactive(caller), user_jop_inactive(target)) {
        (true, true) => ImportAuthority::Inactive,
        (true, false) => ImportAuthority::Denied,
        (false, _) => ImportAuthority::Active,
    }
}


#[cfg(kani)]
mod proofs {
    use super::*;
    use crate::types::ThreadId;

    fn any_thread() -> Thread {
        let disabled: bool = kani::any();
        let wide: bool = kani::any();
        let mut thread = Thread::new(ThreadId(kani::any()), kani::any(), kani::any());
        thread.jop_disabled = disabled;
        thread.is_64bit_addr = wide;
        thread
    }

    /// An import is denied exactly when export would still sign for the target.
    #[kani::proof]
    fn proof_denied_only_for_unauthenticated_caller() {
        let caller = any_thread();
        let target = any_thread();
        let authority = import_authority(&caller, &target);

        if authority == ImportAuthority::Denied {
            kani::assert(user_jop_inactive(&caller), "denied caller must be inactive");
            kani::assert(!user_jop_inactive(&target), "denied target must be active");
        }
    }

    /// Import skips authentication only when export skips signing.
    #[kani::proof]
    fn proof_inactive_matches_export() {
        let caller = any_thread();
        let target = any_thread();
        let skip_import = import_authority(&caller, &target) == ImportAuthority::Inactive;
        let skip_export = !is_authentication_active(&caller, &target);
        kani::assert(skip_import == skip_export, "import and export agree on inactivity");
    }
}
