//! Pointer-authentication conversion of thread state
//!
//! `export` turns a kernel-held state (raw pointers) into the form user code
//! sees: pc, lr, sp and fp signed for the target thread, plus a flags word
//! recording how they were signed. `import` goes the other way: it checks
//! an incoming state, optionally pins or verifies kernel-signed pointers,
//! and authenticates every pointer before the state is stored.
//!
//! ```text
//!            +-----------------+   signed + flags   +---------+
//! kernel --->| export_state    |------------------->|  user   |
//! state      +-----------------+                    |  code   |
//!            +-----------------+   maybe modified   |         |
//! kernel <---| import_state    |<-------------------|         |
//! state      +-----------------+                    +---------+
//!                  |
//!                  +--> AnomalyReporter (tampering, token mismatch)
//! ```
//!
//! A failed authentication is not an error here: the HAL returns a
//! poisoned pointer, which faults when the thread resumes.

use zos_ptrauth_hal::{blend_discriminator, string_discriminator, KeyClass, PtrAuthHal};

use crate::anomaly::{AnomalyKind, AnomalyReporter, TelemetrySink};
use crate::config::PtrAuthPolicy;
use crate::diversifier::{self, Direction, DiversifierMode};
use crate::error::ProtectionFailure;
use crate::keyctx::{self, ImportAuthority};
use crate::sync::InterruptGuard;
use crate::token;
use crate::types::{ExportOptions, ImportOptions, RegisterState64, StateFlags, Task, Thread, ThreadState};

pub const PC_DISCRIMINATOR: u16 = string_discriminator("pc");
pub const LR_DISCRIMINATOR: u16 = string_discriminator("lr");
pub const SP_DISCRIMINATOR: u16 = string_discriminator("sp");
pub const FP_DISCRIMINATOR: u16 = string_discriminator("fp");

/// Discriminator for a code pointer, blended with the diversifier if any.
pub fn code_discriminator(tag: u16, user_diversifier: u32) -> u64 {
    if user_diversifier != 0 {
        blend_discriminator(user_diversifier as u64, tag)
    } else {
        tag as u64
    }
}

/// The threads taking part in a conversion.
#[derive(Clone, Copy, Debug)]
pub struct ConversionScope<'a> {
    /// Thread whose execution context runs the conversion
    pub caller: &'a Thread,
    /// Thread whose state is converted
    pub target: &'a Thread,
    /// Task owning `target`
    pub task: &'a Task,
}

impl<'a> ConversionScope<'a> {
    /// A thread converting its own state.
    pub fn own(thread: &'a Thread, task: &'a Task) -> Self {
        Self {
            caller: thread,
            target: thread,
            task,
        }
    }
}

/// Signing and authentication of thread states.
pub struct PacConverter<'a, H: PtrAuthHal, S: TelemetrySink> {
    hal: &'a H,
    reporter: &'a AnomalyReporter<S>,
    policy: &'a PtrAuthPolicy,
}

impl<'a, H: PtrAuthHal, S: TelemetrySink> PacConverter<'a, H, S> {
    pub fn new(hal: &'a H, reporter: &'a AnomalyReporter<S>, policy: &'a PtrAuthPolicy) -> Self {
        Self {
            hal,
            reporter,
            policy,
        }
    }

    /// Export a state for user code. 32-bit states pass through unchanged.
    pub fn export_state(&self, scope: ConversionScope<'_>, state: &mut ThreadState, options: ExportOptions) {
        if let ThreadState::SixtyFour(ts64) = state {
            self.export_state64(scope, ts64, options);
        }
    }

    /// Import a user-supplied state. 32-bit states pass through unchanged.
    ///
    /// An `old` state of a different width is treated as absent.
    pub fn import_state(
        &self,
        scope: ConversionScope<'_>,
        state: &mut ThreadState,
        old: Option<&ThreadState>,
        options: ImportOptions,
    ) -> Result<(), ProtectionFailure> {
        let ThreadState::SixtyFour(ts64) = state else {
            return Ok(());
        };
        let old = old.and_then(ThreadState::as_64);
        self.import_state64(scope, ts64, old, options)
    }

    /// Sign the pointers of a 64-bit state and rebuild its flags word.
    pub fn export_state64(&self, scope: ConversionScope<'_>, ts64: &mut RegisterState64, options: ExportOptions) {
        let hal = self.hal;
        let target = scope.target;

        // lr already carries a user signature (B key) if stripping changes it
        let alt_signed_lr = ts64.lr != 0 && hal.strip_user_ptr(ts64.lr) != ts64.lr;
        let existing = ts64.flags;

        let _irq = InterruptGuard::new(hal);

        // Platform-wide disable mirrors the import side, which stores pointers as given
        if self.policy.user_jop_disabled || !keyctx::is_authentication_active(scope.caller, target) {
            let mut flags = StateFlags::NO_PTRAUTH;
            flags.set(StateFlags::IB_SIGNED_LR, alt_signed_lr);
            ts64.flags = flags;
            return;
        }

        let mut flags = StateFlags::KERNEL_SIGNED_PC;
        if alt_signed_lr {
            flags |= StateFlags::IB_SIGNED_LR;
        } else {
            flags |= StateFlags::KERNEL_SIGNED_LR;
        }

        let user_div = diversifier::select(
            hal,
            DiversifierMode::for_export(options),
            Direction::Export,
            existing,
            target,
            scope.task,
        );
        flags.set_user_diversifier(user_div);

        let jop_pid = target.jop_pid;
        if ts64.pc != 0 {
            ts64.pc = hal.sign_user_ptr(
                ts64.pc,
                KeyClass::Code,
                code_discriminator(PC_DISCRIMINATOR, user_div),
                jop_pid,
            );
        }
        if ts64.lr != 0 && !alt_signed_lr {
            ts64.lr = hal.sign_user_ptr(
                ts64.lr,
                KeyClass::Code,
                code_discriminator(LR_DISCRIMINATOR, user_div),
                jop_pid,
            );
        }
        if ts64.sp != 0 {
            ts64.sp = hal.sign_user_ptr(ts64.sp, KeyClass::Data, SP_DISCRIMINATOR as u64, jop_pid);
        }
        if ts64.fp != 0 {
            ts64.fp = hal.sign_user_ptr(ts64.fp, KeyClass::Data, FP_DISCRIMINATOR as u64, jop_pid);
        }

        // Tokens bind the signed values
        if options.contains(ExportOptions::STASH_SIGRETURN_TOKEN) {
            token::stash(hal, ts64, target, &mut flags);
        }

        ts64.flags = flags;
        debug_assert!(crate::invariants::check_flags(ts64).is_empty());
    }

    /// Validate and authenticate a user-supplied 64-bit state in place.
    ///
    /// On `Err` the caller must discard `ts64`.
    pub fn import_state64(
        &self,
        scope: ConversionScope<'_>,
        ts64: &mut RegisterState64,
        old: Option<&RegisterState64>,
        options: ImportOptions,
    ) -> Result<(), ProtectionFailure> {
        let hal = self.hal;
        let target = scope.target;

        if options.contains(ImportOptions::ONLY_PC) {
            match old {
                Some(old) => {
                    let (pc, flags) = (ts64.pc, ts64.flags);
                    *ts64 = *old;
                    ts64.pc = pc;
                    ts64.flags = flags;
                }
                None => log::error!(
                    "pc-only import for tid={} without a prior state; using incoming state",
                    target.tid.0
                ),
            }
        }

        let _irq = InterruptGuard::new(hal);

        match keyctx::import_authority(scope.caller, target) {
            ImportAuthority::Active => {}
            ImportAuthority::Inactive => return Ok(()),
            ImportAuthority::Denied => {
                log::warn!(
                    "unauthenticated tid={} tried to set state of tid={}",
                    scope.caller.tid.0,
                    target.tid.0
                );
                return Err(ProtectionFailure::UnauthenticatedCaller);
            }
        }

        if ts64.flags.contains(StateFlags::NO_PTRAUTH) {
            if keyctx::user_jop_inactive(target) {
                return Ok(());
            }
            log::debug!("ignoring NO_PTRAUTH claim for tid={}", target.tid.0);
            ts64.flags.remove(StateFlags::NO_PTRAUTH);
        }

        if ts64.flags.contains(StateFlags::IB_SIGNED_LR) && hal.strip_user_ptr(ts64.lr) == ts64.lr {
            log::debug!("ignoring IB_SIGNED_LR claim on unsigned lr for tid={}", target.tid.0);
            ts64.flags.remove(StateFlags::IB_SIGNED_LR);
        }

        if self.policy.user_jop_disabled {
            return Ok(());
        }

        let kernel_signed_pc = ts64.flags.contains(StateFlags::KERNEL_SIGNED_PC);
        let kernel_signed_lr = ts64.flags.contains(StateFlags::KERNEL_SIGNED_LR);

        if options.contains(ImportOptions::CHECK_USER_FLAGS) && (kernel_signed_pc || kernel_signed_lr) {
            if let Some(old) = old {
                let pc_changed = ts64.pc != old.pc;
                let lr_changed = ts64.lr != old.lr;
                if pc_changed || lr_changed {
                    self.report(
                        scope,
                        AnomalyKind::UserPointerMismatch {
                            pc: pc_changed,
                            lr: lr_changed,
                        },
                    );
                }
                if options.contains(ImportOptions::ALLOW_ONLY_USER_PTRS) {
                    ts64.pc = old.pc;
                    ts64.lr = old.lr;
                    ts64.flags.set(
                        StateFlags::IB_SIGNED_LR,
                        old.flags.contains(StateFlags::IB_SIGNED_LR),
                    );
                }
            }
        }

        if options.contains(ImportOptions::CHECK_SIGRETURN_TOKEN) {
            let check = token::verify(hal, ts64, target);
            if !check.passed() {
                self.report(
                    scope,
                    AnomalyKind::SigreturnTokenMismatch {
                        pc: check.pc_mismatch,
                        lr: check.lr_mismatch,
                    },
                );
                if options.contains(ImportOptions::ALLOW_ONLY_MATCHING_TOKEN) {
                    return Err(ProtectionFailure::SigreturnTokenMismatch);
                }
            }
        }

        let user_div = match DiversifierMode::for_import(options) {
            DiversifierMode::Preserve => old.map_or(ts64.flags, |o| o.flags).user_diversifier(),
            mode => diversifier::select(hal, mode, Direction::Import, ts64.flags, target, scope.task),
        };
        let jop_pid = target.jop_pid;
        let alt_signed_lr = ts64.flags.contains(StateFlags::IB_SIGNED_LR);

        if ts64.pc != 0 {
            ts64.pc = hal.auth_user_ptr(
                ts64.pc,
                KeyClass::Code,
                code_discriminator(PC_DISCRIMINATOR, user_div),
                jop_pid,
            );
        }
        if ts64.lr != 0 && !alt_signed_lr {
            ts64.lr = hal.auth_user_ptr(
                ts64.lr,
                KeyClass::Code,
                code_discriminator(LR_DISCRIMINATOR, user_div),
                jop_pid,
            );
        }
        if ts64.sp != 0 {
            ts64.sp = hal.auth_user_ptr(ts64.sp, KeyClass::Data, SP_DISCRIMINATOR as u64, jop_pid);
        }
        if ts64.fp != 0 {
            ts64.fp = hal.auth_user_ptr(ts64.fp, KeyClass::Data, FP_DISCRIMINATOR as u64, jop_pid);
        }

        Ok(())
    }

    fn report(&self, scope: ConversionScope<'_>, kind: AnomalyKind) {
        self.reporter.report(
            self.hal.now_nanos(),
            kind,
            scope.target.tid,
            scope.task.name(),
        );
    }
}
