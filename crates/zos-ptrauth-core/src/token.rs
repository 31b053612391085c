//! Sigreturn tokens
//!
//! A token binds a kernel-signed pc or lr to the thread that received it.
//! It is computed from the pointer and the thread's sigreturn secret, then
//! signed with the data key under the "nonce" discriminator:
//!
//! ```text
//! token = sign_data(ptr ^ secret, disc("nonce"), jop_pid) >> 32
//! ```
//!
//! Only the top nibble of the token (which lies inside the signature bits)
//! fits into the flags word. Comparison is constant time.

use subtle::ConstantTimeEq;
use zos_ptrauth_hal::{string_discriminator, KeyClass, PtrAuthHal};

use crate::types::{RegisterState64, StateFlags, Thread};

/// Discriminator used for sigreturn tokens
pub const NONCE_DISCRIMINATOR: u16 = string_discriminator("nonce");

const TOKEN_FIELD_SHIFT: u32 = 28;

/// Compute the 32-bit sigreturn token for `ptr` on `thread`.
pub fn sigreturn_token<H: PtrAuthHal>(hal: &H, ptr: u64, thread: &Thread) -> u32 {
    let seed = ptr ^ thread.sigreturn_secret();
    let signed = hal.sign_user_ptr(
        seed,
        KeyClass::Data,
        NONCE_DISCRIMINATOR as u64,
        thread.jop_pid,
    );
    (signed >> 32) as u32
}

/// The part of a token stored in a flags sub-field.
pub fn token_field(token: u32) -> u32 {
    token >> TOKEN_FIELD_SHIFT
}

/// Record tokens for the kernel-signed pointers of `ts64` into `flags`.
pub fn stash<H: PtrAuthHal>(hal: &H, ts64: &RegisterState64, thread: &Thread, flags: &mut StateFlags) {
    if flags.contains(StateFlags::KERNEL_SIGNED_PC) {
        flags.set_pc_token(token_field(sigreturn_token(hal, ts64.pc, thread)));
    }
    if flags.contains(StateFlags::KERNEL_SIGNED_LR) {
        flags.set_lr_token(token_field(sigreturn_token(hal, ts64.lr, thread)));
    }
}

/// Result of verifying the tokens of an incoming state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct TokenCheck {
    pub pc_mismatch: bool,
    pub lr_mismatch: bool,
}

impl TokenCheck {
    pub fn passed(&self) -> bool {
        !self.pc_mismatch && !self.lr_mismatch
    }
}

/// Recompute tokens for the kernel-signed pointers of `ts64` and compare
/// them with the stored ones.
pub fn verify<H: PtrAuthHal>(hal: &H, ts64: &RegisterState64, thread: &Thread) -> TokenCheck {
    let mut check = TokenCheck::default();
    let flags = ts64.flags;

    if flags.contains(StateFlags::KERNEL_SIGNED_PC) {
        let expected = token_field(sigreturn_token(hal, ts64.pc, thread));
        check.pc_mismatch = !bool::from(expected.ct_eq(&flags.pc_token()));
    }
    if flags.contains(StateFlags::KERNEL_SIGNED_LR) {
        let expected = token_field(sigreturn_token(hal, ts64.lr, thread));
        check.lr_mismatch = !bool::from(expected.ct_eq(&flags.lr_token()));
    }
    check
}
