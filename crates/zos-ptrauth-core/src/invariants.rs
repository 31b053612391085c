//! Flags-word invariants
//!
//! Runtime-checkable properties of an exported 64-bit state. Used for:
//! 1. Debug assertions after every export
//! 2. Property-based tests
//! 3. Formal verification with Kani
//!
//! # Invariants
//!
//! 1. **NoAuth Exclusivity**: a state carrying raw pointers has no kernel
//!    signing bits, no tokens and no diversifier
//! 2. **Single LR Signer**: lr is signed by the kernel or by user code, never both
//! 3. **Token Coverage**: a token nibble is only present for a kernel-signed pointer

use alloc::string::String;
use alloc::vec::Vec;

use crate::types::{RegisterState64, StateFlags};

/// An invariant violation with details
#[derive(Clone, Debug)]
pub struct InvariantViolation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// Description of what went wrong
    pub description: String,
}

/// Check all flags invariants of `state`.
///
/// Returns a list of violations (empty if all invariants hold).
pub fn check_flags(state: &RegisterState64) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let flags = state.flags;

    violations.extend(check_no_auth_exclusivity(flags));
    violations.extend(check_single_lr_signer(flags));
    violations.extend(check_token_coverage(flags));

    violations
}

/// Invariant 1: NoAuth excludes every signing artifact
fn check_no_auth_exclusivity(flags: StateFlags) -> Option<InvariantViolation> {
    if !flags.contains(StateFlags::NO_PTRAUTH) {
        return None;
    }
    let signed = flags.intersects(StateFlags::KERNEL_SIGNED_PC | StateFlags::KERNEL_SIGNED_LR);
    let tokens = flags.pc_token() != 0 || flags.lr_token() != 0;
    let diversified = flags.user_diversifier() != 0;

    (signed || tokens || diversified).then(|| InvariantViolation {
        invariant: "no_auth_exclusivity",
        description: alloc::format!(
            "NO_PTRAUTH set alongside signing state (flags {:#010x})",
            flags.bits()
        ),
    })
}

/// Invariant 2: lr has exactly one signer
fn check_single_lr_signer(flags: StateFlags) -> Option<InvariantViolation> {
    flags
        .contains(StateFlags::IB_SIGNED_LR | StateFlags::KERNEL_SIGNED_LR)
        .then(|| InvariantViolation {
            invariant: "single_lr_signer",
            description: String::from("lr marked both user-signed and kernel-signed"),
        })
}

/// Invariant 3: tokens only for kernel-signed pointers
fn check_token_coverage(flags: StateFlags) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    if flags.pc_token() != 0 && !flags.contains(StateFlags::KERNEL_SIGNED_PC) {
        violations.push(InvariantViolation {
            invariant: "token_coverage",
            description: alloc::format!("pc token {:#x} without kernel-signed pc", flags.pc_token()),
        });
    }
    if flags.lr_token() != 0 && !flags.contains(StateFlags::KERNEL_SIGNED_LR) {
        violations.push(InvariantViolation {
            invariant: "token_coverage",
            description: alloc::format!("lr token {:#x} without kernel-signed lr", flags.lr_token()),
        });
    }

    violations
}


#[cfg(kani)]
mod proofs {
    use super::*;

    /// Setting the diversifier never disturbs the signing bits or tokens.
    #[kani::proof]
    fn proof_diversifier_write_is_isolated() {
        let bits: u32 = kani::any();
        let div: u32 = kani::any();
        let mut flags = StateFlags::from_bits_retain(bits);
        flags.set_user_diversifier(div);

        kani::assert(flags.bits() & 0x00ff_ffff == bits & 0x00ff_ffff, "low bits preserved");
        kani::assert(flags.user_diversifier() == div & 0xff00_0000, "diversifier stored in place");
    }

    /// A token write only touches its own nibble.
    #[kani::proof]
    fn proof_token_write_is_isolated() {
        let bits: u32 = kani::any();
        let field: u32 = kani::any();
        let mut flags = StateFlags::from_bits_retain(bits);
        flags.set_pc_token(field);

        kani::assert(flags.pc_token() == field & 0xf, "pc token stored");
        kani::assert(flags.lr_token() == (bits >> 20) & 0xf, "lr token untouched");
        kani::assert(flags.user_diversifier() == bits & 0xff00_0000, "diversifier untouched");
    }
}
