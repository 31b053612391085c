//! Interrupt masking for conversion critical sections
//!
//! The activity check and the signing/authentication writes that follow it
//! must not be split by a context switch: the keys in effect could change
//! underneath. [`InterruptGuard`] masks interrupts for its lifetime and
//! restores the previous mask state on every exit path.

use zos_ptrauth_hal::{InterruptState, PtrAuthHal};

/// RAII interrupt mask
pub struct InterruptGuard<'a, H: PtrAuthHal> {
    hal: &'a H,
    saved: InterruptState,
}

impl<'a, H: PtrAuthHal> InterruptGuard<'a, H> {
    pub fn new(hal: &'a H) -> Self {
        let saved = hal.disable_interrupts();
        Self { hal, saved }
    }
}

impl<H: PtrAuthHal> Drop for InterruptGuard<'_, H> {
    fn drop(&mut self) {
        self.hal.restore_interrupts(self.saved);
    }
}
