//! Hardware Abstraction Layer for user pointer authentication
//!
//! This crate defines the trait through which the thread-state conversion
//! layer reaches the platform. Everything behind it is treated as an opaque
//! capability:
//!
//! - **Pointer authentication**: sign / authenticate / strip a user pointer
//!   for a key class, a 64-bit discriminator and a signing domain id
//! - **Entropy**: a secure random draw
//! - **Time**: a monotonic clock (used for telemetry rate limiting)
//! - **Interrupts**: mask and restore on the current core
//!
//! # Platform Implementations
//!
//! - **ARMv8.3+**: `PACIA`/`PACDA`/`AUTIA`/`AUTDA`/`XPACI` with per-process keys
//! - **Tests**: `zos-ptrauth-hal-mock` provides a software engine
//! - **No PAC hardware**: [`TestHal`] passes pointers through unchanged

#![no_std]

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Key class used for a signing operation.
///
/// Code pointers (pc, lr) and data pointers (sp, fp, sigreturn tokens) are
/// signed under independent keys so a signature cannot be replayed across
/// the two classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyClass {
    /// Process-independent instruction key (IA)
    Code = 0,
    /// Process-independent data key (DA)
    Data = 1,
}

impl KeyClass {
    /// Convert from u8
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Code),
            1 => Some(Self::Data),
            _ => None,
        }
    }
}

/// Interrupt mask state captured by [`PtrAuthHal::disable_interrupts`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InterruptState {
    /// Whether interrupts were enabled before masking
    pub was_enabled: bool,
}

/// Low bits of a value kept when blending in a discriminator.
pub const BLEND_VALUE_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Compute the 16-bit discriminator for a string tag at compile time.
///
/// Never returns zero, so a blended discriminator always differs from the
/// plain value it was blended into.
pub const fn string_discriminator(tag: &str) -> u16 {
    let bytes = tag.as_bytes();
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        i += 1;
    }
    ((hash % 0xFFFF) + 1) as u16
}

/// Blend a 16-bit discriminator into the top bits of `value`.
pub const fn blend_discriminator(value: u64, discriminator: u16) -> u64 {
    (value & BLEND_VALUE_MASK) | ((discriminator as u64) << 48)
}

/// Hardware Abstraction Layer trait
///
/// Implementations must never block: every method is called from syscall
/// and exception-return paths, some of them with interrupts masked.
pub trait PtrAuthHal: Send + Sync + 'static {
    // === Pointer Authentication ===

    /// Sign a user pointer.
    ///
    /// # Arguments
    /// * `ptr` - Raw pointer value
    /// * `key` - Key class to sign under
    /// * `discriminator` - Context tag (possibly blended with a diversifier)
    /// * `jop_pid` - Signing domain id of the thread the pointer belongs to
    fn sign_user_ptr(&self, ptr: u64, key: KeyClass, discriminator: u64, jop_pid: u64) -> u64;

    /// Authenticate a signed user pointer.
    ///
    /// Returns the raw pointer on success. On failure returns a poisoned
    /// value that is guaranteed to fault when used as an address; this
    /// method never reports failure any other way.
    fn auth_user_ptr(&self, ptr: u64, key: KeyClass, discriminator: u64, jop_pid: u64) -> u64;

    /// Remove any signature bits from a user pointer without checking them.
    fn strip_user_ptr(&self, ptr: u64) -> u64;

    // === Time & Entropy ===

    /// Draw 64 bits from the platform's secure random source.
    fn random_u64(&self) -> u64;

    /// Get current time in nanoseconds (monotonic)
    fn now_nanos(&self) -> u64;

    // === Interrupts ===

    /// Mask interrupts on the current core, returning the previous state.
    fn disable_interrupts(&self) -> InterruptState;

    /// Restore the interrupt state captured by `disable_interrupts`.
    fn restore_interrupts(&self, state: InterruptState);
}

/// A minimal HAL for platforms without pointer authentication hardware.
///
/// Signing, authentication and stripping are the identity function, which is
/// what user pointers look like when the CPU does not implement PAC.
pub struct TestHal {
    time: AtomicU64,
    random_state: AtomicU64,
    interrupts_enabled: AtomicBool,
}

impl TestHal {
    pub fn new() -> Self {
        Self {
            time: AtomicU64::new(0),
            random_state: AtomicU64::new(0x9E37_79B9_7F4A_7C15),
            interrupts_enabled: AtomicBool::new(true),
        }
    }

    /// Advance the clock
    pub fn advance_time(&self, nanos: u64) {
        self.time.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Whether interrupts are currently unmasked
    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled.load(Ordering::SeqCst)
    }
}

impl Default for TestHal {
    fn default() -> Self {
        Self::new()
    }
}

impl PtrAuthHal for TestHal {
    fn sign_user_ptr(&self, ptr: u64, _key: KeyClass, _discriminator: u64, _jop_pid: u64) -> u64 {
        ptr
    }

    fn auth_user_ptr(&self, ptr: u64, _key: KeyClass, _discriminator: u64, _jop_pid: u64) -> u64 {
        ptr
    }

    fn strip_user_ptr(&self, ptr: u64) -> u64 {
        ptr
    }

    fn random_u64(&self) -> u64 {
        // xorshift64*; good enough for a HAL that only exists for tests
        let mut x = self.random_state.load(Ordering::Relaxed);
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.random_state.store(x, Ordering::Relaxed);
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn now_nanos(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }

    fn disable_interrupts(&self) -> InterruptState {
        InterruptState {
            was_enabled: self.interrupts_enabled.swap(false, Ordering::SeqCst),
        }
    }

    fn restore_interrupts(&self, state: InterruptState) {
        self.interrupts_enabled
            .store(state.was_enabled, Ordering::SeqCst);
    }
}
