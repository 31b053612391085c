//! Mock HAL implementation for testing the thread-state conversion layer
//!
//! This provides a software pointer-authentication engine that mimics the
//! ARMv8.3 bit layout closely enough for the conversion layer to be tested
//! without PAC hardware:
//!
//! ```text
//! 63        56| 55 |54      47|46      0|
//! +-----------+----+----------+---------+
//! | PAC[15:8] | EL | PAC[7:0] | Address |
//! +-----------+----+----------+---------+
//! ```
//!
//! The PAC is a truncated SHA-256 over a per-instance master key, the key
//! class, the discriminator, the signing domain id and the pointer. A failed
//! authentication returns the stripped pointer with an error bit set in the
//! PAC field, which makes it non-canonical and therefore unusable.

#![no_std]
extern crate alloc;

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use sha2::{Digest, Sha256};
use spin::Mutex;
use zos_ptrauth_hal::{InterruptState, KeyClass, PtrAuthHal};

/// Number of virtual address bits in a user pointer
pub const VA_BITS: u32 = 47;

/// Mask of the address part of a user pointer
pub const VA_MASK: u64 = (1 << VA_BITS) - 1;

/// Bit selecting the kernel half of the address space
pub const KERNEL_BIT: u64 = 1 << 55;

/// All bits that hold the PAC
pub const PAC_FIELD_MASK: u64 = 0xFF7F_8000_0000_0000;

/// Error bit set by a failed authentication with the code key
pub const POISON_CODE: u64 = 1 << 53;

/// Error bit set by a failed authentication with the data key
pub const POISON_DATA: u64 = 1 << 54;

/// Returns the 16-bit PAC stored in a signed pointer
pub fn extract_pac(signed: u64) -> u16 {
    let low = (signed >> VA_BITS) & 0xFF;
    let high = (signed >> 56) & 0xFF;
    ((high << 8) | low) as u16
}

/// Encodes a PAC into a stripped pointer
pub fn encode_pac(pac: u16, stripped: u64) -> u64 {
    let low = (pac as u64 & 0xFF) << VA_BITS;
    let high = ((pac as u64 >> 8) & 0xFF) << 56;
    (stripped & !PAC_FIELD_MASK) | low | high
}

/// Whether a value carries an authentication error bit
pub fn is_poisoned(ptr: u64) -> bool {
    ptr & KERNEL_BIT == 0 && ptr & (POISON_CODE | POISON_DATA) != 0
}

/// Mock HAL for unit testing
///
/// Provides software pointer authentication, a deterministic (or scripted)
/// random source, simulated time and interrupt-mask bookkeeping.
pub struct MockHal {
    /// Master key for the software PAC
    master_key: [u8; 32],
    /// Simulated time in nanoseconds
    time: AtomicU64,
    /// Random seed for deterministic testing
    random_seed: AtomicU64,
    /// Values returned by `random_u64` before falling back to the seed
    scripted_random: Mutex<VecDeque<u64>>,
    /// Current interrupt mask state
    interrupts_enabled: AtomicBool,
    /// Number of times interrupts were masked
    interrupt_disables: AtomicU64,
    /// Number of sign operations performed
    signs: AtomicU64,
    /// Number of authenticate operations performed
    auths: AtomicU64,
}

impl MockHal {
    /// Create a new mock HAL with a fixed key
    pub fn new() -> Self {
        Self::with_seed(12345) // Deterministic seed
    }

    /// Create a mock HAL whose key and random stream derive from `seed`
    pub fn with_seed(seed: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"zos-ptrauth-mock-key");
        hasher.update(seed.to_le_bytes());
        let mut master_key = [0u8; 32];
        master_key.copy_from_slice(&hasher.finalize());
        Self::with_key(master_key, seed)
    }

    /// Create a mock HAL keyed from the operating system's entropy source
    pub fn from_entropy() -> Result<Self, getrandom::Error> {
        let mut master_key = [0u8; 32];
        getrandom::getrandom(&mut master_key)?;
        let mut seed = [0u8; 8];
        getrandom::getrandom(&mut seed)?;
        Ok(Self::with_key(master_key, u64::from_le_bytes(seed)))
    }

    fn with_key(master_key: [u8; 32], seed: u64) -> Self {
        Self {
            master_key,
            time: AtomicU64::new(0),
            random_seed: AtomicU64::new(seed),
            scripted_random: Mutex::new(VecDeque::new()),
            interrupts_enabled: AtomicBool::new(true),
            interrupt_disables: AtomicU64::new(0),
            signs: AtomicU64::new(0),
            auths: AtomicU64::new(0),
        }
    }

    /// Advance the simulated time by the given duration
    pub fn advance_time(&self, nanos: u64) {
        self.time.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Set the simulated time to a specific value
    pub fn set_time(&self, nanos: u64) {
        self.time.store(nanos, Ordering::SeqCst);
    }

    /// Queue values to be returned by the next `random_u64` calls
    pub fn push_random(&self, values: &[u64]) {
        self.scripted_random.lock().extend(values.iter().copied());
    }

    /// Whether interrupts are currently unmasked
    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled.load(Ordering::SeqCst)
    }

    /// How many times interrupts have been masked
    pub fn interrupt_disable_count(&self) -> u64 {
        self.interrupt_disables.load(Ordering::SeqCst)
    }

    /// Number of sign operations performed so far
    pub fn sign_count(&self) -> u64 {
        self.signs.load(Ordering::SeqCst)
    }

    /// Number of authenticate operations performed so far
    pub fn auth_count(&self) -> u64 {
        self.auths.load(Ordering::SeqCst)
    }

    fn compute_pac(&self, value: u64, key: KeyClass, discriminator: u64, jop_pid: u64) -> u16 {
        let mut hasher = Sha256::new();
        hasher.update(self.master_key);
        hasher.update([key as u8]);
        hasher.update(discriminator.to_le_bytes());
        hasher.update(jop_pid.to_le_bytes());
        hasher.update(value.to_le_bytes());
        let digest = hasher.finalize();
        u16::from_le_bytes([digest[0], digest[1]])
    }

    fn sign_inner(&self, ptr: u64, key: KeyClass, discriminator: u64, jop_pid: u64) -> u64 {
        // The MAC covers the whole input: a non-canonical pointer gets a PAC
        // that can never authenticate, as on hardware.
        let pac = self.compute_pac(ptr, key, discriminator, jop_pid);
        encode_pac(pac, self.strip_user_ptr(ptr))
    }
}

impl Default for MockHal {
    fn default() -> Self {
        Self::new()
    }
}

impl PtrAuthHal for MockHal {
    fn sign_user_ptr(&self, ptr: u64, key: KeyClass, discriminator: u64, jop_pid: u64) -> u64 {
        self.signs.fetch_add(1, Ordering::SeqCst);
        self.sign_inner(ptr, key, discriminator, jop_pid)
    }

    fn auth_user_ptr(&self, ptr: u64, key: KeyClass, discriminator: u64, jop_pid: u64) -> u64 {
        self.auths.fetch_add(1, Ordering::SeqCst);
        let stripped = self.strip_user_ptr(ptr);
        if self.sign_inner(stripped, key, discriminator, jop_pid) == ptr {
            stripped
        } else {
            let poison = match key {
                KeyClass::Code => POISON_CODE,
                KeyClass::Data => POISON_DATA,
            };
            (stripped & VA_MASK) | poison
        }
    }

    fn strip_user_ptr(&self, ptr: u64) -> u64 {
        if ptr & KERNEL_BIT != 0 {
            ptr | !VA_MASK
        } else {
            ptr & VA_MASK
        }
    }

    fn random_u64(&self) -> u64 {
        if let Some(value) = self.scripted_random.lock().pop_front() {
            return value;
        }
        // splitmix64 for deterministic "random" values in tests
        let seed = self
            .random_seed
            .fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::SeqCst)
            .wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = seed;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn now_nanos(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }

    fn disable_interrupts(&self) -> InterruptState {
        self.interrupt_disables.fetch_add(1, Ordering::SeqCst);
        InterruptState {
            was_enabled: self.interrupts_enabled.swap(false, Ordering::SeqCst),
        }
    }

    fn restore_interrupts(&self, state: InterruptState) {
        self.interrupts_enabled
            .store(state.was_enabled, Ordering::SeqCst);
    }
}
