//! Core thread-state types
//!
//! Pure data shared by every stage of the conversion: thread and task
//! identities, the two register layouts, the flags word carried next to a
//! 64-bit state, and the option sets that drive export and import.

use alloc::string::String;
use bitflags::bitflags;
use core::fmt;
use serde::{Deserialize, Serialize};

/// Thread identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub u64);

/// A thread as seen by the conversion layer.
///
/// The sigreturn secret never leaves the crate; only tokens derived from it
/// are ever written into user-visible state.
#[derive(Clone)]
pub struct Thread {
    /// Thread ID
    pub tid: ThreadId,
    /// Signing domain of the owning process
    pub jop_pid: u64,
    /// User pointer authentication switched off for this thread
    pub jop_disabled: bool,
    /// Thread runs with a 64-bit address space
    pub is_64bit_addr: bool,
    sigreturn_secret: u64,
}

impl Thread {
    /// A 64-bit thread with pointer authentication enabled.
    pub fn new(tid: ThreadId, jop_pid: u64, sigreturn_secret: u64) -> Self {
        Self {
            tid,
            jop_pid,
            jop_disabled: false,
            is_64bit_addr: true,
            sigreturn_secret,
        }
    }

    /// Turn user pointer authentication off (or back on).
    pub fn with_jop_disabled(mut self, disabled: bool) -> Self {
        self.jop_disabled = disabled;
        self
    }

    /// Mark the thread as running a 32-bit address space.
    pub fn with_32bit_addr(mut self) -> Self {
        self.is_64bit_addr = false;
        self
    }

    /// Register width of this thread's saved state.
    pub fn width(&self) -> Width {
        if self.is_64bit_addr {
            Width::SixtyFour
        } else {
            Width::ThirtyTwo
        }
    }

    pub(crate) fn sigreturn_secret(&self) -> u64 {
        self.sigreturn_secret
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("jop_pid", &self.jop_pid)
            .field("jop_disabled", &self.jop_disabled)
            .field("is_64bit_addr", &self.is_64bit_addr)
            .finish_non_exhaustive()
    }
}

/// The process a thread belongs to.
#[derive(Clone)]
pub struct Task {
    name: String,
    jop_key: u64,
}

impl Task {
    pub fn new(name: impl Into<String>, jop_key: u64) -> Self {
        Self {
            name: name.into(),
            jop_key,
        }
    }

    /// Process name, used in anomaly reports
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn jop_key(&self) -> u64 {
        self.jop_key
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Register width of a saved state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Width {
    ThirtyTwo,
    SixtyFour,
}

/// 32-bit register file. Never carries signed pointers.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterState32 {
    /// r0..r12
    pub r: [u32; 13],
    pub sp: u32,
    pub lr: u32,
    pub pc: u32,
    pub cpsr: u32,
}

/// 64-bit register file plus the conversion flags word.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterState64 {
    /// x0..x28
    pub x: [u64; 29],
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    pub pc: u64,
    pub cpsr: u32,
    pub flags: StateFlags,
}

/// A saved thread state of either width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadState {
    ThirtyTwo(RegisterState32),
    SixtyFour(RegisterState64),
}

impl ThreadState {
    /// A zeroed state of the given width.
    pub fn zeroed(width: Width) -> Self {
        match width {
            Width::ThirtyTwo => Self::ThirtyTwo(RegisterState32::default()),
            Width::SixtyFour => Self::SixtyFour(RegisterState64::default()),
        }
    }

    pub fn width(&self) -> Width {
        match self {
            Self::ThirtyTwo(_) => Width::ThirtyTwo,
            Self::SixtyFour(_) => Width::SixtyFour,
        }
    }

    pub fn as_64(&self) -> Option<&RegisterState64> {
        match self {
            Self::SixtyFour(ts64) => Some(ts64),
            Self::ThirtyTwo(_) => None,
        }
    }

    pub fn as_64_mut(&mut self) -> Option<&mut RegisterState64> {
        match self {
            Self::SixtyFour(ts64) => Some(ts64),
            Self::ThirtyTwo(_) => None,
        }
    }

    /// Program counter, widened.
    pub fn pc(&self) -> u64 {
        match self {
            Self::ThirtyTwo(ts32) => ts32.pc as u64,
            Self::SixtyFour(ts64) => ts64.pc,
        }
    }

    /// Link register, widened.
    pub fn lr(&self) -> u64 {
        match self {
            Self::ThirtyTwo(ts32) => ts32.lr as u64,
            Self::SixtyFour(ts64) => ts64.lr,
        }
    }

    /// Redirect execution. 32-bit states keep the low word.
    pub fn set_pc_lr(&mut self, pc: u64, lr: u64) {
        match self {
            Self::ThirtyTwo(ts32) => {
                ts32.pc = pc as u32;
                ts32.lr = lr as u32;
            }
            Self::SixtyFour(ts64) => {
                ts64.pc = pc;
                ts64.lr = lr;
            }
        }
    }

    /// Drop the flags word before a state is stored in the kernel.
    ///
    /// Flags only describe how the user-visible copy was produced.
    pub fn clear_flags(&mut self) {
        if let Self::SixtyFour(ts64) = self {
            ts64.flags = StateFlags::empty();
        }
    }
}

/// Mask of the per-state user diversifier inside [`StateFlags`]
pub const USER_DIVERSIFIER_MASK: u32 = 0xff00_0000;
const PC_TOKEN_SHIFT: u32 = 16;
const LR_TOKEN_SHIFT: u32 = 20;
const TOKEN_FIELD_MASK: u32 = 0xf;

bitflags! {
    /// Flags word stored in the last word of a 64-bit state.
    ///
    /// The low four bits describe how pc and lr were signed. The token
    /// nibbles and the diversifier byte are sub-fields read and written
    /// through the accessor methods.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct StateFlags: u32 {
        /// State carries raw pointers
        const NO_PTRAUTH = 0x1;
        /// lr was signed by user code with the B key
        const IB_SIGNED_LR = 0x2;
        /// pc was signed by the kernel
        const KERNEL_SIGNED_PC = 0x4;
        /// lr was signed by the kernel
        const KERNEL_SIGNED_LR = 0x8;
        /// Sigreturn token nibble for pc
        const PC_TOKEN = 0x000f_0000;
        /// Sigreturn token nibble for lr
        const LR_TOKEN = 0x00f0_0000;
        /// Per-state user diversifier
        const USER_DIVERSIFIER = USER_DIVERSIFIER_MASK;
    }
}

impl Default for StateFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl StateFlags {
    /// Diversifier byte, left in place (already shifted).
    pub const fn user_diversifier(self) -> u32 {
        self.bits() & USER_DIVERSIFIER_MASK
    }

    pub fn set_user_diversifier(&mut self, diversifier: u32) {
        *self = Self::from_bits_retain(
            (self.bits() & !USER_DIVERSIFIER_MASK) | (diversifier & USER_DIVERSIFIER_MASK),
        );
    }

    pub const fn pc_token(self) -> u32 {
        (self.bits() >> PC_TOKEN_SHIFT) & TOKEN_FIELD_MASK
    }

    pub fn set_pc_token(&mut self, field: u32) {
        self.set_field(PC_TOKEN_SHIFT, field);
    }

    pub const fn lr_token(self) -> u32 {
        (self.bits() >> LR_TOKEN_SHIFT) & TOKEN_FIELD_MASK
    }

    pub fn set_lr_token(&mut self, field: u32) {
        self.set_field(LR_TOKEN_SHIFT, field);
    }

    fn set_field(&mut self, shift: u32, field: u32) {
        let cleared = self.bits() & !(TOKEN_FIELD_MASK << shift);
        *self = Self::from_bits_retain(cleared | ((field & TOKEN_FIELD_MASK) << shift));
    }
}

bitflags! {
    /// Options for converting a kernel state into its user-visible form.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ExportOptions: u32 {
        /// Keep the diversifier already present in the state's flags
        const PRESERVE_FLAGS = 0x1;
        /// Record sigreturn tokens for kernel-signed pc and lr
        const STASH_SIGRETURN_TOKEN = 0x2;
        /// Fresh random diversifier for this export
        const RANDOM_USER_DIV = 0x4;
        /// Diversifier derived from the thread's secret
        const THREAD_USER_DIV = 0x8;
        /// Diversifier for the task's persistent mode
        const TASK_USER_DIV = 0x10;
    }
}

bitflags! {
    /// Options for converting a user-supplied state back into kernel form.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ImportOptions: u32 {
        /// Only pc comes from the caller; everything else from the old state
        const ONLY_PC = 0x1;
        /// Report user changes to kernel-signed pc/lr
        const CHECK_USER_FLAGS = 0x2;
        /// Pin kernel-signed pc/lr to the values in the old state
        const ALLOW_ONLY_USER_PTRS = 0x4;
        /// Verify the stored sigreturn tokens
        const CHECK_SIGRETURN_TOKEN = 0x8;
        /// Reject the state when a sigreturn token does not match
        const ALLOW_ONLY_MATCHING_TOKEN = 0x10;
        /// Diversifier carried in the state's flags
        const RANDOM_USER_DIV = 0x20;
        /// Diversifier derived from the thread's secret
        const THREAD_USER_DIV = 0x40;
        /// Diversifier derived from the task's key
        const TASK_USER_DIV = 0x80;
    }
}
