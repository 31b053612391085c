//! User diversifier selection
//!
//! The diversifier is an 8-bit value stored in place in the top byte of the
//! flags word. When non-zero it is blended into the discriminator used for
//! pc and lr, so a signed pointer only authenticates alongside the same
//! diversifier.

use zos_ptrauth_hal::{string_discriminator, KeyClass, PtrAuthHal};

use crate::types::{ExportOptions, ImportOptions, StateFlags, Task, Thread, USER_DIVERSIFIER_MASK};

/// Where the diversifier for a conversion comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiversifierMode {
    /// No diversifier
    None,
    /// Reuse the value already in a flags word
    Preserve,
    /// Fresh random value
    RandomPerCall,
    /// Stable per-thread value derived from the thread's secret
    ThreadPersistent,
    /// Stable per-task value derived from the task's key
    TaskPersistent,
}

/// Direction of a conversion
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Export,
    Import,
}

impl DiversifierMode {
    /// Mode selected by export options; the first matching option wins.
    pub fn for_export(options: ExportOptions) -> Self {
        if options.contains(ExportOptions::PRESERVE_FLAGS) {
            Self::Preserve
        } else if options.contains(ExportOptions::RANDOM_USER_DIV) {
            Self::RandomPerCall
        } else if options.contains(ExportOptions::THREAD_USER_DIV) {
            Self::ThreadPersistent
        } else if options.contains(ExportOptions::TASK_USER_DIV) {
            Self::TaskPersistent
        } else {
            Self::None
        }
    }

    /// Mode selected by import options.
    ///
    /// A random diversifier cannot be recomputed, so on import it is read
    /// back from flags.
    pub fn for_import(options: ImportOptions) -> Self {
        if options.contains(ImportOptions::RANDOM_USER_DIV) {
            Self::Preserve
        } else if options.contains(ImportOptions::THREAD_USER_DIV) {
            Self::ThreadPersistent
        } else if options.contains(ImportOptions::TASK_USER_DIV) {
            Self::TaskPersistent
        } else {
            Self::None
        }
    }
}

/// Draw a random diversifier. Never zero.
pub fn random_diversifier<H: PtrAuthHal>(hal: &H) -> u32 {
    loop {
        let diversifier = (hal.random_u64() as u32) & USER_DIVERSIFIER_MASK;
        if diversifier != 0 {
            return diversifier;
        }
    }
}

/// Discriminator for deriving thread-persistent diversifiers
pub const THREAD_DIVERSIFIER_DISCRIMINATOR: u16 = string_discriminator("thread-div");

/// Diversifier tied to a thread for its whole lifetime.
///
/// Taken from the signature bits of a data-key signature over the thread's
/// secret, so the value written into exported flags reveals no secret bits.
pub fn thread_persistent<H: PtrAuthHal>(hal: &H, thread: &Thread) -> u32 {
    let signed = hal.sign_user_ptr(
        thread.sigreturn_secret(),
        KeyClass::Data,
        THREAD_DIVERSIFIER_DISCRIMINATOR as u64,
        thread.jop_pid,
    );
    ((signed >> 32) as u32) & USER_DIVERSIFIER_MASK
}

/// Diversifier tied to a task's key.
///
/// This is the value user code signs with for its own initial states; the
/// kernel never writes it into an exported state.
pub fn task_persistent(task: &Task) -> u32 {
    (task.jop_key() as u32) & USER_DIVERSIFIER_MASK
}

/// Select the diversifier for a conversion.
///
/// `existing` is the flags word `Preserve` reads from.
pub fn select<H: PtrAuthHal>(
    hal: &H,
    mode: DiversifierMode,
    direction: Direction,
    existing: StateFlags,
    thread: &Thread,
    task: &Task,
) -> u32 {
    match mode {
        DiversifierMode::None => 0,
        DiversifierMode::Preserve => existing.user_diversifier(),
        DiversifierMode::RandomPerCall => random_diversifier(hal),
        DiversifierMode::ThreadPersistent => thread_persistent(hal, thread),
        DiversifierMode::TaskPersistent => match direction {
            // Exports must not leak the task key; treat them like a random draw
            Direction::Export => random_diversifier(hal),
            Direction::Import => task_persistent(task),
        },
    }
}
