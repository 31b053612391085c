//! Thread-state wire codec
//!
//! A thread state crosses the user/kernel boundary as an array of 32-bit
//! words tagged with a flavor. Three flavors are understood:
//!
//! ```text
//! flavor            id  words  layout
//! ----------------  --  -----  ---------------------------------------
//! ARM_THREAD_STATE   1     70  [inner flavor, inner count, inner words]
//! ARM_THREAD_STATE64 6     68  x0..x28, fp, lr, sp, pc, cpsr, flags
//! ARM_THREAD_STATE32 9     17  r0..r12, sp, lr, pc, cpsr
//! ```
//!
//! 64-bit registers occupy two words, low word first. Older callers send
//! `ARM_THREAD_STATE` with only 17 words; such a buffer is a bare 32-bit
//! state with no header.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::types::{RegisterState32, RegisterState64, StateFlags, ThreadState, Width};

pub const ARM_THREAD_STATE: u32 = 1;
pub const ARM_THREAD_STATE64: u32 = 6;
pub const ARM_THREAD_STATE32: u32 = 9;

pub const ARM_THREAD_STATE32_COUNT: usize = 17;
pub const ARM_THREAD_STATE64_COUNT: usize = 68;
pub const ARM_UNIFIED_THREAD_STATE_COUNT: usize = 70;

const UNIFIED_HEADER_WORDS: usize = 2;

// 64-bit word offsets
const X_WORDS: usize = 0;
const FP_WORD: usize = 58;
const LR_WORD: usize = 60;
const SP_WORD: usize = 62;
const PC_WORD: usize = 64;
const CPSR64_WORD: usize = 66;
const FLAGS_WORD: usize = 67;

// 32-bit word offsets
const SP32_WORD: usize = 13;
const LR32_WORD: usize = 14;
const PC32_WORD: usize = 15;
const CPSR32_WORD: usize = 16;

/// Thread-state flavor understood by the conversion layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flavor {
    /// Header plus a state of either width
    Unified,
    ThirtyTwo,
    SixtyFour,
}

impl Flavor {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            ARM_THREAD_STATE => Some(Self::Unified),
            ARM_THREAD_STATE32 => Some(Self::ThirtyTwo),
            ARM_THREAD_STATE64 => Some(Self::SixtyFour),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::Unified => ARM_THREAD_STATE,
            Self::ThirtyTwo => ARM_THREAD_STATE32,
            Self::SixtyFour => ARM_THREAD_STATE64,
        }
    }

    /// Full word count for this flavor
    pub fn count(self) -> usize {
        match self {
            Self::Unified => ARM_UNIFIED_THREAD_STATE_COUNT,
            Self::ThirtyTwo => ARM_THREAD_STATE32_COUNT,
            Self::SixtyFour => ARM_THREAD_STATE64_COUNT,
        }
    }

    /// The direct flavor carrying a state of this width.
    pub fn for_width(width: Width) -> Self {
        match width {
            Width::ThirtyTwo => Self::ThirtyTwo,
            Width::SixtyFour => Self::SixtyFour,
        }
    }
}

/// Concrete layout of a buffer after flavor resolution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateKind {
    /// Bare 32-bit state (including the legacy unified form)
    ThirtyTwoBit,
    /// Bare 64-bit state
    SixtyFourBit,
    /// Unified header followed by a state of the given width
    Unified(Width),
}

impl StateKind {
    pub fn width(self) -> Width {
        match self {
            Self::ThirtyTwoBit => Width::ThirtyTwo,
            Self::SixtyFourBit => Width::SixtyFour,
            Self::Unified(width) => width,
        }
    }

    /// Number of words the layout occupies.
    pub fn count(self) -> usize {
        match self {
            Self::ThirtyTwoBit => ARM_THREAD_STATE32_COUNT,
            Self::SixtyFourBit => ARM_THREAD_STATE64_COUNT,
            Self::Unified(_) => ARM_UNIFIED_THREAD_STATE_COUNT,
        }
    }

    /// Whether pointer signing applies to this layout at all.
    pub fn carries_signed_pointers(self) -> bool {
        self.width() == Width::SixtyFour
    }
}

fn check_count(flavor: Flavor, expected: usize, got: usize) -> Result<(), CodecError> {
    if expected != got {
        return Err(CodecError::CountMismatch {
            flavor,
            expected,
            got,
        });
    }
    Ok(())
}

/// Resolve an incoming buffer; its length is the declared word count.
pub fn resolve(flavor: Flavor, words: &[u32]) -> Result<StateKind, CodecError> {
    match flavor {
        Flavor::ThirtyTwo => {
            check_count(flavor, ARM_THREAD_STATE32_COUNT, words.len())?;
            Ok(StateKind::ThirtyTwoBit)
        }
        Flavor::SixtyFour => {
            check_count(flavor, ARM_THREAD_STATE64_COUNT, words.len())?;
            Ok(StateKind::SixtyFourBit)
        }
        Flavor::Unified if words.len() == ARM_THREAD_STATE32_COUNT => Ok(StateKind::ThirtyTwoBit),
        Flavor::Unified => {
            check_count(flavor, ARM_UNIFIED_THREAD_STATE_COUNT, words.len())?;
            let (inner, count) = (words[0], words[1]);
            match (inner, count as usize) {
                (ARM_THREAD_STATE32, ARM_THREAD_STATE32_COUNT) => {
                    Ok(StateKind::Unified(Width::ThirtyTwo))
                }
                (ARM_THREAD_STATE64, ARM_THREAD_STATE64_COUNT) => {
                    Ok(StateKind::Unified(Width::SixtyFour))
                }
                _ => Err(CodecError::UnifiedHeaderMismatch {
                    flavor: inner,
                    count,
                }),
            }
        }
    }
}

/// Resolve the layout for an outgoing buffer of `count` words holding a
/// state of `width`.
pub fn resolve_for_width(flavor: Flavor, count: usize, width: Width) -> Result<StateKind, CodecError> {
    let kind = match flavor {
        Flavor::ThirtyTwo => {
            check_count(flavor, ARM_THREAD_STATE32_COUNT, count)?;
            StateKind::ThirtyTwoBit
        }
        Flavor::SixtyFour => {
            check_count(flavor, ARM_THREAD_STATE64_COUNT, count)?;
            StateKind::SixtyFourBit
        }
        Flavor::Unified if count == ARM_THREAD_STATE32_COUNT => StateKind::ThirtyTwoBit,
        Flavor::Unified => {
            check_count(flavor, ARM_UNIFIED_THREAD_STATE_COUNT, count)?;
            StateKind::Unified(width)
        }
    };
    if kind.width() != width {
        return Err(CodecError::WidthMismatch);
    }
    Ok(kind)
}

fn read_u64(words: &[u32], at: usize) -> u64 {
    (words[at] as u64) | ((words[at + 1] as u64) << 32)
}

fn write_u64(words: &mut [u32], at: usize, value: u64) {
    words[at] = value as u32;
    words[at + 1] = (value >> 32) as u32;
}

fn decode32(words: &[u32]) -> RegisterState32 {
    let mut ts32 = RegisterState32::default();
    ts32.r.copy_from_slice(&words[..13]);
    ts32.sp = words[SP32_WORD];
    ts32.lr = words[LR32_WORD];
    ts32.pc = words[PC32_WORD];
    ts32.cpsr = words[CPSR32_WORD];
    ts32
}

fn decode64(words: &[u32]) -> RegisterState64 {
    let mut ts64 = RegisterState64::default();
    for (i, x) in ts64.x.iter_mut().enumerate() {
        *x = read_u64(words, X_WORDS + 2 * i);
    }
    ts64.fp = read_u64(words, FP_WORD);
    ts64.lr = read_u64(words, LR_WORD);
    ts64.sp = read_u64(words, SP_WORD);
    ts64.pc = read_u64(words, PC_WORD);
    ts64.cpsr = words[CPSR64_WORD];
    ts64.flags = StateFlags::from_bits_retain(words[FLAGS_WORD]);
    ts64
}

fn encode32(ts32: &RegisterState32, words: &mut [u32]) {
    words[..13].copy_from_slice(&ts32.r);
    words[SP32_WORD] = ts32.sp;
    words[LR32_WORD] = ts32.lr;
    words[PC32_WORD] = ts32.pc;
    words[CPSR32_WORD] = ts32.cpsr;
}

fn encode64(ts64: &RegisterState64, words: &mut [u32]) {
    for (i, x) in ts64.x.iter().enumerate() {
        write_u64(words, X_WORDS + 2 * i, *x);
    }
    write_u64(words, FP_WORD, ts64.fp);
    write_u64(words, LR_WORD, ts64.lr);
    write_u64(words, SP_WORD, ts64.sp);
    write_u64(words, PC_WORD, ts64.pc);
    words[CPSR64_WORD] = ts64.cpsr;
    words[FLAGS_WORD] = ts64.flags.bits();
}

/// Decode a buffer of a resolved layout.
pub fn decode(kind: StateKind, words: &[u32]) -> Result<ThreadState, CodecError> {
    if words.len() < kind.count() {
        return Err(CodecError::BufferTooSmall {
            needed: kind.count(),
            got: words.len(),
        });
    }
    let state = match kind {
        StateKind::ThirtyTwoBit => ThreadState::ThirtyTwo(decode32(words)),
        StateKind::SixtyFourBit => ThreadState::SixtyFour(decode64(words)),
        StateKind::Unified(Width::ThirtyTwo) => {
            ThreadState::ThirtyTwo(decode32(&words[UNIFIED_HEADER_WORDS..]))
        }
        StateKind::Unified(Width::SixtyFour) => {
            ThreadState::SixtyFour(decode64(&words[UNIFIED_HEADER_WORDS..]))
        }
    };
    Ok(state)
}

/// Encode `state` into `out` using a resolved layout.
///
/// Returns the number of words written.
pub fn encode(kind: StateKind, state: &ThreadState, out: &mut [u32]) -> Result<usize, CodecError> {
    let needed = kind.count();
    if out.len() < needed {
        return Err(CodecError::BufferTooSmall {
            needed,
            got: out.len(),
        });
    }
    if kind.width() != state.width() {
        return Err(CodecError::WidthMismatch);
    }
    let out = &mut out[..needed];
    out.fill(0);

    match (kind, state) {
        (StateKind::ThirtyTwoBit, ThreadState::ThirtyTwo(ts32)) => encode32(ts32, out),
        (StateKind::SixtyFourBit, ThreadState::SixtyFour(ts64)) => encode64(ts64, out),
        (StateKind::Unified(_), ThreadState::ThirtyTwo(ts32)) => {
            out[0] = ARM_THREAD_STATE32;
            out[1] = ARM_THREAD_STATE32_COUNT as u32;
            encode32(ts32, &mut out[UNIFIED_HEADER_WORDS..]);
        }
        (StateKind::Unified(_), ThreadState::SixtyFour(ts64)) => {
            out[0] = ARM_THREAD_STATE64;
            out[1] = ARM_THREAD_STATE64_COUNT as u32;
            encode64(ts64, &mut out[UNIFIED_HEADER_WORDS..]);
        }
        _ => return Err(CodecError::WidthMismatch),
    }
    Ok(needed)
}
