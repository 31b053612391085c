//! Zero OS Pointer Authentication Core - Thread-State Conversion
//!
//! This crate converts user thread register states between their
//! kernel-held form (raw pointers) and the form handed to user code
//! (pc, lr, sp and fp signed with pointer authentication). It is invoked
//! on syscall and exception-return paths and never blocks.
//!
//! # Design Principles
//!
//! 1. **Export never fails**: signing is an unconditional transform
//! 2. **Import fails only on policy**: an unauthenticated caller or a
//!    strictly enforced sigreturn token; everything else poisons or reports
//! 3. **Sanitize, then trust**: forged `NO_PTRAUTH`/`IB_SIGNED_LR` claims are
//!    cleared before any branch on them
//! 4. **Platform behind a trait**: all crypto, entropy and interrupt control
//!    goes through [`zos_ptrauth_hal::PtrAuthHal`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    zos-ptrauth-core                         │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │    codec      │    │    keyctx     │                   │
//! │   │ words <-> regs│    │ active? denied│                   │
//! │   └───────────────┘    └───────┬───────┘                   │
//! │                                │                            │
//! │   ┌───────────────┐    ┌───────▼───────┐    ┌────────────┐ │
//! │   │  diversifier  │───▶│  PacConverter │───▶│  anomaly   │ │
//! │   │  select()     │    │ export/import │    │  reporter  │ │
//! │   └───────────────┘    └───────┬───────┘    └────────────┘ │
//! │                                │                            │
//! │                        ┌───────▼───────┐                   │
//! │                        │     token     │                   │
//! │                        │ stash/verify  │                   │
//! │                        └───────────────┘                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ used by
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      zos-ptrauth                            │
//! │   thread_get_state / thread_set_state / signals / exceptions│
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Verification Strategy
//!
//! - **Kani proofs**: key-context truth table, flags sub-field isolation
//! - **Loom tests**: anomaly rate limiter, saved-state lock protocol
//! - **Proptest**: round trip, pass-through, poisoning, OnlyPC isolation
//!
//! # Module Organization
//!
//! - `types` - Thread, Task, register states, flags and option sets
//! - `codec` - Flavor resolution and word-buffer encoding
//! - `keyctx` - Whether authentication applies to a caller/target pair
//! - `diversifier` - Diversifier selection per mode and direction
//! - `token` - Sigreturn token computation and verification
//! - `converter` - `PacConverter` export/import
//! - `anomaly` - Rate-limited telemetry of tolerated tampering
//! - `config` - `PtrAuthPolicy`
//! - `invariants` - Flags-word invariants

#![no_std]
extern crate alloc;

pub mod anomaly;
pub mod codec;
pub mod config;
pub mod converter;
pub mod diversifier;
pub mod error;
pub mod invariants;
pub mod keyctx;
pub mod sync;
pub mod token;
pub mod types;


// Re-export all public types for convenient access
pub use anomaly::{AnomalyKind, AnomalyLog, AnomalyRecord, AnomalyReporter, NullSink, TelemetrySink};
pub use codec::{Flavor, StateKind};
pub use config::{PtrAuthPolicy, RateLimit};
pub use converter::{ConversionScope, PacConverter};
pub use diversifier::{Direction, DiversifierMode};
pub use error::{CodecError, ConfigError, ProtectionFailure};
pub use invariants::{check_flags, InvariantViolation};
pub use keyctx::{import_authority, is_authentication_active, ImportAuthority};
pub use sync::InterruptGuard;
pub use types::{
    ExportOptions, ImportOptions, RegisterState32, RegisterState64, StateFlags, Task, Thread,
    ThreadId, ThreadState, Width, USER_DIVERSIFIER_MASK,
};
