//! Thread-state syscall integration tests

use std::sync::Arc;

use zos_ptrauth::{
    kern_return, AnomalyKind, AnomalyLog, PtrAuthPolicy, SignalFrame, Task, Thread, ThreadHandle,
    ThreadId, ThreadState, ThreadStateError, ThreadStateService, ARM_THREAD_STATE,
    ARM_THREAD_STATE32, ARM_THREAD_STATE64, KERN_INVALID_ARGUMENT, KERN_PROTECTION_FAILURE,
};
use zos_ptrauth_core::codec::{self, StateKind};
use zos_ptrauth_core::converter::{code_discriminator, PC_DISCRIMINATOR, SP_DISCRIMINATOR};
use zos_ptrauth_core::diversifier::task_persistent;
use zos_ptrauth_core::{CodecError, ProtectionFailure, RegisterState32, RegisterState64, StateFlags};
use zos_ptrauth_hal::{KeyClass, PtrAuthHal};
use zos_ptrauth_hal_mock::{is_poisoned, MockHal};

// ============================================================================
// Fixtures
// ============================================================================

const PC: u64 = 0x1_0000_4100;
const LR: u64 = 0x1_0000_4200;
const SP: u64 = 0x16F0_8000;
const FP: u64 = 0x16F0_8040;
const JOP_PID: u64 = 0x51;

type Service = ThreadStateService<MockHal, AnomalyLog>;

fn service() -> Service {
    service_with(PtrAuthPolicy::default())
}

fn service_with(policy: PtrAuthPolicy) -> Service {
    ThreadStateService::new(MockHal::new(), AnomalyLog::new(), policy)
}

fn task() -> Arc<Task> {
    Arc::new(Task::new("WebContent", 0x0000_0000_A700_0000))
}

fn running_state() -> ThreadState {
    let mut ts = RegisterState64 {
        pc: PC,
        lr: LR,
        sp: SP,
        fp: FP,
        cpsr: 0x6000_0000,
        ..Default::default()
    };
    ts.x[0] = 7;
    ThreadState::SixtyFour(ts)
}

fn thread(tid: u64) -> Thread {
    Thread::new(ThreadId(tid), JOP_PID, 0x0BAD_CAFE_0000_0000 | tid)
}

fn running_thread(tid: u64) -> ThreadHandle {
    ThreadHandle::with_state(thread(tid), task(), running_state()).unwrap()
}

fn get64(svc: &Service, caller: &Thread, target: &ThreadHandle) -> RegisterState64 {
    let mut words = [0u32; 68];
    assert_eq!(
        svc.thread_get_state(caller, target, ARM_THREAD_STATE64, &mut words),
        Ok(68)
    );
    match codec::decode(StateKind::SixtyFourBit, &words).unwrap() {
        ThreadState::SixtyFour(ts) => ts,
        other => panic!("unexpected width: {:?}", other),
    }
}

fn words64(ts: RegisterState64) -> [u32; 68] {
    let mut words = [0u32; 68];
    codec::encode(StateKind::SixtyFourBit, &ThreadState::SixtyFour(ts), &mut words).unwrap();
    words
}

fn saved64(target: &ThreadHandle) -> RegisterState64 {
    *target.saved_state().as_64().unwrap()
}

// ============================================================================
// thread_get_state / thread_set_state
// ============================================================================

#[test]
fn test_get_state_exports_signed_pointers() {
    let svc = service();
    let target = running_thread(1);
    let ts = get64(&svc, target.thread(), &target);

    assert_ne!(ts.pc, PC);
    assert_eq!(svc.hal().strip_user_ptr(ts.pc), PC);
    assert_eq!(svc.hal().strip_user_ptr(ts.sp), SP);
    assert_eq!(ts.x[0], 7);
    assert!(ts.flags.contains(StateFlags::KERNEL_SIGNED_PC | StateFlags::KERNEL_SIGNED_LR));

    // Kernel copy stays raw
    assert_eq!(saved64(&target).pc, PC);
    assert!(!target.is_locked());
}

#[test]
fn test_get_then_set_restores_identical_state() {
    let svc = service();
    let debugger = thread(50);
    let target = running_thread(1);
    let before = target.saved_state();

    let ts = get64(&svc, &debugger, &target);
    svc.thread_set_state(&debugger, &target, ARM_THREAD_STATE64, &words64(ts))
        .unwrap();

    assert_eq!(target.saved_state(), before);
    assert_eq!(svc.reporter().sink().len(), 0);
}

#[test]
fn test_set_state_with_modified_registers() {
    let svc = service();
    let debugger = thread(50);
    let target = running_thread(1);

    let mut ts = get64(&svc, &debugger, &target);
    ts.x[0] = 0x1234;
    ts.cpsr = 0;
    svc.thread_set_state(&debugger, &target, ARM_THREAD_STATE64, &words64(ts))
        .unwrap();

    let saved = saved64(&target);
    assert_eq!(saved.x[0], 0x1234);
    assert_eq!(saved.pc, PC);
    assert_eq!(saved.flags, StateFlags::empty());
}

#[test]
fn test_set_state_with_forged_pc_poisons() {
    let svc = service();
    let target = running_thread(1);

    let mut ts = get64(&svc, target.thread(), &target);
    ts.pc = 0x1_0000_6666;
    svc.thread_set_state(target.thread(), &target, ARM_THREAD_STATE64, &words64(ts))
        .unwrap();

    assert!(is_poisoned(saved64(&target).pc));
}

#[test]
fn test_unified_flavor_round_trip() {
    let svc = service();
    let target = running_thread(1);

    let mut words = [0u32; 70];
    let written = svc
        .thread_get_state(target.thread(), &target, ARM_THREAD_STATE, &mut words)
        .unwrap();
    assert_eq!(written, 70);
    assert_eq!(words[0], ARM_THREAD_STATE64);
    assert_eq!(words[1], 68);

    svc.thread_set_state(target.thread(), &target, ARM_THREAD_STATE, &words)
        .unwrap();
    assert_eq!(saved64(&target).pc, PC);
}

#[test]
fn test_bad_arguments_are_rejected_before_conversion() {
    let svc = service();
    let target = running_thread(1);
    let before = target.saved_state();

    // Legacy unified count cannot describe a 64-bit thread
    let mut short = [0u32; 17];
    let err = svc
        .thread_get_state(target.thread(), &target, ARM_THREAD_STATE, &mut short)
        .unwrap_err();
    assert_eq!(err, ThreadStateError::InvalidArgument(CodecError::WidthMismatch));
    assert_eq!(err.kern_return(), KERN_INVALID_ARGUMENT);

    let result = svc.thread_set_state(target.thread(), &target, ARM_THREAD_STATE64, &[0u32; 60]);
    assert_eq!(kern_return(&result), KERN_INVALID_ARGUMENT);

    let result = svc.thread_set_state(target.thread(), &target, 42, &[0u32; 68]);
    assert_eq!(
        result,
        Err(ThreadStateError::InvalidArgument(CodecError::UnknownFlavor(42)))
    );

    assert_eq!(svc.hal().sign_count(), 0);
    assert_eq!(svc.hal().auth_count(), 0);
    assert_eq!(target.saved_state(), before);
    assert!(!target.is_locked());
}

#[test]
fn test_unauthenticated_caller_cannot_set_state() {
    let svc = service();
    let target = running_thread(1);
    let legacy = Thread::new(ThreadId(60), 0x99, 1).with_32bit_addr();
    let before = target.saved_state();

    let mut ts = RegisterState64 {
        pc: 0x1_0000_9999,
        ..Default::default()
    };
    ts.flags = StateFlags::NO_PTRAUTH;
    let result = svc.thread_set_state(&legacy, &target, ARM_THREAD_STATE64, &words64(ts));

    assert_eq!(
        result,
        Err(ThreadStateError::Protection(ProtectionFailure::UnauthenticatedCaller))
    );
    assert_eq!(kern_return(&result), KERN_PROTECTION_FAILURE);
    assert_eq!(target.saved_state(), before);
    assert!(!target.is_locked());
    assert!(svc.hal().interrupts_enabled());
}

#[test]
fn test_thirty_two_bit_thread_is_not_signed() {
    let svc = service();
    let mut regs = RegisterState32 {
        pc: 0x8000,
        lr: 0x8004,
        sp: 0x7FF0,
        ..Default::default()
    };
    regs.r[0] = 3;
    let narrow = Thread::new(ThreadId(70), 1, 2).with_32bit_addr();
    let target = ThreadHandle::with_state(narrow, task(), ThreadState::ThirtyTwo(regs)).unwrap();

    // Legacy unified count gives the bare 32-bit layout
    let mut words = [0u32; 17];
    svc.thread_get_state(target.thread(), &target, ARM_THREAD_STATE, &mut words)
        .unwrap();
    assert_eq!(words[15], 0x8000);

    words[0] = 9;
    svc.thread_set_state(target.thread(), &target, ARM_THREAD_STATE32, &words)
        .unwrap();
    assert_eq!(target.saved_state().pc(), 0x8000);
    assert_eq!(svc.hal().sign_count(), 0);
}

#[test]
fn test_platform_disable_get_then_set_keeps_raw_pointers() {
    let svc = service_with(PtrAuthPolicy {
        user_jop_disabled: true,
        ..PtrAuthPolicy::default()
    });
    let target = running_thread(1);
    let before = target.saved_state();

    let ts = get64(&svc, target.thread(), &target);
    assert_eq!((ts.pc, ts.sp), (PC, SP));
    assert_eq!(ts.flags, StateFlags::NO_PTRAUTH);

    svc.thread_set_state(target.thread(), &target, ARM_THREAD_STATE64, &words64(ts))
        .unwrap();
    assert_eq!(target.saved_state(), before);
}

// ============================================================================
// pc-only and initial state
// ============================================================================

#[test]
fn test_set_state_pc_only_moves_only_pc() {
    let svc = service();
    let target = running_thread(1);

    let mut ts = get64(&svc, target.thread(), &target);
    ts.pc = svc
        .hal()
        .sign_user_ptr(0x1_0000_8000, KeyClass::Code, PC_DISCRIMINATOR as u64, JOP_PID);
    ts.sp = 0xDEAD_0000;
    ts.x[0] = 0xFFFF;
    svc.thread_set_state_pc_only(target.thread(), &target, ARM_THREAD_STATE64, &words64(ts))
        .unwrap();

    let saved = saved64(&target);
    assert_eq!(saved.pc, 0x1_0000_8000);
    assert_eq!(saved.sp, SP);
    assert_eq!(saved.lr, LR);
    assert_eq!(saved.x[0], 7);
}

#[test]
fn test_set_state_pc_only_ignores_lr_signer_claims() {
    let svc = service();
    let target = running_thread(1);

    let mut ts = get64(&svc, target.thread(), &target);
    ts.flags.insert(StateFlags::IB_SIGNED_LR);
    ts.flags.remove(StateFlags::KERNEL_SIGNED_LR);
    svc.thread_set_state_pc_only(target.thread(), &target, ARM_THREAD_STATE64, &words64(ts))
        .unwrap();

    let saved = saved64(&target);
    assert_eq!(saved.lr, LR);
    assert_eq!(saved.pc, PC);
}

#[test]
fn test_initial_state_uses_task_diversifier() {
    let svc = service();
    let owner = task();
    let fresh = ThreadHandle::new(thread(2), owner.clone());
    let div = task_persistent(&owner);

    let ts = RegisterState64 {
        pc: svc.hal().sign_user_ptr(
            PC,
            KeyClass::Code,
            code_discriminator(PC_DISCRIMINATOR, div),
            JOP_PID,
        ),
        sp: svc
            .hal()
            .sign_user_ptr(SP, KeyClass::Data, SP_DISCRIMINATOR as u64, JOP_PID),
        flags: StateFlags::KERNEL_SIGNED_PC,
        ..Default::default()
    };
    let creator = thread(1);
    svc.thread_set_initial_state(&creator, &fresh, ARM_THREAD_STATE64, &words64(ts))
        .unwrap();

    let saved = saved64(&fresh);
    assert_eq!(saved.pc, PC);
    assert_eq!(saved.sp, SP);
    assert_eq!(saved.lr, 0);
}

#[test]
fn test_initial_state_without_task_diversifier_poisons() {
    let svc = service();
    let fresh = ThreadHandle::new(thread(2), task());

    let ts = RegisterState64 {
        pc: svc
            .hal()
            .sign_user_ptr(PC, KeyClass::Code, PC_DISCRIMINATOR as u64, JOP_PID),
        flags: StateFlags::KERNEL_SIGNED_PC,
        ..Default::default()
    };
    svc.thread_set_initial_state(&thread(1), &fresh, ARM_THREAD_STATE64, &words64(ts))
        .unwrap();
    assert!(is_poisoned(saved64(&fresh).pc));
}

// ============================================================================
// Exceptions
// ============================================================================

fn rewrite_pc(words: &mut [u32], pc: u64) {
    let kind = codec::resolve(codec::Flavor::SixtyFour, words).unwrap();
    let mut state = codec::decode(kind, words).unwrap();
    if let Some(ts) = state.as_64_mut() {
        ts.pc = pc;
        ts.x[1] = 0x5555;
    }
    codec::encode(kind, &state, words).unwrap();
}

#[test]
fn test_exception_reply_cannot_redirect_pc() {
    let svc = service();
    let target = running_thread(1);

    svc.deliver_exception(&target, ARM_THREAD_STATE64, 68, |words| {
        rewrite_pc(words, 0x9999)
    })
    .unwrap();

    let saved = saved64(&target);
    assert_eq!(saved.pc, PC);
    assert_eq!(saved.x[1], 0x5555);

    let records = svc.reporter().sink().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, AnomalyKind::UserPointerMismatch { pc: true, lr: false });
    assert_eq!(records[0].thread, ThreadId(1));
    assert_eq!(records[0].process_name, "WebContent");
}

#[test]
fn test_exception_reply_unpinned_poisons_forged_pc() {
    let svc = service_with(PtrAuthPolicy {
        pin_exception_reply_pointers: false,
        ..PtrAuthPolicy::default()
    });
    let target = running_thread(1);

    svc.deliver_exception(&target, ARM_THREAD_STATE64, 68, |words| {
        rewrite_pc(words, 0x9999)
    })
    .unwrap();

    assert!(is_poisoned(saved64(&target).pc));
    assert_eq!(svc.reporter().sink().len(), 1);
}

#[test]
fn test_exception_untouched_reply_is_silent() {
    let svc = service();
    let target = running_thread(1);
    let before = target.saved_state();

    svc.deliver_exception(&target, ARM_THREAD_STATE64, 68, |words| {
        assert_eq!(words.len(), 68);
    })
    .unwrap();

    assert_eq!(target.saved_state(), before);
    assert!(svc.reporter().sink().is_empty());
}

#[test]
fn test_exception_handler_can_query_target() {
    let svc = service();
    let target = running_thread(1);

    svc.deliver_exception(&target, ARM_THREAD_STATE64, 68, |_| {
        let mut words = [0u32; 68];
        assert!(svc
            .thread_get_state(target.thread(), &target, ARM_THREAD_STATE64, &mut words)
            .is_ok());
    })
    .unwrap();
}

#[test]
fn test_exception_diversifier_does_not_expose_secret() {
    let svc = service();
    // Every fixture secret has 0x0B as its top byte
    let exposed = (1..=16u64)
        .filter(|tid| {
            let target = running_thread(*tid);
            let mut div = 0;
            svc.deliver_exception(&target, ARM_THREAD_STATE64, 68, |words| {
                if let Ok(ThreadState::SixtyFour(ts)) = codec::decode(StateKind::SixtyFourBit, words) {
                    div = ts.flags.user_diversifier();
                }
            })
            .unwrap();
            div == 0x0B00_0000
        })
        .count();
    assert!(exposed <= 2, "{} of 16 threads exported their secret's top byte", exposed);
}

#[test]
fn test_exception_reply_overrides_concurrent_set_state() {
    let svc = service();
    let target = running_thread(1);
    let debugger = thread(50);

    svc.deliver_exception(&target, ARM_THREAD_STATE64, 68, |_| {
        let mut ts = get64(&svc, &debugger, &target);
        ts.x[0] = 0xAAAA;
        svc.thread_set_state(&debugger, &target, ARM_THREAD_STATE64, &words64(ts))
            .unwrap();
        assert_eq!(saved64(&target).x[0], 0xAAAA);
    })
    .unwrap();

    // The reply is the state delivered to the handler
    assert_eq!(saved64(&target).x[0], 7);
    assert_eq!(saved64(&target).pc, PC);
}

// ============================================================================
// Signals
// ============================================================================

const HANDLER: u64 = 0x1_0000_A000;
const TRAMPOLINE: u64 = 0x1_0000_B000;

#[test]
fn test_signal_then_sigreturn_restores_state() {
    let svc = service();
    let target = running_thread(1);
    let before = target.saved_state();

    let frame = svc.send_signal(&target, HANDLER, TRAMPOLINE).unwrap();
    let during = saved64(&target);
    assert_eq!((during.pc, during.lr), (HANDLER, TRAMPOLINE));

    let frame_state = frame.state().unwrap();
    let signed = frame_state.as_64().unwrap();
    assert_ne!(signed.pc, PC);
    assert_ne!(signed.flags.user_diversifier(), 0);

    svc.sigreturn(&target, &frame).unwrap();
    assert_eq!(target.saved_state(), before);
    assert!(svc.reporter().sink().is_empty());
}

#[test]
fn test_sigreturn_with_forged_token_is_rejected() {
    let svc = service();
    let target = running_thread(1);

    let mut frame = svc.send_signal(&target, HANDLER, TRAMPOLINE).unwrap();
    let mut state = frame.state().unwrap();
    if let Some(ts) = state.as_64_mut() {
        ts.flags.set_pc_token(ts.flags.pc_token() ^ 0x4);
    }
    frame.set_state(&state).unwrap();

    let result = svc.sigreturn(&target, &frame);
    assert_eq!(
        result,
        Err(ThreadStateError::Protection(ProtectionFailure::SigreturnTokenMismatch))
    );
    // Still running the handler
    assert_eq!(saved64(&target).pc, HANDLER);
    assert_eq!(svc.reporter().sink().len(), 1);
    assert!(!target.is_locked());
}

#[test]
fn test_sigreturn_token_mismatch_tolerated_when_not_enforced() {
    let svc = service_with(PtrAuthPolicy {
        enforce_sigreturn_token: false,
        ..PtrAuthPolicy::default()
    });
    let target = running_thread(1);

    let mut frame = svc.send_signal(&target, HANDLER, TRAMPOLINE).unwrap();
    let mut state = frame.state().unwrap();
    if let Some(ts) = state.as_64_mut() {
        ts.flags.set_lr_token(ts.flags.lr_token() ^ 0x1);
    }
    frame.set_state(&state).unwrap();

    svc.sigreturn(&target, &frame).unwrap();
    assert_eq!(saved64(&target).pc, PC);
    assert_eq!(
        svc.reporter().sink().records()[0].kind,
        AnomalyKind::SigreturnTokenMismatch { pc: false, lr: true }
    );
}

#[test]
fn test_sigreturn_rejects_corrupt_frame_layout() {
    let svc = service();
    let target = running_thread(1);

    let mut frame = svc.send_signal(&target, HANDLER, TRAMPOLINE).unwrap();
    frame.words_mut()[1] = 12;

    let result = svc.sigreturn(&target, &frame);
    assert_eq!(kern_return(&result), KERN_INVALID_ARGUMENT);
    assert_eq!(saved64(&target).pc, HANDLER);
}

#[test]
fn test_signal_frame_serializes() {
    let svc = service();
    let target = running_thread(1);
    let frame = svc.send_signal(&target, HANDLER, TRAMPOLINE).unwrap();

    let json = serde_json::to_string(&frame).unwrap();
    let back: SignalFrame = serde_json::from_str(&json).unwrap();
    assert_eq!(back, frame);

    svc.sigreturn(&target, &back).unwrap();
    assert_eq!(saved64(&target).pc, PC);
}

#[test]
fn test_anomaly_reports_are_rate_limited() {
    let mut policy = PtrAuthPolicy::default();
    policy.anomaly_rate_limit.max_reports = 2;
    let svc = service_with(policy);
    let target = running_thread(1);

    for _ in 0..5 {
        svc.deliver_exception(&target, ARM_THREAD_STATE64, 68, |words| {
            rewrite_pc(words, 0x9999)
        })
        .unwrap();
    }

    assert_eq!(svc.reporter().sink().len(), 2);
    assert_eq!(svc.reporter().suppressed_count(), 3);
    assert_eq!(saved64(&target).pc, PC);
}
