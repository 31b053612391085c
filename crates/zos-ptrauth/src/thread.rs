//! Per-thread handle holding the kernel copy of a thread's registers

use alloc::sync::Arc;
use spin::{Mutex, MutexGuard};
use zos_ptrauth_core::{CodecError, Task, Thread, ThreadState};

/// A thread together with its saved user state.
///
/// The saved state always holds raw (unsigned) pointers and an empty flags
/// word. Every read-modify-write of it happens under its lock, since the
/// thread can be dispatched and have its state read by a context switch at
/// any time.
pub struct ThreadHandle {
    thread: Thread,
    task: Arc<Task>,
    saved: Mutex<ThreadState>,
}

impl ThreadHandle {
    /// A thread with a zeroed saved state of its own width.
    pub fn new(thread: Thread, task: Arc<Task>) -> Self {
        let saved = ThreadState::zeroed(thread.width());
        Self {
            thread,
            task,
            saved: Mutex::new(saved),
        }
    }

    /// A thread starting from `state`, which must match its width.
    pub fn with_state(thread: Thread, task: Arc<Task>, mut state: ThreadState) -> Result<Self, CodecError> {
        if state.width() != thread.width() {
            return Err(CodecError::WidthMismatch);
        }
        state.clear_flags();
        Ok(Self {
            thread,
            task,
            saved: Mutex::new(state),
        })
    }

    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Copy of the kernel-held state.
    pub fn saved_state(&self) -> ThreadState {
        *self.saved.lock()
    }

    /// Whether the state lock is currently held
    pub fn is_locked(&self) -> bool {
        self.saved.is_locked()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ThreadState> {
        self.saved.lock()
    }
}
