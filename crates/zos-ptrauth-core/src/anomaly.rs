//! Anomaly reporting
//!
//! Suspicious but tolerated events (a user rewriting a kernel-signed
//! pointer, a sigreturn token that does not match) are turned into
//! [`AnomalyRecord`]s and handed to a [`TelemetrySink`].
//!
//! Reporting runs with interrupts masked and a thread-state lock held, so
//! nothing on this path blocks:
//! - the rate limiter is a single atomic word updated by compare-exchange
//! - [`AnomalyLog`] only ever `try_lock`s its buffer and counts what it drops

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};
use spin::Mutex;

use crate::config::RateLimit;
use crate::types::ThreadId;

/// What was observed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnomalyKind {
    /// User code changed a kernel-signed pc and/or lr
    UserPointerMismatch { pc: bool, lr: bool },
    /// A stored sigreturn token did not match
    SigreturnTokenMismatch { pc: bool, lr: bool },
}

/// A single telemetry record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    /// Unique record ID (monotonic per reporter)
    pub id: u64,
    pub kind: AnomalyKind,
    /// Name of the process whose thread state was converted
    pub process_name: String,
    pub thread: ThreadId,
    /// Timestamp (nanos since boot)
    pub timestamp: u64,
}

/// Destination for anomaly records.
///
/// `emit` is called with interrupts masked and must not block.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, record: AnomalyRecord);
}

/// Discards every record.
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _record: AnomalyRecord) {}
}

/// Rate-limited front end to a [`TelemetrySink`].
pub struct AnomalyReporter<S: TelemetrySink> {
    sink: S,
    limit: RateLimit,
    /// Window index in the high half, reports admitted in it in the low half
    window: AtomicU64,
    suppressed: AtomicU64,
    next_id: AtomicU64,
}

impl<S: TelemetrySink> AnomalyReporter<S> {
    pub fn new(sink: S, limit: RateLimit) -> Self {
        Self {
            sink,
            limit,
            window: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
        }
    }

    /// Report an anomaly at time `now`.
    ///
    /// Returns false if the record was suppressed by the rate limit.
    pub fn report(&self, now: u64, kind: AnomalyKind, thread: ThreadId, process_name: &str) -> bool {
        if !self.admit(now) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            log::debug!("ptrauth anomaly suppressed: {:?} tid={}", kind, thread.0);
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "ptrauth anomaly #{}: {:?} in {} tid={}",
            id,
            kind,
            process_name,
            thread.0
        );
        self.sink.emit(AnomalyRecord {
            id,
            kind,
            process_name: String::from(process_name),
            thread,
            timestamp: now,
        });
        true
    }

    /// Count one report against the window containing `now`.
    ///
    /// Window and count share one word so a window change and the count
    /// reset happen in the same update.
    fn admit(&self, now: u64) -> bool {
        let window = (now / self.limit.window_ns.max(1)) as u32;
        let mut current = self.window.load(Ordering::Acquire);
        loop {
            let in_window = if (current >> 32) as u32 == window {
                current as u32
            } else {
                0
            };
            if u64::from(in_window) >= self.limit.max_reports {
                return false;
            }
            let next = (u64::from(window) << 32) | u64::from(in_window.saturating_add(1));
            match self
                .window
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Number of reports dropped by the rate limit
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

/// Default capacity of an [`AnomalyLog`]
pub const DEFAULT_ANOMALY_LOG_CAPACITY: usize = 256;

/// Bounded in-memory anomaly log.
///
/// Oldest records are dropped once the capacity is reached.
pub struct AnomalyLog {
    records: Mutex<VecDeque<AnomalyRecord>>,
    capacity: usize,
    /// Records lost to lock contention
    contended: AtomicU64,
}

impl AnomalyLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ANOMALY_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            contended: AtomicU64::new(0),
        }
    }

    /// Snapshot of all retained records, oldest first.
    pub fn records(&self) -> Vec<AnomalyRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Records with `start_id <= id < end_id`.
    pub fn get_range(&self, start_id: u64, end_id: u64) -> Vec<AnomalyRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.id >= start_id && r.id < end_id)
            .cloned()
            .collect()
    }

    /// The most recent `count` records, newest first.
    pub fn get_recent(&self, count: usize) -> Vec<AnomalyRecord> {
        self.records.lock().iter().rev().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn contended_count(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }
}

impl Default for AnomalyLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink for AnomalyLog {
    fn emit(&self, record: AnomalyRecord) {
        let Some(mut records) = self.records.try_lock() else {
            self.contended.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if self.capacity == 0 {
            return;
        }
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PC_ONLY: AnomalyKind = AnomalyKind::UserPointerMismatch { pc: true, lr: false };

    fn reporter(max_reports: u64) -> AnomalyReporter<AnomalyLog> {
        AnomalyReporter::new(
            AnomalyLog::with_capacity(4),
            RateLimit {
                max_reports,
                window_ns: 1_000,
            },
        )
    }

    #[test]
    fn test_report_reaches_sink() {
        let r = reporter(8);
        assert!(r.report(10, PC_ONLY, ThreadId(3), "sshd"));

        let records = r.sink().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, PC_ONLY);
        assert_eq!(records[0].process_name, "sshd");
        assert_eq!(records[0].thread, ThreadId(3));
        assert_eq!(records[0].timestamp, 10);
    }

    #[test]
    fn test_rate_limit_suppresses_then_resets() {
        let r = reporter(2);
        assert!(r.report(0, PC_ONLY, ThreadId(1), "a"));
        assert!(r.report(1, PC_ONLY, ThreadId(1), "a"));
        assert!(!r.report(2, PC_ONLY, ThreadId(1), "a"));
        assert_eq!(r.suppressed_count(), 1);

        // Next window
        assert!(r.report(1_500, PC_ONLY, ThreadId(1), "a"));
        assert_eq!(r.sink().len(), 3);
    }

    #[test]
    fn test_new_window_budget_is_not_shared_with_old() {
        let r = reporter(1);
        assert!(r.report(100, PC_ONLY, ThreadId(1), "a"));
        assert!(!r.report(900, PC_ONLY, ThreadId(1), "a"));

        assert!(r.report(2_100, PC_ONLY, ThreadId(1), "a"));
        assert!(!r.report(2_200, PC_ONLY, ThreadId(1), "a"));
        assert_eq!(r.suppressed_count(), 2);
    }

    #[test]
    fn test_ids_are_monotonic() {
        let r = reporter(8);
        for t in 0..3 {
            r.report(t, PC_ONLY, ThreadId(1), "a");
        }
        let ids: Vec<u64> = r.sink().records().iter().map(|rec| rec.id).collect();
        assert_eq!(ids, alloc::vec![0, 1, 2]);
    }

    #[test]
    fn test_log_is_bounded() {
        let r = reporter(100);
        for t in 0..6 {
            r.report(t, PC_ONLY, ThreadId(1), "a");
        }
        let log = r.sink();
        assert_eq!(log.len(), 4);
        assert_eq!(log.get_recent(1)[0].id, 5);
        assert_eq!(log.get_range(0, 3).len(), 1);
    }

    #[test]
    fn test_emit_never_blocks_on_held_lock() {
        let log = AnomalyLog::new();
        let guard = log.records.lock();
        log.emit(AnomalyRecord {
            id: 0,
            kind: PC_ONLY,
            process_name: String::from("a"),
            thread: ThreadId(1),
            timestamp: 0,
        });
        drop(guard);

        assert!(log.is_empty());
        assert_eq!(log.contended_count(), 1);
    }

    #[test]
    fn test_record_serializes() {
        let record = AnomalyRecord {
            id: 7,
            kind: AnomalyKind::SigreturnTokenMismatch { pc: false, lr: true },
            process_name: String::from("bash"),
            thread: ThreadId(42),
            timestamp: 99,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("SigreturnTokenMismatch"));
        let back: AnomalyRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
