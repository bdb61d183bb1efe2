#![allow(dead_code)]

use stackmark_runtime::{
    StackFingerprint, StackIdentity, StackTraceId, StackTraceStore, ThreadContext, ThreadId,
    TraceSlot, WalkMode,
};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out ids 1, 2, 3, ... and remembers who asked.
#[derive(Default)]
pub struct CountingStore {
    next: AtomicU64,
    calls: Mutex<Vec<(ThreadId, WalkMode)>>,
}

impl CountingStore {
    pub fn calls(&self) -> Vec<(ThreadId, WalkMode)> {
        self.calls.lock().expect("calls lock poisoned").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock poisoned").len()
    }
}

impl StackTraceStore for CountingStore {
    fn record(&self, thread: &ThreadContext, _hint: u32, mode: WalkMode) -> StackIdentity {
        self.calls
            .lock()
            .expect("calls lock poisoned")
            .push((thread.id(), mode));
        let raw = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        identity(raw)
    }
}

pub fn identity(raw: u64) -> StackIdentity {
    StackIdentity::new(
        StackTraceId::new(raw).expect("test ids are non-zero"),
        StackFingerprint::new(raw.wrapping_mul(0x9e37_79b9_7f4a_7c15)),
    )
}

pub fn assert_sentinel_invariant(slot: &TraceSlot) {
    assert_eq!(
        slot.has_value(),
        slot.raw_id() != 0,
        "has_value must be false exactly when the id is 0"
    );
    if !slot.has_value() {
        assert_eq!(slot.current(), None);
    }
}
