//! Per-thread execution context and the trace slot it owns.
//!
//! The slot holds the stack identity established by the innermost active
//! [`StackTraceMark`](crate::StackTraceMark) on that thread. It is written only
//! by marks targeting the thread and by code that clears it outright.

use stackmark_trace_types::{StackIdentity, ThreadId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

thread_local! {
    static CURRENT: Arc<ThreadContext> = ThreadContext::new(std::thread::current().name());
}

/// Most recently recorded stack identity of one thread.
///
/// The id word doubles as the validity flag: `0` means empty, so
/// `has_value() == false` exactly when `raw_id() == 0`.
///
/// Both words are relaxed atomics. They exist so the cross-thread mark is
/// memory safe; they do not make concurrent marks on one slot meaningful.
#[derive(Debug, Default)]
pub struct TraceSlot {
    id: AtomicU64,
    fingerprint: AtomicU64,
}

impl TraceSlot {
    pub const fn new() -> Self {
        Self {
            id: AtomicU64::new(0),
            fingerprint: AtomicU64::new(0),
        }
    }

    pub fn has_value(&self) -> bool {
        self.raw_id() != 0
    }

    pub fn current(&self) -> Option<StackIdentity> {
        StackIdentity::from_raw_parts(self.raw_id(), self.raw_fingerprint())
    }

    pub fn raw_id(&self) -> u64 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn raw_fingerprint(&self) -> u64 {
        self.fingerprint.load(Ordering::Relaxed)
    }

    pub fn set(&self, identity: StackIdentity) {
        let (id, fingerprint) = identity.into_raw_parts();
        self.fingerprint.store(fingerprint, Ordering::Relaxed);
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.id.store(0, Ordering::Relaxed);
        self.fingerprint.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct ThreadContext {
    id: ThreadId,
    name: Option<String>,
    trace_slot: TraceSlot,
}

impl ThreadContext {
    /// Creates a context with an empty trace slot.
    ///
    /// Contexts made here are not bound to any OS thread; whoever drives them
    /// is responsible for not running two marks on the same slot at once.
    pub fn new(name: Option<&str>) -> Arc<Self> {
        let id = ThreadId::next_process_local()
            .expect("invariant violated: thread id counter exhausted");
        Arc::new(Self {
            id,
            name: name.map(str::to_owned),
            trace_slot: TraceSlot::new(),
        })
    }

    /// The calling thread's context, created on first use.
    ///
    /// Panics once the thread's locals have been torn down; code that may run
    /// from a thread-local destructor should use [`ThreadContext::try_current`].
    pub fn current() -> Arc<Self> {
        CURRENT.with(Arc::clone)
    }

    /// Like [`ThreadContext::current`], but `None` once the thread's locals
    /// have been torn down.
    pub fn try_current() -> Option<Arc<Self>> {
        CURRENT.try_with(Arc::clone).ok()
    }

    pub fn with_current<R>(f: impl FnOnce(&Arc<Self>) -> R) -> R {
        CURRENT.with(f)
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn trace_slot(&self) -> &TraceSlot {
        &self.trace_slot
    }

    /// The identity an event emitted right now on this thread should carry.
    pub fn cached_stack_trace(&self) -> Option<StackIdentity> {
        self.trace_slot.current()
    }

    pub fn has_cached_stack_trace(&self) -> bool {
        self.trace_slot.has_value()
    }

    pub fn clear_cached_stack_trace(&self) {
        self.trace_slot.clear();
    }
}
