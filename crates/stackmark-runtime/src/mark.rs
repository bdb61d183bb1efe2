//! Scoped stack-trace marks.
//!
//! A [`StackTraceMark`] installs a stack identity in a thread's trace slot for
//! as long as it lives, and on drop puts back whatever was there before. Marks
//! nest: the slot always holds the identity of the innermost live mark on that
//! thread, or nothing when no mark is live.
//!
//! Marks must be dropped in the reverse order they were created. Dropping an
//! outer mark while an inner one is still alive leaves the slot in an
//! unspecified (but memory safe) state.

use stackmark_trace_types::{EventKindId, StackIdentity, WalkMode};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::trace;

use crate::recorder::recorder;
use crate::repository::StackTraceStore;
use crate::thread::ThreadContext;

#[must_use = "the mark restores the previous stack identity when dropped"]
#[derive(Debug)]
pub struct StackTraceMark {
    thread: Option<Arc<ThreadContext>>,
    previous: Option<StackIdentity>,
    installed: Option<StackIdentity>,
    // Dropped on the thread that created it, whatever thread it targets.
    _not_send: PhantomData<*const ()>,
}

#[allow(clippy::new_without_default)]
impl StackTraceMark {
    /// Marks the calling thread with the process-wide recorder.
    pub fn new() -> Self {
        recorder().mark()
    }

    /// Marks `thread` with the process-wide recorder.
    ///
    /// The caller must guarantee `thread` is not running marks of its own for
    /// the lifetime of the returned guard (it is parked, suspended, or handed
    /// over).
    pub fn for_thread(thread: &Arc<ThreadContext>) -> Self {
        recorder().mark_thread(thread)
    }

    /// Marks the calling thread if `kind` has stack traces enabled. Otherwise
    /// returns an inactive mark without touching any slot.
    pub fn for_event(kind: EventKindId) -> Self {
        recorder().mark_event(kind)
    }

    /// Marks `thread` if `kind` has stack traces enabled. Same caller
    /// obligation as [`StackTraceMark::for_thread`].
    pub fn for_event_on_thread(kind: EventKindId, thread: &Arc<ThreadContext>) -> Self {
        recorder().mark_event_on_thread(kind, thread)
    }

    pub(crate) fn inactive() -> Self {
        Self {
            thread: None,
            previous: None,
            installed: None,
            _not_send: PhantomData,
        }
    }

    pub(crate) fn activate<S>(thread: Arc<ThreadContext>, store: &S, mode: WalkMode) -> Self
    where
        S: StackTraceStore + ?Sized,
    {
        let slot = thread.trace_slot();
        let previous = slot.current();
        let identity = store.record(&thread, 0, mode);
        slot.set(identity);

        trace!(
            thread = %thread.id(),
            id = %identity.id,
            nested = previous.is_some(),
            ?mode,
            "stack trace mark entered"
        );

        Self {
            thread: Some(thread),
            previous,
            installed: Some(identity),
            _not_send: PhantomData,
        }
    }

    pub fn is_active(&self) -> bool {
        self.thread.is_some()
    }

    /// The identity this mark installed. `None` for inactive marks.
    pub fn identity(&self) -> Option<StackIdentity> {
        self.installed
    }

    /// The identity this mark displaced and will restore.
    pub fn previous(&self) -> Option<StackIdentity> {
        self.previous
    }

    pub fn thread(&self) -> Option<&Arc<ThreadContext>> {
        self.thread.as_ref()
    }
}

impl Drop for StackTraceMark {
    fn drop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let slot = thread.trace_slot();
        match self.previous {
            Some(previous) => slot.set(previous),
            None => slot.clear(),
        }

        trace!(
            thread = %thread.id(),
            restored = self.previous.is_some(),
            "stack trace mark exited"
        );
    }
}
