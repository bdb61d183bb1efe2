use stackmark_trace_types::{EventKindId, StackIdentity, WalkMode};
use std::sync::{Arc, OnceLock};

use crate::config::RecorderConfig;
use crate::mark::StackTraceMark;
use crate::repository::{StackTraceRepository, StackTraceStore};
use crate::settings::{EventCapturePolicy, EventSettings};
use crate::thread::ThreadContext;

static RECORDER: OnceLock<Recorder> = OnceLock::new();

/// The process-wide recorder, configured from the environment on first use.
pub fn recorder() -> &'static Recorder {
    RECORDER.get_or_init(|| Recorder::from_config(&RecorderConfig::from_env()))
}

enum Target<'a> {
    Current,
    Thread(&'a Arc<ThreadContext>),
}

enum Gate {
    Always,
    Event(EventKindId),
}

/// Pairs a stack-trace store with the policy deciding which events use it.
#[derive(Debug, Default)]
pub struct Recorder<S = StackTraceRepository, P = EventSettings> {
    store: S,
    policy: P,
}

impl Recorder {
    pub fn from_config(config: &RecorderConfig) -> Self {
        Self::new(
            StackTraceRepository::from_config(config),
            EventSettings::from_config(config),
        )
    }
}

impl<S: StackTraceStore, P: EventCapturePolicy> Recorder<S, P> {
    pub fn new(store: S, policy: P) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// Marks the calling thread's stack unconditionally.
    pub fn mark(&self) -> StackTraceMark {
        self.mark_with(Target::Current, Gate::Always)
    }

    /// Marks `thread`'s slot unconditionally from the calling thread.
    ///
    /// `thread` must not be running a mark of its own while this one is alive.
    pub fn mark_thread(&self, thread: &Arc<ThreadContext>) -> StackTraceMark {
        self.mark_with(Target::Thread(thread), Gate::Always)
    }

    /// Marks the calling thread's stack if `kind` has stack traces enabled.
    pub fn mark_event(&self, kind: EventKindId) -> StackTraceMark {
        self.mark_with(Target::Current, Gate::Event(kind))
    }

    /// Marks `thread`'s slot if `kind` has stack traces enabled.
    ///
    /// `thread` must not be running a mark of its own while this one is alive.
    pub fn mark_event_on_thread(
        &self,
        kind: EventKindId,
        thread: &Arc<ThreadContext>,
    ) -> StackTraceMark {
        self.mark_with(Target::Thread(thread), Gate::Event(kind))
    }

    fn mark_with(&self, target: Target<'_>, gate: Gate) -> StackTraceMark {
        let mode = match gate {
            Gate::Always => WalkMode::Default,
            Gate::Event(kind) => {
                if !self.policy.capture_enabled(kind) {
                    return StackTraceMark::inactive();
                }
                self.policy.walk_mode(kind)
            }
        };
        let thread = match target {
            Target::Current => match ThreadContext::try_current() {
                Some(thread) => thread,
                None => return StackTraceMark::inactive(),
            },
            Target::Thread(thread) => Arc::clone(thread),
        };
        StackTraceMark::activate(thread, &self.store, mode)
    }

    /// The stack identity an event of `kind` committed on `thread` should carry.
    ///
    /// Reuses the identity installed by an enclosing mark when there is one, so
    /// nested and repeated events share a single walk. Records a fresh one
    /// otherwise, without touching the slot.
    pub fn stack_trace_for_event(
        &self,
        kind: EventKindId,
        thread: &ThreadContext,
    ) -> Option<StackIdentity> {
        if !self.policy.capture_enabled(kind) {
            return None;
        }
        if let Some(cached) = thread.cached_stack_trace() {
            return Some(cached);
        }
        Some(self.store.record(thread, 0, self.policy.walk_mode(kind)))
    }
}
