//! Runtime side of stackmark: per-thread trace slots, the scoped
//! [`StackTraceMark`], event capture settings and the stack-trace repository.
//!
//! Most callers only need [`StackTraceMark`]. The [`Recorder`] type exists for
//! code that brings its own [`StackTraceStore`] or [`EventCapturePolicy`].

mod config;
mod mark;
mod recorder;
mod repository;
mod settings;
mod thread;

pub use self::config::{
    ConfigError, FULL_WALK_EVENTS_ENV, RecorderConfig, STACK_DEPTH_ENV, STACKTRACE_EVENTS_ENV,
};
pub use self::mark::StackTraceMark;
pub use self::recorder::{Recorder, recorder};
pub use self::repository::{
    ResolvedFrame, ResolvedStackTrace, StackTraceRepository, StackTraceStore,
};
pub use self::settings::{EventCapturePolicy, EventSetting, EventSettings, MAX_EVENT_KINDS};
pub use self::thread::{ThreadContext, TraceSlot};

pub use stackmark_trace_types::{
    EventKindId, FrameKey, InvariantError, StackFingerprint, StackIdentity, StackTraceId,
    StackTraceRecord, ThreadId, WalkMode,
};
