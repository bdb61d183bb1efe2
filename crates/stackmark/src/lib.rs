//! Scoped call-stack identities for recorded runtime events.
//!
//! A recorder that tags events with the stack they were emitted from pays for
//! a stack walk per event. stackmark keeps that cost down: a
//! [`StackTraceMark`] walks the stack once, interns it as a [`StackTraceId`],
//! and parks the resulting identity in the current thread's trace slot. Every
//! event emitted inside the mark's scope reuses that identity instead of
//! walking again. When the mark goes out of scope the slot goes back to what it
//! held before, so nested marks never clobber the identity of an outer one.
//!
//! # Using this crate
//!
//! ```rust,no_run
//! use stackmark::{EventKindId, StackTraceMark, ThreadContext, recorder};
//!
//! const MONITOR_WAIT: EventKindId = EventKindId::new(12);
//!
//! fn wait_on_monitor() {
//!     // Inactive (and free) unless stack traces are enabled for the kind.
//!     let _mark = StackTraceMark::for_event(MONITOR_WAIT);
//!
//!     let stack = ThreadContext::with_current(|thread| {
//!         recorder().stack_trace_for_event(MONITOR_WAIT, thread)
//!     });
//!     // ... write the event with `stack` ...
//! }
//! ```
//!
//! Marks must be dropped in reverse creation order, which scoping gives you
//! for free.
//!
//! # Entry points
//!
//! | Constructor | Target | Gated by event kind |
//! |---|---|---|
//! | [`StackTraceMark::new`] | calling thread | no |
//! | [`StackTraceMark::for_thread`] | given thread | no |
//! | [`StackTraceMark::for_event`] | calling thread | yes |
//! | [`StackTraceMark::for_event_on_thread`] | given thread | yes |
//!
//! The given-thread variants write another thread's slot. The caller must make
//! sure that thread is not running marks of its own meanwhile.
//!
//! # Configuration
//!
//! The process-wide [`recorder`] reads these on first use:
//!
//! | Variable | Effect |
//! |---------|--------|
//! | `STACKMARK_STACK_DEPTH` | Frames walked for `WalkMode::Default` (1..=2048, default 64). |
//! | `STACKMARK_STACKTRACE_EVENTS` | Comma-separated event kinds with stack traces on. |
//! | `STACKMARK_FULL_WALK_EVENTS` | Comma-separated event kinds that walk the whole stack. |
//!
//! Invalid values are reported through `tracing` and replaced by defaults.

pub use stackmark_runtime::*;

pub use stackmark_trace_capture::{TraceCapabilities, trace_capabilities};
