//! Process-wide interning of captured stack traces.

use parking_lot::Mutex;
use stackmark_trace_capture::{
    MAX_STACK_DEPTH, WalkOptions, fingerprint_frames, resolve_module, walk_current,
};
use stackmark_trace_types::{
    FrameKey, ModulePath, StackFingerprint, StackIdentity, StackTraceId, StackTraceRecord,
    ThreadId, WalkMode,
};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

use crate::config::RecorderConfig;
use crate::thread::ThreadContext;

/// Produces stack identities for a thread.
///
/// `hint` is the number of extra innermost frames to leave out. Implementations
/// must be callable from many threads at once and must absorb their own
/// failures: the returned identity is always usable.
pub trait StackTraceStore: Send + Sync {
    fn record(&self, thread: &ThreadContext, hint: u32, mode: WalkMode) -> StackIdentity;
}

impl<T: StackTraceStore + ?Sized> StackTraceStore for Arc<T> {
    #[inline]
    fn record(&self, thread: &ThreadContext, hint: u32, mode: WalkMode) -> StackIdentity {
        (**self).record(thread, hint, mode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub ip: u64,
    pub module: Option<ModulePath>,
    /// `ip` relative to the module's load address.
    pub rel_pc: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStackTrace {
    pub record: StackTraceRecord,
    pub frames: Vec<ResolvedFrame>,
}

/// `StackTraceRepository::record` itself, which sits between the walker and
/// the caller.
const RECORD_FRAMES: usize = 1;

#[derive(Debug, Default)]
struct RepositoryState {
    traces: BTreeMap<StackTraceId, StackTraceRecord>,
    by_fingerprint: HashMap<StackFingerprint, Vec<StackTraceId>>,
    next_id: u64,
}

impl RepositoryState {
    fn intern(
        &mut self,
        thread: ThreadId,
        mode: WalkMode,
        frames: Vec<FrameKey>,
        truncated: bool,
    ) -> (StackIdentity, bool) {
        let fingerprint = fingerprint_frames(&frames, mode, truncated);

        if let Some(ids) = self.by_fingerprint.get(&fingerprint) {
            let existing = ids
                .iter()
                .filter_map(|id| self.traces.get(id))
                .find(|record| {
                    record.mode == mode && record.truncated == truncated && record.frames == frames
                });
            if let Some(record) = existing {
                return (record.identity(), false);
            }
        }

        self.next_id += 1;
        let id = StackTraceId::new(self.next_id)
            .expect("invariant violated: stack trace id counter exhausted");
        let record = StackTraceRecord {
            id,
            fingerprint,
            mode,
            thread,
            frames,
            truncated,
        };
        let identity = record.identity();
        self.traces.insert(id, record);
        self.by_fingerprint.entry(fingerprint).or_default().push(id);
        (identity, true)
    }
}

/// Interns stacks walked on the calling thread.
///
/// Identical frames walked under the same mode come back with the same id.
/// Unwinding another thread's stack is not portable, so a capture made on
/// behalf of another thread walks the caller's stack and attributes the
/// result to the target thread.
#[derive(Debug)]
pub struct StackTraceRepository {
    stack_depth: NonZeroUsize,
    state: Mutex<RepositoryState>,
}

impl Default for StackTraceRepository {
    fn default() -> Self {
        Self::from_config(&RecorderConfig::default())
    }
}

impl StackTraceRepository {
    pub fn new(stack_depth: NonZeroUsize) -> Self {
        Self {
            stack_depth,
            state: Mutex::new(RepositoryState::default()),
        }
    }

    pub fn from_config(config: &RecorderConfig) -> Self {
        Self::new(config.stack_depth)
    }

    pub fn stack_depth(&self) -> NonZeroUsize {
        self.stack_depth
    }

    fn max_frames(&self, mode: WalkMode) -> NonZeroUsize {
        match mode {
            WalkMode::Default => self.stack_depth,
            WalkMode::Full => NonZeroUsize::new(MAX_STACK_DEPTH).unwrap_or(self.stack_depth),
        }
    }

    pub fn get(&self, id: StackTraceId) -> Option<StackTraceRecord> {
        self.state.lock().traces.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All interned traces, ordered by id.
    pub fn snapshot(&self) -> Vec<StackTraceRecord> {
        self.state.lock().traces.values().cloned().collect()
    }

    /// Looks up a trace and annotates each frame with the module it belongs to.
    /// Frames whose module cannot be found keep only their raw address.
    pub fn resolve(&self, id: StackTraceId) -> Option<ResolvedStackTrace> {
        let record = self.get(id)?;
        let frames = record
            .frames
            .iter()
            .map(|frame| match resolve_module(frame.ip) {
                Ok(module) => ResolvedFrame {
                    ip: frame.ip,
                    rel_pc: Some(frame.ip - module.runtime_base),
                    module: Some(module.path),
                },
                Err(_) => ResolvedFrame {
                    ip: frame.ip,
                    module: None,
                    rel_pc: None,
                },
            })
            .collect();
        Some(ResolvedStackTrace { record, frames })
    }

    /// Drops every interned trace. Ids handed out before the clear are never
    /// handed out again.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let dropped = state.traces.len();
        state.traces.clear();
        state.by_fingerprint.clear();
        debug!(dropped, "stack trace repository cleared");
    }
}

impl StackTraceStore for StackTraceRepository {
    #[inline(never)]
    fn record(&self, thread: &ThreadContext, hint: u32, mode: WalkMode) -> StackIdentity {
        let walked = walk_current(WalkOptions {
            max_frames: self.max_frames(mode),
            skip_frames: RECORD_FRAMES + hint as usize,
        });
        let (frames, truncated) = match walked {
            Ok(stack) => (stack.frames, stack.truncated),
            Err(error) => {
                debug!(
                    %error,
                    thread = %thread.id(),
                    ?mode,
                    "stack walk failed, recording unknown stack"
                );
                (Vec::new(), false)
            }
        };

        let frame_count = frames.len();
        let (identity, inserted) = self
            .state
            .lock()
            .intern(thread.id(), mode, frames, truncated);
        if inserted {
            debug!(
                id = %identity.id,
                fingerprint = identity.fingerprint.get(),
                frames = frame_count,
                truncated,
                ?mode,
                thread = %thread.id(),
                "interned stack trace"
            );
        }
        identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repository(depth: usize) -> StackTraceRepository {
        StackTraceRepository::new(NonZeroUsize::new(depth).expect("non-zero depth"))
    }

    #[test]
    fn same_call_site_reuses_the_identity() {
        let repo = repository(64);
        let thread = ThreadContext::new(Some("worker"));

        let mut identities = Vec::new();
        for _ in 0..3 {
            identities.push(repo.record(&thread, 0, WalkMode::Default));
        }

        assert_eq!(identities[0], identities[1]);
        assert_eq!(identities[1], identities[2]);
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn different_call_sites_get_different_ids() {
        let repo = repository(64);
        let thread = ThreadContext::new(None);

        let first = repo.record(&thread, 0, WalkMode::Default);
        let second = repo.record(&thread, 0, WalkMode::Default);

        assert_ne!(first.id, second.id);
        assert_ne!(first.id.get(), 0);
        assert_ne!(second.id.get(), 0);
        assert_eq!(repo.len(), 2);
    }

    #[test]
    fn walk_modes_are_interned_separately() {
        let repo = repository(64);
        let thread = ThreadContext::new(None);

        let mut pairs = Vec::new();
        for mode in [WalkMode::Default, WalkMode::Full] {
            pairs.push(repo.record(&thread, 0, mode));
        }

        assert_ne!(pairs[0].id, pairs[1].id);
        let default = repo.get(pairs[0].id).expect("default trace interned");
        let full = repo.get(pairs[1].id).expect("full trace interned");
        assert_eq!(default.mode, WalkMode::Default);
        assert_eq!(full.mode, WalkMode::Full);
    }

    #[inline(never)]
    fn record_from_scheduler(repo: &StackTraceRepository, thread: &ThreadContext) -> StackIdentity {
        repo.record(thread, 0, WalkMode::Default)
    }

    #[inline(never)]
    fn record_from_allocator(repo: &StackTraceRepository, thread: &ThreadContext) -> StackIdentity {
        let thread = std::hint::black_box(thread);
        repo.record(thread, 0, WalkMode::Default)
    }

    #[test]
    fn default_mode_is_bounded_by_stack_depth() {
        let repo = repository(3);
        let thread = ThreadContext::new(None);

        let identity = record_from_scheduler(&repo, &thread);
        let record = repo.get(identity.id).expect("trace interned");

        assert_eq!(record.frames.len(), 3);
        assert!(record.truncated);
        assert_eq!(record.thread, thread.id());
        assert_eq!(record.identity(), identity);

        let again = record_from_scheduler(&repo, &thread);
        let second = repo.get(again.id).expect("trace interned");
        assert_eq!(
            second.frames[0], record.frames[0],
            "innermost frame is the calling function, not the repository"
        );
        assert_ne!(second.frames[1], record.frames[1], "called from two places");
    }

    #[test]
    fn shallow_walks_still_tell_call_sites_apart() {
        for depth in [1, 2] {
            let repo = repository(depth);
            let thread = ThreadContext::new(None);

            let scheduler = record_from_scheduler(&repo, &thread);
            let allocator = record_from_allocator(&repo, &thread);
            assert_ne!(scheduler.id, allocator.id, "depth {depth}");
        }

        let repo = repository(1);
        let thread = ThreadContext::new(None);
        let first = record_from_scheduler(&repo, &thread);
        let again = record_from_scheduler(&repo, &thread);
        assert_eq!(first.id, again.id);
        assert_eq!(repo.len(), 1);
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn innermost_frame_lives_in_the_calling_module() {
        let repo = repository(1);
        let thread = ThreadContext::new(None);

        let identity = record_from_scheduler(&repo, &thread);
        let resolved = repo.resolve(identity.id).expect("trace interned");
        let own = resolve_module(record_from_scheduler as *const () as usize as u64)
            .expect("test code belongs to a loaded module");

        assert_eq!(resolved.frames.len(), 1);
        assert_eq!(resolved.frames[0].module.as_ref(), Some(&own.path));
    }

    #[test]
    fn intern_matches_on_frames_not_only_fingerprint() {
        let mut state = RepositoryState::default();
        let thread = ThreadId::next_process_local().expect("thread id");
        let frames = vec![FrameKey { ip: 0x10 }, FrameKey { ip: 0x20 }];

        let (first, inserted) = state.intern(thread, WalkMode::Default, frames.clone(), false);
        assert!(inserted);
        let (again, inserted) = state.intern(thread, WalkMode::Default, frames, false);
        assert!(!inserted);
        assert_eq!(first, again);

        let (other, inserted) =
            state.intern(thread, WalkMode::Default, vec![FrameKey { ip: 0x30 }], false);
        assert!(inserted);
        assert_ne!(other.id, first.id);
    }

    #[test]
    fn clear_never_reuses_ids() {
        let repo = repository(64);
        let thread = ThreadContext::new(None);

        let before = repo.record(&thread, 0, WalkMode::Default);
        repo.clear();
        assert!(repo.is_empty());
        assert_eq!(repo.get(before.id), None);

        let after = repo.record(&thread, 0, WalkMode::Default);
        assert!(after.id > before.id);
    }

    #[test]
    fn snapshot_is_ordered_and_resolve_keeps_every_frame() {
        let repo = repository(8);
        let thread = ThreadContext::new(None);

        let a = repo.record(&thread, 0, WalkMode::Default);
        let b = repo.record(&thread, 0, WalkMode::Full);

        let ids: Vec<_> = repo.snapshot().into_iter().map(|record| record.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);

        let resolved = repo.resolve(a.id).expect("trace interned");
        assert_eq!(resolved.frames.len(), resolved.record.frames.len());
        for frame in &resolved.frames {
            if let Some(rel_pc) = frame.rel_pc {
                assert!(rel_pc <= frame.ip);
                assert!(frame.module.is_some());
            }
        }
    }
}
