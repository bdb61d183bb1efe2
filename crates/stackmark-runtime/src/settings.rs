//! Per-event-kind stack capture settings.

use stackmark_trace_types::{EventKindId, InvariantError, WalkMode};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::config::RecorderConfig;

/// Number of distinct event kinds the settings table can describe.
pub const MAX_EVENT_KINDS: usize = 512;

/// Answers whether an event kind wants stack traces, and how deep.
///
/// Both lookups sit on the path of every event-gated mark, including the
/// disabled case, so implementations must be cheap and side-effect free.
pub trait EventCapturePolicy: Send + Sync {
    fn capture_enabled(&self, kind: EventKindId) -> bool;
    fn walk_mode(&self, kind: EventKindId) -> WalkMode;
}

impl<T: EventCapturePolicy + ?Sized> EventCapturePolicy for Arc<T> {
    fn capture_enabled(&self, kind: EventKindId) -> bool {
        (**self).capture_enabled(kind)
    }

    fn walk_mode(&self, kind: EventKindId) -> WalkMode {
        (**self).walk_mode(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventSetting {
    pub stack_trace: bool,
    pub walk_mode: WalkMode,
}

#[derive(Debug, Default)]
struct SettingSlot {
    stack_trace: AtomicBool,
    walk_mode: AtomicU8,
}

/// Lock-free table of [`EventSetting`]s indexed by [`EventKindId`].
///
/// Kinds outside the table read as "no stack trace" and cannot be configured.
#[derive(Debug)]
pub struct EventSettings {
    slots: Box<[SettingSlot]>,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSettings {
    /// Every kind starts with stack traces off and the default walk mode.
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_EVENT_KINDS).map(|_| SettingSlot::default()).collect(),
        }
    }

    pub fn from_config(config: &RecorderConfig) -> Self {
        let settings = Self::new();
        for &kind in &config.stack_trace_events {
            if let Some(slot) = settings.slot(kind) {
                slot.stack_trace.store(true, Ordering::Relaxed);
            }
        }
        for &kind in &config.full_walk_events {
            if let Some(slot) = settings.slot(kind) {
                slot.walk_mode.store(WalkMode::Full.as_u8(), Ordering::Relaxed);
            }
        }
        settings
    }

    fn slot(&self, kind: EventKindId) -> Option<&SettingSlot> {
        self.slots.get(kind.index())
    }

    fn slot_checked(&self, kind: EventKindId) -> Result<&SettingSlot, InvariantError> {
        self.slot(kind).ok_or(InvariantError::IdOutOfRange {
            field: "event_kind",
            max: (MAX_EVENT_KINDS - 1) as u64,
            got: u64::from(kind.get()),
        })
    }

    pub fn get(&self, kind: EventKindId) -> EventSetting {
        EventSetting {
            stack_trace: self.capture_enabled(kind),
            walk_mode: self.walk_mode(kind),
        }
    }

    pub fn set_stack_trace(&self, kind: EventKindId, enabled: bool) -> Result<(), InvariantError> {
        self.slot_checked(kind)?
            .stack_trace
            .store(enabled, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_walk_mode(&self, kind: EventKindId, mode: WalkMode) -> Result<(), InvariantError> {
        self.slot_checked(kind)?
            .walk_mode
            .store(mode.as_u8(), Ordering::Relaxed);
        Ok(())
    }

    pub fn configure(
        &self,
        kind: EventKindId,
        setting: EventSetting,
    ) -> Result<(), InvariantError> {
        let slot = self.slot_checked(kind)?;
        slot.walk_mode.store(setting.walk_mode.as_u8(), Ordering::Relaxed);
        slot.stack_trace.store(setting.stack_trace, Ordering::Relaxed);
        Ok(())
    }

    pub fn reset(&self) {
        for slot in self.slots.iter() {
            slot.stack_trace.store(false, Ordering::Relaxed);
            slot.walk_mode.store(WalkMode::Default.as_u8(), Ordering::Relaxed);
        }
    }
}

impl EventCapturePolicy for EventSettings {
    #[inline]
    fn capture_enabled(&self, kind: EventKindId) -> bool {
        self.slot(kind)
            .is_some_and(|slot| slot.stack_trace.load(Ordering::Relaxed))
    }

    #[inline]
    fn walk_mode(&self, kind: EventKindId) -> WalkMode {
        self.slot(kind)
            .map_or(WalkMode::Default, |slot| {
                WalkMode::from_u8(slot.walk_mode.load(Ordering::Relaxed))
            })
    }
}
