use stackmark_trace_capture::{DEFAULT_STACK_DEPTH, MAX_STACK_DEPTH};
use stackmark_trace_types::EventKindId;
use std::error::Error;
use std::fmt;
use std::num::NonZeroUsize;
use tracing::warn;

use crate::settings::MAX_EVENT_KINDS;

pub const STACK_DEPTH_ENV: &str = "STACKMARK_STACK_DEPTH";
pub const STACKTRACE_EVENTS_ENV: &str = "STACKMARK_STACKTRACE_EVENTS";
pub const FULL_WALK_EVENTS_ENV: &str = "STACKMARK_FULL_WALK_EVENTS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderConfig {
    /// Frames walked under `WalkMode::Default`.
    pub stack_depth: NonZeroUsize,
    /// Event kinds with stack traces enabled at startup.
    pub stack_trace_events: Vec<EventKindId>,
    /// Event kinds that walk the full stack.
    pub full_walk_events: Vec<EventKindId>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            stack_depth: NonZeroUsize::new(DEFAULT_STACK_DEPTH)
                .expect("invariant violated: default stack depth must be non-zero"),
            stack_trace_events: Vec::new(),
            full_walk_events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidNumber {
        key: &'static str,
        value: String,
    },
    DepthOutOfRange {
        key: &'static str,
        max: usize,
        got: usize,
    },
    InvalidEventKind {
        key: &'static str,
        value: String,
        max: usize,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNumber { key, value } => {
                write!(f, "{key}: expected an unsigned integer, got {value:?}")
            }
            Self::DepthOutOfRange { key, max, got } => {
                write!(f, "{key}: stack depth must be in 1..={max}, got {got}")
            }
            Self::InvalidEventKind { key, value, max } => {
                write!(f, "{key}: event kind must be an integer below {max}, got {value:?}")
            }
        }
    }
}

impl Error for ConfigError {}

impl RecorderConfig {
    /// Builds a config from any key lookup. Unset or blank keys keep their
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = non_blank(lookup(STACK_DEPTH_ENV)) {
            config.stack_depth = parse_depth(STACK_DEPTH_ENV, &value)?;
        }
        if let Some(value) = non_blank(lookup(STACKTRACE_EVENTS_ENV)) {
            config.stack_trace_events = parse_event_kinds(STACKTRACE_EVENTS_ENV, &value)?;
        }
        if let Some(value) = non_blank(lookup(FULL_WALK_EVENTS_ENV)) {
            config.full_walk_events = parse_event_kinds(FULL_WALK_EVENTS_ENV, &value)?;
        }

        Ok(config)
    }

    /// Reads the process environment, falling back to defaults on bad input.
    pub fn from_env() -> Self {
        match Self::from_lookup(|key| std::env::var(key).ok()) {
            Ok(config) => config,
            Err(error) => {
                warn!(%error, "invalid stackmark configuration, using defaults");
                Self::default()
            }
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn parse_depth(key: &'static str, value: &str) -> Result<NonZeroUsize, ConfigError> {
    let depth: usize = value.parse().map_err(|_| ConfigError::InvalidNumber {
        key,
        value: value.to_owned(),
    })?;
    if depth > MAX_STACK_DEPTH {
        return Err(ConfigError::DepthOutOfRange {
            key,
            max: MAX_STACK_DEPTH,
            got: depth,
        });
    }
    NonZeroUsize::new(depth).ok_or(ConfigError::DepthOutOfRange {
        key,
        max: MAX_STACK_DEPTH,
        got: depth,
    })
}

fn parse_event_kinds(key: &'static str, value: &str) -> Result<Vec<EventKindId>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<u16>()
                .ok()
                .filter(|&kind| usize::from(kind) < MAX_EVENT_KINDS)
                .map(EventKindId::new)
                .ok_or_else(|| ConfigError::InvalidEventKind {
                    key,
                    value: item.to_owned(),
                    max: MAX_EVENT_KINDS,
                })
        })
        .collect()
}
