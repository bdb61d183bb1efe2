use facet::Facet;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    ZeroId(&'static str),
    IdOutOfRange {
        field: &'static str,
        max: u64,
        got: u64,
    },
    EmptyField(&'static str),
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroId(field) => write!(f, "{field} must be non-zero"),
            Self::IdOutOfRange { field, max, got } => {
                write!(f, "{field} must be <= {max}, got {got}")
            }
            Self::EmptyField(field) => write!(f, "{field} must be non-empty"),
        }
    }
}

impl Error for InvariantError {}

pub const JS_SAFE_INT_MAX_U64: u64 = (1u64 << 53) - 1;

macro_rules! define_u64_id {
    (
        $(#[$meta:meta])*
        $name:ident,
        field = $field:literal
        , max = $max:expr
    ) => {
        #[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[facet(transparent)]
        $(#[$meta])*
        pub struct $name(u64);

        impl $name {
            pub fn new(value: u64) -> Result<Self, InvariantError> {
                if value == 0 {
                    return Err(InvariantError::ZeroId($field));
                }
                if value > $max {
                    return Err(InvariantError::IdOutOfRange {
                        field: $field,
                        max: $max,
                        got: value,
                    });
                }
                Ok(Self(value))
            }

            pub fn next_process_local() -> Result<Self, InvariantError> {
                static NEXT_COUNTER: AtomicU64 = AtomicU64::new(1);
                let counter = NEXT_COUNTER.fetch_add(1, Ordering::Relaxed);
                Self::new(counter)
            }

            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_u64_id!(
    /// Identifier of an interned stack trace. Never zero: the raw value 0 is
    /// reserved to mean "no stack trace".
    StackTraceId,
    field = "stack_trace_id",
    max = JS_SAFE_INT_MAX_U64
);
define_u64_id!(
    /// Process-unique identifier of a registered thread context.
    ThreadId,
    field = "thread_id",
    max = JS_SAFE_INT_MAX_U64
);

/// Cheap hash of a captured stack. Only meaningful to the store that produced it.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[facet(transparent)]
pub struct StackFingerprint(u64);

impl StackFingerprint {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// The `(id, fingerprint)` pair that tags an event with its call stack.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackIdentity {
    pub id: StackTraceId,
    pub fingerprint: StackFingerprint,
}

impl StackIdentity {
    pub fn new(id: StackTraceId, fingerprint: StackFingerprint) -> Self {
        Self { id, fingerprint }
    }

    /// Rebuilds an identity from its raw words. A zero id is the sentinel and
    /// yields `None`.
    pub fn from_raw_parts(id: u64, fingerprint: u64) -> Option<Self> {
        let id = StackTraceId::new(id).ok()?;
        Some(Self::new(id, StackFingerprint::new(fingerprint)))
    }

    pub fn into_raw_parts(self) -> (u64, u64) {
        (self.id.get(), self.fingerprint.get())
    }
}

/// How much of the stack a capture walks.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum WalkMode {
    /// Bounded by the configured stack depth.
    #[default]
    Default,
    /// Walks up to the hard maximum depth.
    Full,
}

impl WalkMode {
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Default => 0,
            Self::Full => 1,
        }
    }

    /// Unknown encodings decode as `Default`.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Full,
            _ => Self::Default,
        }
    }
}

/// Names a kind of recorded event.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[facet(transparent)]
pub struct EventKindId(u16);

impl EventKindId {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u16 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EventKindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Facet, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModulePath(String);

impl ModulePath {
    pub fn new(value: impl Into<String>) -> Result<Self, InvariantError> {
        let value = value.into();
        if value.is_empty() {
            return Err(InvariantError::EmptyField("module_path"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameKey {
    pub ip: u64,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct StackTraceRecord {
    pub id: StackTraceId,
    pub fingerprint: StackFingerprint,
    pub mode: WalkMode,
    /// Thread the capture was attributed to when the trace was first interned.
    pub thread: ThreadId,
    /// Innermost frame first. Empty when the walk produced nothing.
    pub frames: Vec<FrameKey>,
    /// The walk stopped at its depth limit before reaching the outermost frame.
    pub truncated: bool,
}

impl StackTraceRecord {
    pub fn identity(&self) -> StackIdentity {
        StackIdentity::new(self.id, self.fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_trace_id_rejects_zero() {
        let err = StackTraceId::new(0).expect_err("zero id must fail");
        assert!(matches!(err, InvariantError::ZeroId("stack_trace_id")));
    }

    #[test]
    fn stack_trace_id_rejects_values_above_js_safe_max() {
        let err = StackTraceId::new(JS_SAFE_INT_MAX_U64 + 1).expect_err("id must be JS-safe");
        assert!(matches!(
            err,
            InvariantError::IdOutOfRange {
                field: "stack_trace_id",
                max: JS_SAFE_INT_MAX_U64,
                got
            } if got > JS_SAFE_INT_MAX_U64
        ));
    }

    #[test]
    fn process_local_thread_ids_are_distinct() {
        let a = ThreadId::next_process_local().expect("first thread id");
        let b = ThreadId::next_process_local().expect("second thread id");
        assert_ne!(a, b);
        assert_ne!(a.get(), 0);
    }

    #[test]
    fn zero_raw_id_is_the_sentinel() {
        assert_eq!(StackIdentity::from_raw_parts(0, 0xdead), None);

        let identity = StackIdentity::from_raw_parts(7, 0xbeef).expect("non-zero id");
        assert_eq!(identity.id.get(), 7);
        assert_eq!(identity.into_raw_parts(), (7, 0xbeef));
    }

    #[test]
    fn module_path_rejects_empty() {
        let err = ModulePath::new("").expect_err("empty path must fail");
        assert_eq!(err, InvariantError::EmptyField("module_path"));
        let path = ModulePath::new("/usr/lib/libfoo.so").expect("path");
        assert_eq!(path.as_str(), "/usr/lib/libfoo.so");
    }

    #[test]
    fn walk_mode_decodes_unknown_values_as_default() {
        assert_eq!(WalkMode::from_u8(WalkMode::Full.as_u8()), WalkMode::Full);
        assert_eq!(WalkMode::from_u8(WalkMode::Default.as_u8()), WalkMode::Default);
        assert_eq!(WalkMode::from_u8(42), WalkMode::Default);
    }
}
